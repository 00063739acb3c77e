//! A minimal TensorFlow session: a graph definition plus the current value of its variables.
//!
//! `run` behaves like a TensorFlow 1 session. Placeholders come from the feeds,
//! `VariableV2` nodes read the variable store and fetching an `Assign` node writes
//! to it. Everything else is pruned to what the fetches need, variables are
//! substituted by constants, and the result is run by tract's TensorFlow frontend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, bail, format_err};
use tract_onnx::prelude::*;
use tract_tensorflow::tfpb;
use tfpb::tensorflow::{GraphDef, NodeDef};

use crate::graph::{self, parse_input};

#[derive(Clone, Debug)]
pub struct Session {
    graph: GraphDef,
    index: HashMap<String, usize>,
    variables: HashMap<String, Tensor>,
}

impl Session {
    pub fn new(graph: GraphDef) -> TractResult<Session> {
        let mut index = HashMap::new();
        for (ix, node) in graph.node.iter().enumerate() {
            if index.insert(node.name.clone(), ix).is_some() {
                bail!("Duplicate node name {} in graph", node.name);
            }
        }
        let mut successors = vec![vec![]; graph.node.len()];
        let mut pending = vec![0usize; graph.node.len()];
        for (ix, node) in graph.node.iter().enumerate() {
            for input in &node.input {
                let (name, _, _) = parse_input(input)?;
                let prec = *index.get(name).ok_or_else(|| {
                    format_err!("Node {} refers to unknown input {}", node.name, input)
                })?;
                successors[prec].push(ix);
                pending[ix] += 1;
            }
        }
        let mut ready: Vec<usize> = (0..graph.node.len()).filter(|&ix| pending[ix] == 0).collect();
        while let Some(ix) = ready.pop() {
            for &succ in &successors[ix] {
                pending[succ] -= 1;
                if pending[succ] == 0 {
                    ready.push(succ);
                }
            }
        }
        if let Some(ix) = pending.iter().position(|&p| p > 0) {
            bail!("Cycle in graph involving node {}", graph.node[ix].name);
        }
        Ok(Session { graph, index, variables: HashMap::new() })
    }

    pub fn graph(&self) -> &GraphDef {
        &self.graph
    }

    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.index.get(name).map(|&ix| &self.graph.node[ix])
    }

    /// Names of the `VariableV2` nodes, in graph order.
    pub fn global_variables(&self) -> Vec<&str> {
        self.graph.node.iter().filter(|n| n.op == "VariableV2").map(|n| &*n.name).collect()
    }

    /// Current value of a variable, None if it has not been assigned yet.
    pub fn variable(&self, name: &str) -> Option<&Tensor> {
        self.variables.get(name)
    }

    fn read_variable(&self, name: &str) -> TractResult<&Tensor> {
        self.variables
            .get(name)
            .ok_or_else(|| format_err!("Attempting to use uninitialized variable {}", name))
    }

    /// Name of the node behind a feed or fetch reference, which must designate output 0.
    fn resolve<'n>(&self, reference: &'n str, what: &str) -> TractResult<&'n str> {
        let (name, slot, _) = parse_input(reference)?;
        if !self.index.contains_key(name) {
            bail!("{} {} not in graph", what, name);
        }
        if slot != 0 {
            bail!("Can only use output 0 of {}", name);
        }
        Ok(name)
    }

    /// Evaluates `fetches`, feeding nodes from `feeds`.
    ///
    /// Fetching an `Assign` node stores the value of its second input in the
    /// variable named by its first one, and returns that value.
    pub fn run<S: AsRef<str>>(
        &mut self,
        feeds: impl IntoIterator<Item = (S, Tensor)>,
        fetches: &[impl AsRef<str>],
    ) -> TractResult<Vec<Arc<Tensor>>> {
        let mut fed: HashMap<String, Arc<Tensor>> = HashMap::new();
        for (name, tensor) in feeds {
            let name = self.resolve(name.as_ref(), "Fed tensor")?;
            fed.insert(name.to_string(), Arc::new(tensor));
        }
        let mut assigns = vec![];
        let mut wanted = vec![];
        for fetch in fetches {
            let name = self.resolve(fetch.as_ref(), "Fetch")?;
            let node = &self.graph.node[self.index[name]];
            if node.op == "Assign" {
                let (variable, value) = self.assign_operands(node)?;
                assigns.push((variable.to_string(), value.to_string()));
                wanted.push(value.to_string());
            } else {
                wanted.push(name.to_string());
            }
        }
        let values = self.evaluate(&fed, &wanted)?;
        for (variable, value) in assigns {
            let value = &values[&value];
            if let Some(current) = self.variables.get(&variable) {
                if current.shape() != value.shape() {
                    bail!(
                        "Assigning shape {:?} to variable {} of shape {:?}",
                        value.shape(),
                        variable,
                        current.shape()
                    );
                }
            }
            trace!("Assigned {} {:?}", variable, value.shape());
            self.variables.insert(variable, (**value).clone());
        }
        Ok(wanted.iter().map(|name| values[name].clone()).collect())
    }

    /// The variable an `Assign` writes to, and the node providing the value.
    fn assign_operands<'n>(&self, node: &'n NodeDef) -> TractResult<(&'n str, &'n str)> {
        let [target, value, ..] = &*node.input else {
            bail!("Assign {} expects a variable and a value", node.name);
        };
        let (target, _, _) = parse_input(target)?;
        if self.node(target).map(|n| &*n.op) != Some("VariableV2") {
            bail!("Assign {} targets {}, which is not a variable", node.name, target);
        }
        Ok((target, self.resolve(value, "Assigned value")?))
    }

    fn evaluate(
        &self,
        fed: &HashMap<String, Arc<Tensor>>,
        names: &[String],
    ) -> TractResult<HashMap<String, Arc<Tensor>>> {
        let mut values = HashMap::new();
        let mut computed = vec![];
        for name in names {
            if let Some(t) = fed.get(name) {
                values.insert(name.clone(), t.clone());
            } else if self.node(name).is_some_and(|n| n.op == "VariableV2") {
                values.insert(name.clone(), Arc::new(self.read_variable(name)?.clone()));
            } else if !computed.contains(name) {
                computed.push(name.clone());
            }
        }
        if computed.is_empty() {
            return Ok(values);
        }
        let (graph, inputs) = self.executable(fed, &computed)?;
        debug!("Running {} nodes for {:?}", graph.node.len(), computed);
        let mut model = tract_tensorflow::tensorflow().model_for_proto_model(&graph)?;
        model.set_input_names(inputs.iter().map(|(name, _)| name))?;
        model.set_output_names(&computed)?;
        for (ix, (_, t)) in inputs.iter().enumerate() {
            model = model.with_input_fact(ix, InferenceFact::dt_shape(t.datum_type(), t.shape()))?;
        }
        let plan = model
            .into_optimized()
            .and_then(|model| model.into_runnable())
            .with_context(|| format!("Preparing graph for {:?}", computed))?;
        let outputs = plan.run(inputs.iter().map(|(_, t)| (**t).clone().into()).collect())?;
        for (name, output) in computed.into_iter().zip(outputs) {
            values.insert(name, Arc::new(output.into_tensor()));
        }
        Ok(values)
    }

    /// The part of the graph `targets` depend on, ready to run: fed nodes become
    /// placeholders and variables become constants holding their current value.
    fn executable(
        &self,
        fed: &HashMap<String, Arc<Tensor>>,
        targets: &[String],
    ) -> TractResult<(GraphDef, Vec<(String, Arc<Tensor>)>)> {
        let mut keep: HashSet<&str> = HashSet::new();
        let mut todo: Vec<&str> = targets.iter().map(|s| &**s).collect();
        while let Some(name) = todo.pop() {
            if !keep.insert(name) || fed.contains_key(name) {
                continue;
            }
            for input in &self.graph.node[self.index[name]].input {
                todo.push(parse_input(input)?.0);
            }
        }
        let mut inputs = vec![];
        let mut nodes = vec![];
        for node in self.graph.node.iter().filter(|n| keep.contains(&*n.name)) {
            let node = if let Some(t) = fed.get(&node.name) {
                inputs.push((node.name.clone(), t.clone()));
                graph::placeholder(&node.name, graph::data_type(t.datum_type())?, t.shape())
            } else {
                match &*node.op {
                    "Placeholder" => bail!("You must feed a value for placeholder {}", node.name),
                    "VariableV2" => graph::konst(&node.name, self.read_variable(&node.name)?)?,
                    "Assign" => bail!("Assign {} can only be fetched directly", node.name),
                    _ => node.clone(),
                }
            };
            nodes.push(node);
        }
        Ok((GraphDef { node: nodes, ..tfpb::graph() }, inputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{konst, placeholder, variable};
    use tfpb::tensorflow::DataType;

    fn graph() -> GraphDef {
        let float = DataType::DtFloat;
        tfpb::graph()
            .node(placeholder("x", float, &[2]))
            .node(variable("w", &[2]))
            .node(tfpb::node().name("w/read").op("Identity").input("w").attr("T", float))
            .node(placeholder("w/initial_value", float, &[2]))
            .node(tfpb::node().name("w/Assign").op("Assign").input("w").input("w/initial_value"))
            .node(tfpb::node().name("mul").op("Mul").input("x").input("w/read").attr("T", float))
            .node(konst("two", &Tensor::from_shape(&[], &[2f32]).unwrap()).unwrap())
            .node(tfpb::node().name("out").op("Add").input("mul").input("two").attr("T", float))
    }

    fn t(v: &[f32]) -> Tensor {
        Tensor::from_shape(&[v.len()], v).unwrap()
    }

    #[test]
    fn assign_then_read() {
        crate::setup_test_logger();
        let mut session = Session::new(graph()).unwrap();
        assert_eq!(session.global_variables(), vec!["w"]);
        assert!(session.run([("x", t(&[1., 2.]))], &["out"]).is_err());
        session.run([("w/initial_value", t(&[3., 4.]))], &["w/Assign"]).unwrap();
        assert_eq!(session.variable("w"), Some(&t(&[3., 4.])));
        let out = session.run([("x", t(&[1., 2.]))], &["out"]).unwrap();
        assert_eq!(*out[0], t(&[5., 10.]));
    }

    #[test]
    fn assign_initializes_an_unread_variable() {
        let mut session = Session::new(graph()).unwrap();
        let assigned = session.run([("w/initial_value", t(&[1., 1.]))], &["w/Assign"]).unwrap();
        assert_eq!(*assigned[0], t(&[1., 1.]));
        let read = session.run(Vec::<(&str, Tensor)>::new(), &["w/read", "w"]).unwrap();
        assert_eq!(*read[0], t(&[1., 1.]));
        assert_eq!(*read[1], t(&[1., 1.]));
    }

    #[test]
    fn reassignment_keeps_the_shape() {
        let mut session = Session::new(graph()).unwrap();
        session.run([("w/initial_value", t(&[1., 1.]))], &["w/Assign"]).unwrap();
        assert!(session.run([("w/initial_value", t(&[1., 1., 1.]))], &["w/Assign"]).is_err());
        assert_eq!(session.variable("w"), Some(&t(&[1., 1.])));
    }

    #[test]
    fn missing_feed() {
        let mut session = Session::new(graph()).unwrap();
        session.run([("w/initial_value", t(&[3., 4.]))], &["w/Assign"]).unwrap();
        let err = session.run(Vec::<(&str, Tensor)>::new(), &["out"]).unwrap_err();
        assert!(format!("{:?}", err).contains("placeholder x"));
    }

    #[test]
    fn intermediate_nodes_can_be_fed() {
        let mut session = Session::new(graph()).unwrap();
        let out = session.run([("mul", t(&[0., 1.]))], &["out", "mul"]).unwrap();
        assert_eq!(*out[0], t(&[2., 3.]));
        assert_eq!(*out[1], t(&[0., 1.]));
    }

    #[test]
    fn unknown_fetch() {
        let mut session = Session::new(graph()).unwrap();
        assert!(session.run(Vec::<(&str, Tensor)>::new(), &["nope"]).is_err());
    }

    #[test]
    fn dangling_input_is_rejected() {
        let graph = tfpb::graph().node(tfpb::node().name("a").op("Identity").input("b"));
        assert!(Session::new(graph).is_err());
    }

    #[test]
    fn cycles_are_rejected() {
        let graph = tfpb::graph()
            .node(tfpb::node().name("a").op("Identity").input("b"))
            .node(tfpb::node().name("b").op("Identity").input("a"));
        let err = Session::new(graph).unwrap_err();
        assert!(err.to_string().contains("Cycle"));
    }
}
