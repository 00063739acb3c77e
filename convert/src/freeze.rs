//! Turns the variables of a session into constants.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, bail, format_err};
use tract_onnx::prelude::*;
use tract_tensorflow::tfpb::tensorflow::{GraphDef, NodeDef};

use crate::graph::{self, parse_input};
use crate::session::Session;

/// Nodes needed to compute `outputs`, following data and control inputs, in graph order.
pub fn extract_sub_graph(graph: &GraphDef, outputs: &[impl AsRef<str>]) -> TractResult<GraphDef> {
    let index: HashMap<&str, &NodeDef> = graph.node.iter().map(|n| (&*n.name, n)).collect();
    let mut keep: HashSet<&str> = HashSet::new();
    let mut todo: Vec<&str> = vec![];
    for output in outputs {
        let (name, _, _) = parse_input(output.as_ref())?;
        if !index.contains_key(name) {
            bail!("{} is not in graph", name);
        }
        todo.push(name);
    }
    while let Some(name) = todo.pop() {
        if !keep.insert(name) {
            continue;
        }
        let node = index.get(name).ok_or_else(|| format_err!("{} is not in graph", name))?;
        for input in &node.input {
            todo.push(parse_input(input)?.0);
        }
    }
    let node = graph.node.iter().filter(|n| keep.contains(&*n.name)).cloned().collect();
    Ok(GraphDef { node, ..graph.clone() })
}

/// Freezes the state of a session into a pruned graph.
///
/// Every global variable not in `keep_var_names` becomes a `Const` holding its
/// current value. The variables themselves are kept as outputs, so the result also
/// contains the frozen weights of variables `output_names` do not depend on.
pub fn freeze_session(
    session: &Session,
    keep_var_names: &[impl AsRef<str>],
    output_names: &[impl AsRef<str>],
    clear_devices: bool,
) -> TractResult<GraphDef> {
    let keep: HashSet<&str> = keep_var_names.iter().map(|s| s.as_ref()).collect();
    let variables = session.global_variables();
    let freeze_var_names: HashSet<&str> =
        variables.iter().copied().filter(|v| !keep.contains(v)).collect();
    let mut outputs: Vec<&str> = output_names.iter().map(|s| s.as_ref()).collect();
    outputs.extend(variables.iter().copied());

    let mut input_graph = session.graph().clone();
    if clear_devices {
        for node in &mut input_graph.node {
            node.device.clear();
        }
    }
    let mut frozen = extract_sub_graph(&input_graph, &outputs)?;
    let mut count = 0;
    for node in &mut frozen.node {
        if node.op == "VariableV2" && freeze_var_names.contains(&*node.name) {
            let value = session
                .variable(&node.name)
                .ok_or_else(|| format_err!("Variable {} has no value in session", node.name))?;
            let mut konst = graph::konst(&node.name, value)
                .with_context(|| format!("Converting variable {} to constant", node.name))?;
            konst.device = node.device.clone();
            *node = konst;
            count += 1;
        }
    }
    info!("Froze {} variables.", count);
    Ok(frozen)
}
