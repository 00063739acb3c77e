//! Incremental construction of the TensorFlow graph.
//!
//! ONNX values are tracked as [`Value`]s: either a tensor known at conversion time,
//! or a [`Wire`], the output of a TensorFlow node. Rank 4 wires may be stored
//! channels-last while keeping their logical (NCHW) shape, layout changes being
//! inserted lazily when an operator needs the other one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, ensure};
use tract_onnx::pb::NodeProto;
use tract_onnx::prelude::*;
use tract_tensorflow::tfpb;
use tfpb::tensorflow::{DataType, GraphDef, NodeDef};

use super::naming::{NamePolicy, Namer};
use super::onnx::{NodeProtoExt, permute};
use crate::graph;
use crate::summary::LayerInfo;

/// NCHW to NHWC.
pub const TO_CHANNELS_LAST: [usize; 4] = [0, 2, 3, 1];
/// NHWC to NCHW.
pub const TO_NATIVE: [usize; 4] = [0, 3, 1, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    Native,
    ChannelsLast,
}

#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct Wire {
    pub node: String,
    /// Shape in the source model.
    pub shape: Vec<usize>,
    pub layout: Layout,
}

impl Wire {
    /// Shape of the tensor the TensorFlow node actually produces.
    pub fn physical_shape(&self) -> Vec<usize> {
        match self.layout {
            Layout::ChannelsLast => TO_CHANNELS_LAST.iter().map(|&ax| self.shape[ax]).collect(),
            Layout::Native => self.shape.clone(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Position of a logical axis in the physical tensor.
    pub fn physical_axis(&self, axis: usize) -> usize {
        match self.layout {
            Layout::ChannelsLast => TO_NATIVE[axis],
            Layout::Native => axis,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Static(Arc<Tensor>),
    Wire(Wire),
}

impl Value {
    pub fn shape(&self) -> &[usize] {
        match self {
            Value::Static(t) => t.shape(),
            Value::Wire(w) => &w.shape,
        }
    }

    pub fn as_static(&self) -> Option<&Arc<Tensor>> {
        match self {
            Value::Static(t) => Some(t),
            Value::Wire(_) => None,
        }
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Value {
        Value::Static(Arc::new(t))
    }
}

impl From<Wire> for Value {
    fn from(w: Wire) -> Value {
        Value::Wire(w)
    }
}

/// A layer being converted: a name scope and its parameter counts.
#[derive(Debug)]
pub struct Layer {
    pub name: String,
    pub kind: &'static str,
    source: String,
    op_type: String,
    trainable: usize,
    non_trainable: usize,
}

impl Layer {
    pub fn scoped(&self, suffix: &str) -> String {
        format!("{}/{}", self.name, suffix)
    }
}

/// The nodes setting the value of a variable.
#[derive(Debug, Clone)]
pub struct Weight {
    pub initial_value: String,
    pub assign: String,
    pub value: Tensor,
}

#[derive(Debug)]
pub struct Builder {
    pub opset: i64,
    verbose: bool,
    namer: Namer,
    nodes: Vec<NodeDef>,
    names: HashSet<String>,
    weights: Vec<Weight>,
    layers: Vec<LayerInfo>,
    relayouts: HashMap<(String, Layout), Wire>,
}

impl Builder {
    pub fn new(opset: i64, policy: NamePolicy, verbose: bool, reserved: &[&str]) -> Builder {
        Builder {
            opset,
            verbose,
            namer: Namer::new(policy, reserved),
            nodes: vec![],
            names: HashSet::new(),
            weights: vec![],
            layers: vec![],
            relayouts: HashMap::new(),
        }
    }

    pub fn push(&mut self, node: NodeDef) -> TractResult<String> {
        ensure!(self.names.insert(node.name.clone()), "Duplicate node name {}", node.name);
        let name = node.name.clone();
        self.nodes.push(node);
        Ok(name)
    }

    /// A node name outside of any layer scope.
    pub fn free_name(&self, base: &str) -> String {
        let mut name = base.to_string();
        let mut suffix = 1;
        while self.names.contains(&name) {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        name
    }

    /// Records a layer row that has no parameters and no source node.
    pub fn declare_layer(&mut self, info: LayerInfo) {
        self.layers.push(info);
    }

    pub fn layer(&mut self, node: &NodeProto, kind: &'static str) -> Layer {
        Layer {
            name: self.namer.layer(node),
            kind,
            source: node.display_name().to_string(),
            op_type: node.op_type.clone(),
            trainable: 0,
            non_trainable: 0,
        }
    }

    /// A float operator node in the layer scope.
    pub fn op(&self, layer: &Layer, suffix: &str, op: &str) -> NodeDef {
        tfpb::node().name(layer.scoped(suffix)).op(op).attr("T", DataType::DtFloat)
    }

    /// Declares a variable in the layer scope, returning the name of its read node.
    pub fn weight(
        &mut self,
        layer: &mut Layer,
        name: &str,
        value: Tensor,
        trainable: bool,
    ) -> TractResult<String> {
        let variable = layer.scoped(name);
        let value = value.cast_to::<f32>()?.into_owned();
        self.push(graph::variable(&variable, value.shape()))?;
        let read = self.push(
            tfpb::node()
                .name(format!("{}/read", variable))
                .op("Identity")
                .input(&variable)
                .attr("T", DataType::DtFloat),
        )?;
        let initial_value = self.push(graph::placeholder(
            &format!("{}/initial_value", variable),
            DataType::DtFloat,
            value.shape(),
        ))?;
        let assign = self.push(
            tfpb::node()
                .name(format!("{}/Assign", variable))
                .op("Assign")
                .input(&variable)
                .input(&initial_value)
                .attr("T", DataType::DtFloat)
                .attr("validate_shape", graph::bool_attr(true))
                .attr("use_locking", graph::bool_attr(true)),
        )?;
        if trainable {
            layer.trainable += value.len();
        } else {
            layer.non_trainable += value.len();
        }
        self.weights.push(Weight { initial_value, assign, value });
        Ok(read)
    }

    pub fn konst(&mut self, name: &str, t: &Tensor) -> TractResult<String> {
        let name = self.free_name(name);
        self.push(graph::konst(&name, t)?)
    }

    /// An int32 constant, the way TensorFlow expects shapes, permutations and axes.
    pub fn int_const(
        &mut self,
        name: &str,
        values: &[i64],
        shape: &[usize],
    ) -> TractResult<String> {
        let values: Vec<i32> = values.iter().map(|&v| v as i32).collect();
        self.konst(name, &Tensor::from_shape(shape, &values)?)
    }

    pub fn finish(&mut self, layer: Layer, output: &Wire) {
        let level = if self.verbose { log::Level::Info } else { log::Level::Debug };
        log!(
            level,
            "{} ({}) -> {} ({}) {:?}",
            layer.source,
            layer.op_type,
            layer.name,
            layer.kind,
            output.shape
        );
        self.layers.push(LayerInfo::new(
            layer.name,
            layer.kind.to_string(),
            output.shape.clone(),
            layer.trainable,
            layer.non_trainable,
        ));
    }

    /// Materializes a value as a wire, folding static tensors into `Const` nodes.
    pub fn wire(&mut self, value: &Value, name: &str) -> TractResult<Wire> {
        match value {
            Value::Wire(w) => Ok(w.clone()),
            Value::Static(t) => {
                let t = if t.datum_type() == f32::datum_type() {
                    (**t).clone()
                } else {
                    t.cast_to::<f32>()?.into_owned()
                };
                let node = self.konst(name, &t)?;
                Ok(Wire::new(node, t.shape().to_vec(), Layout::Native))
            }
        }
    }

    fn transpose(&mut self, wire: &Wire, suffix: &str, perm: &[usize]) -> TractResult<String> {
        let name = self.free_name(&format!("{}/{}", wire.node, suffix));
        let perm: Vec<i64> = perm.iter().map(|&p| p as i64).collect();
        let perm = self.int_const(&format!("{}/perm", name), &perm, &[4])?;
        self.push(
            tfpb::node()
                .name(name)
                .op("Transpose")
                .input(&wire.node)
                .input(perm)
                .attr("T", DataType::DtFloat)
                .attr("Tperm", DataType::DtInt32),
        )
    }

    pub fn to_layout(&mut self, wire: &Wire, layout: Layout) -> TractResult<Wire> {
        if wire.layout == layout {
            return Ok(wire.clone());
        }
        if wire.rank() != 4 {
            bail!("Can not change layout of rank {} tensor {}", wire.rank(), wire.node);
        }
        if let Some(done) = self.relayouts.get(&(wire.node.clone(), layout)) {
            return Ok(done.clone());
        }
        let node = match layout {
            Layout::ChannelsLast => self.transpose(wire, "nhwc", &TO_CHANNELS_LAST)?,
            Layout::Native => self.transpose(wire, "nchw", &TO_NATIVE)?,
        };
        let converted = Wire::new(node, wire.shape.clone(), layout);
        self.relayouts.insert((wire.node.clone(), layout), converted.clone());
        Ok(converted)
    }

    pub fn channels_last(&mut self, wire: &Wire) -> TractResult<Wire> {
        self.to_layout(wire, Layout::ChannelsLast)
    }

    pub fn native(&mut self, wire: &Wire) -> TractResult<Wire> {
        self.to_layout(wire, Layout::Native)
    }

    /// A wire whose physical tensor has the elements in NCHW order: either
    /// native, or channels-last with 1x1 spatial dimensions.
    pub fn row_major(&mut self, wire: &Wire) -> TractResult<Wire> {
        if wire.layout == Layout::ChannelsLast && wire.shape[2] == 1 && wire.shape[3] == 1 {
            Ok(wire.clone())
        } else {
            self.native(wire)
        }
    }

    /// A static tensor broadcastable against `wire` in its physical layout.
    pub fn align_static(&self, t: &Tensor, wire: &Wire) -> TractResult<Tensor> {
        let t = t.cast_to::<f32>()?.into_owned();
        if wire.layout == Layout::Native || t.rank() == 0 {
            return Ok(t);
        }
        ensure!(t.rank() <= 4, "Can not broadcast {:?} against rank 4 tensor", t.shape());
        let mut shape = vec![1; 4 - t.rank()];
        shape.extend_from_slice(t.shape());
        permute(&t.into_shape(&shape)?, &TO_CHANNELS_LAST)
    }

    pub fn into_parts(self) -> (GraphDef, Vec<Weight>, Vec<LayerInfo>) {
        let graph = GraphDef { node: self.nodes, ..tfpb::graph() };
        (graph, self.weights, self.layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> Builder {
        Builder::new(13, NamePolicy::Renumerate, false, &["input_0"])
    }

    fn node() -> NodeProto {
        NodeProto { name: "conv".into(), op_type: "Conv".into(), ..NodeProto::default() }
    }

    #[test]
    fn weights_come_with_initializers() {
        let mut b = builder();
        let mut layer = b.layer(&node(), "Conv2D");
        let kernel = Tensor::zero::<f32>(&[3, 3, 2, 4]).unwrap();
        let read = b.weight(&mut layer, "kernel", kernel, true).unwrap();
        let mean = Tensor::zero::<f32>(&[4]).unwrap();
        b.weight(&mut layer, "moving_mean", mean, false).unwrap();
        assert_eq!(read, "LAYER_0/kernel/read");
        let wire = Wire::new(read, vec![1, 4, 5, 5], Layout::ChannelsLast);
        b.finish(layer, &wire);
        let (graph, weights, layers) = b.into_parts();
        let names: Vec<&str> = graph.node.iter().map(|n| &*n.name).collect();
        assert_eq!(
            &names[..4],
            &[
                "LAYER_0/kernel",
                "LAYER_0/kernel/read",
                "LAYER_0/kernel/initial_value",
                "LAYER_0/kernel/Assign"
            ]
        );
        assert_eq!(weights[1].assign, "LAYER_0/moving_mean/Assign");
        assert_eq!((layers[0].trainable, layers[0].non_trainable), (72, 4));
    }

    #[test]
    fn layout_changes_are_shared() {
        let mut b = builder();
        let input = Wire::new("input_0".to_string(), vec![1, 3, 8, 8], Layout::Native);
        let a = b.channels_last(&input).unwrap();
        let c = b.channels_last(&input).unwrap();
        assert_eq!(a, c);
        assert_eq!(a.node, "input_0/nhwc");
        assert_eq!(a.physical_shape(), vec![1, 8, 8, 3]);
        assert_eq!(b.channels_last(&a).unwrap(), a);
        let (graph, _, _) = b.into_parts();
        assert_eq!(graph.node.len(), 2);
    }

    #[test]
    fn static_alignment() {
        let b = builder();
        let wire = Wire::new("x".to_string(), vec![1, 2, 3, 3], Layout::ChannelsLast);
        let bias = Tensor::from_shape(&[2, 1, 1], &[1f32, 2.]).unwrap();
        assert_eq!(b.align_static(&bias, &wire).unwrap().shape(), &[1, 1, 1, 2]);
    }

    #[test]
    fn duplicate_names_are_refused() {
        let mut b = builder();
        b.konst("c", &tensor0(1f32)).unwrap();
        assert!(b.push(graph::konst("c", &tensor0(1f32)).unwrap()).is_err());
        assert_eq!(b.konst("c", &tensor0(1f32)).unwrap(), "c_1");
    }
}
