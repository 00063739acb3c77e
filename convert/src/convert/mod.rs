//! ONNX to TensorFlow graph translation.
//!
//! The converted graph takes and returns tensors in the source layout (NCHW), but
//! works channels-last inside, the only layout TensorFlow CPU kernels support for
//! convolutions. Weights become variables, set through their `Assign` nodes once the
//! graph is built, so the resulting [`Session`] is ready for inference and freezing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, bail, format_err};
use tract_onnx::prelude::*;
use tract_tensorflow::tfpb::tensorflow::DataType;

use crate::graph;
use crate::harness::InputShape;
use crate::session::Session;
use crate::source::SourceModel;
use crate::summary::{self, LayerInfo};

pub mod builder;
pub mod fold;
pub mod naming;
pub mod onnx;
pub mod ops;

use builder::{Builder, Layout, Value, Wire};
pub use naming::NamePolicy;
use onnx::NodeProtoExt;

/// Name of the placeholder the converted model is fed through.
pub const INPUT_NAME: &str = "input_0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    UnsupportedOp { node: String, op: String },
    UnsupportedAttribute { node: String, op: String, detail: String },
}

impl fmt::Display for ConvertError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConvertError::UnsupportedOp { node, op } => {
                write!(f, "Unsupported operator {} (node {})", op, node)
            }
            ConvertError::UnsupportedAttribute { node, op, detail } => {
                write!(f, "Unsupported configuration for {} (node {}): {}", op, node, detail)
            }
        }
    }
}

impl std::error::Error for ConvertError {}

#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct ConvertOptions {
    /// (C, H, W) of the single image the model runs on.
    pub input_shape: InputShape,
    /// Log every converted layer at info level.
    pub verbose: bool,
    pub name_policy: NamePolicy,
}

#[derive(Debug, Clone)]
pub struct ConvertedModel {
    pub session: Session,
    pub input_name: String,
    pub input_shape: InputShape,
    pub output_names: Vec<String>,
    pub layers: Vec<LayerInfo>,
}

impl ConvertedModel {
    /// Runs the converted graph on a NCHW input, returning the first output.
    pub fn predict(&mut self, input: &Tensor) -> TractResult<Tensor> {
        if input.shape() != self.input_shape.dims() {
            bail!("Expected input of shape {:?}, got {:?}", self.input_shape.dims(), input.shape());
        }
        let fetch =
            self.output_names.first().ok_or_else(|| format_err!("Converted model has no output"))?;
        let mut outputs = self.session.run([(self.input_name.clone(), input.clone())], &[fetch])?;
        let output = outputs.remove(0);
        Ok(Arc::try_unwrap(output).unwrap_or_else(|shared| (*shared).clone()))
    }

    pub fn summary(&self) -> String {
        summary::render(&self.layers)
    }

    pub fn trainable_params(&self) -> usize {
        self.layers.iter().map(|l| l.trainable).sum()
    }

    pub fn non_trainable_params(&self) -> usize {
        self.layers.iter().map(|l| l.non_trainable).sum()
    }
}

pub fn convert(source: &SourceModel, options: &ConvertOptions) -> TractResult<ConvertedModel> {
    if options.input_shape != source.input_shape {
        bail!(
            "Converting for input {} but {} was prepared for {}",
            options.input_shape,
            source.name,
            source.input_shape
        );
    }
    let onnx_graph = source
        .proto
        .graph
        .as_ref()
        .ok_or_else(|| format_err!("Model {} has no graph", source.name))?;
    let mut reg = ops::OpRegister::default();
    ops::register_all_ops(&mut reg);
    let mut b = Builder::new(source.opset(), options.name_policy, options.verbose, &[INPUT_NAME]);

    let mut values: HashMap<String, Value> = HashMap::new();
    for init in &onnx_graph.initializer {
        let tensor = tract_onnx::tensor::load_tensor(&*tract_onnx::data_resolver::default(), init, None)
            .with_context(|| format!("Loading initializer {}", init.name))?;
        values.insert(init.name.clone(), tensor.into());
    }
    let input = onnx_graph
        .input
        .iter()
        .find(|i| !values.contains_key(&i.name))
        .ok_or_else(|| format_err!("Model {} has no input", source.name))?;
    let shape = options.input_shape.dims().to_vec();
    b.push(graph::placeholder(INPUT_NAME, DataType::DtFloat, &shape))?;
    let input_layer =
        LayerInfo::new(INPUT_NAME.to_string(), "InputLayer".to_string(), shape.clone(), 0, 0);
    b.declare_layer(input_layer);
    let input_wire = Wire::new(INPUT_NAME.to_string(), shape, Layout::Native);
    values.insert(input.name.clone(), input_wire.into());

    for node in &onnx_graph.node {
        let converter = reg
            .get(&node.op_type)
            .filter(|_| node.domain.is_empty() || node.domain == "ai.onnx")
            .ok_or_else(|| ConvertError::UnsupportedOp {
                node: node.display_name().to_string(),
                op: node.op_type.clone(),
            })?;
        let inputs = node
            .input
            .iter()
            .map(|name| {
                if name.is_empty() {
                    Ok(None)
                } else {
                    values.get(name).cloned().map(Some).ok_or_else(|| {
                        format_err!("Node {} uses undefined value {}", node.display_name(), name)
                    })
                }
            })
            .collect::<TractResult<Vec<_>>>()?;
        let outputs = converter(&mut b, node, &inputs).with_context(|| {
            format!("Converting node {} ({})", node.display_name(), node.op_type)
        })?;
        for (name, value) in node.output.iter().zip(outputs) {
            if !name.is_empty() {
                values.insert(name.clone(), value);
            }
        }
    }

    let mut output_names = vec![];
    for (ix, output) in onnx_graph.output.iter().enumerate() {
        let value = values
            .get(&output.name)
            .ok_or_else(|| {
                format_err!("Model output {} is not computed by any node", output.name)
            })?;
        let wire = match value {
            Value::Wire(w) if w.layout == Layout::ChannelsLast => b.native(w)?,
            value => b.wire(value, &format!("output_{}", ix))?,
        };
        output_names.push(wire.node);
    }

    let (graph_def, weights, layers) = b.into_parts();
    let node_count = graph_def.node.len();
    let mut session = Session::new(graph_def)?;
    if !weights.is_empty() {
        let assigns: Vec<&str> = weights.iter().map(|w| &*w.assign).collect();
        let feeds: Vec<(String, Tensor)> =
            weights.iter().map(|w| (w.initial_value.clone(), w.value.clone())).collect();
        session.run(feeds, &assigns).context("Setting weights")?;
    }
    info!(
        "Converted {} into {} TensorFlow nodes ({} variables, {} layers)",
        source.name,
        node_count,
        weights.len(),
        layers.len()
    );
    Ok(ConvertedModel {
        session,
        input_name: INPUT_NAME.to_string(),
        input_shape: options.input_shape,
        output_names,
        layers,
    })
}
