//! The model being converted: an ONNX protobuf, and tract's runnable form of it.

use std::path::Path;

use anyhow::{Context, bail};
use prost::Message;
use tract_onnx::pb::ModelProto;
use tract_onnx::prelude::*;

use crate::harness::InputShape;

#[derive(Debug, Clone)]
pub struct SourceModel {
    pub name: String,
    pub proto: ModelProto,
    pub input_shape: InputShape,
    model: TypedModel,
}

impl SourceModel {
    /// Prepares `proto` for inference on a single image of the given shape.
    pub fn new(
        name: impl Into<String>,
        proto: ModelProto,
        input_shape: InputShape,
    ) -> TractResult<SourceModel> {
        let name = name.into();
        if proto.graph.is_none() {
            bail!("Model {} has no graph", name);
        }
        let model = tract_onnx::onnx()
            .model_for_proto_model(&proto)
            .with_context(|| format!("Loading model {}", name))?
            .with_input_fact(0, f32::fact(input_shape.dims()).into())?
            .into_optimized()
            .with_context(|| format!("Optimizing model {} for input {}", name, input_shape))?;
        info!("Loaded {} ({} nodes once optimized)", name, model.nodes().len());
        Ok(SourceModel { name, proto, input_shape, model })
    }

    pub fn from_bytes(
        name: impl Into<String>,
        bytes: &[u8],
        input_shape: InputShape,
    ) -> TractResult<SourceModel> {
        let name = name.into();
        let proto = ModelProto::decode(bytes)
            .with_context(|| format!("Decoding ONNX protobuf for {}", name))?;
        SourceModel::new(name, proto, input_shape)
    }

    pub fn for_path(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        input_shape: InputShape,
    ) -> TractResult<SourceModel> {
        let bytes = fs_err::read(path.as_ref())?;
        SourceModel::from_bytes(name, &bytes, input_shape)
    }

    /// Opset of the default ONNX domain.
    pub fn opset(&self) -> i64 {
        self.proto
            .opset_import
            .iter()
            .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
            .map(|o| o.version)
            .unwrap_or(1)
    }

    /// Runs the model once, returning its first output.
    pub fn forward(&self, input: &Tensor) -> TractResult<Tensor> {
        if input.shape() != self.input_shape.dims() {
            bail!("Expected input of shape {:?}, got {:?}", self.input_shape.dims(), input.shape());
        }
        let mut outputs = self.model.clone().into_runnable()?.run(tvec!(input.clone().into()))?;
        if outputs.is_empty() {
            bail!("Model {} produced no output", self.name);
        }
        Ok(outputs.remove(0).into_tensor())
    }
}
