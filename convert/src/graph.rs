//! TensorFlow graph definition helpers, on top of the `tfpb` protobuf types.

use std::convert::TryFrom;

use anyhow::{Context, bail, format_err};
use tract_onnx::prelude::*;
use tract_tensorflow::tfpb;
use tfpb::tensorflow::attr_value::Value;
use tfpb::tensorflow::tensor_shape_proto::Dim;
use tfpb::tensorflow::{AttrValue, DataType, NodeDef, TensorProto, TensorShapeProto};

pub fn shape_proto(shape: &[usize]) -> TensorShapeProto {
    TensorShapeProto {
        dim: shape.iter().map(|&d| Dim { size: d as i64, name: String::new() }).collect(),
        unknown_rank: false,
    }
}

pub fn bool_attr(b: bool) -> AttrValue {
    AttrValue { value: Some(Value::B(b)) }
}

pub fn data_type(dt: DatumType) -> TractResult<DataType> {
    match dt {
        DatumType::F32 => Ok(DataType::DtFloat),
        DatumType::I32 => Ok(DataType::DtInt32),
        DatumType::I64 => Ok(DataType::DtInt64),
        _ => bail!("No TensorFlow representation for {:?} tensors", dt),
    }
}

/// Serializes a tensor, packing values in `tensor_content` like TensorFlow does for constants.
pub fn tensor_proto(t: &Tensor) -> TractResult<TensorProto> {
    let dtype = data_type(t.datum_type())?;
    let tensor_content: Vec<u8> = match t.datum_type() {
        DatumType::F32 => t.as_slice::<f32>()?.iter().flat_map(|x| x.to_le_bytes()).collect(),
        DatumType::I32 => t.as_slice::<i32>()?.iter().flat_map(|x| x.to_le_bytes()).collect(),
        DatumType::I64 => t.as_slice::<i64>()?.iter().flat_map(|x| x.to_le_bytes()).collect(),
        _ => unreachable!(),
    };
    Ok(TensorProto {
        dtype: dtype as i32,
        tensor_shape: Some(shape_proto(t.shape())),
        tensor_content,
        ..TensorProto::default()
    })
}

pub fn tensor_from_proto(proto: &TensorProto) -> TractResult<Tensor> {
    Tensor::try_from(proto)
}

/// Splits a node input reference into (node name, output slot, is control dependency).
pub fn parse_input(input: &str) -> TractResult<(&str, usize, bool)> {
    if let Some(name) = input.strip_prefix('^') {
        return Ok((name, 0, true));
    }
    match input.split_once(':') {
        Some((name, slot)) => {
            let slot = slot
                .parse::<usize>()
                .with_context(|| format!("Invalid output slot in input {:?}", input))?;
            Ok((name, slot, false))
        }
        None => Ok((input, 0, false)),
    }
}

pub fn placeholder(name: &str, dt: DataType, shape: &[usize]) -> NodeDef {
    tfpb::node().name(name).op("Placeholder").attr("dtype", dt).attr("shape", shape_proto(shape))
}

pub fn konst(name: &str, t: &Tensor) -> TractResult<NodeDef> {
    Ok(tfpb::node()
        .name(name)
        .op("Const")
        .attr("dtype", data_type(t.datum_type())?)
        .attr("value", tensor_proto(t)?))
}

/// A `VariableV2` holding a float tensor.
pub fn variable(name: &str, shape: &[usize]) -> NodeDef {
    tfpb::node()
        .name(name)
        .op("VariableV2")
        .attr("dtype", DataType::DtFloat)
        .attr("shape", shape_proto(shape))
        .attr("container", "")
        .attr("shared_name", "")
}

pub fn node_by_name<'g>(
    graph: &'g tfpb::tensorflow::GraphDef,
    name: &str,
) -> TractResult<&'g NodeDef> {
    graph
        .node
        .iter()
        .find(|n| n.name == name)
        .ok_or_else(|| format_err!("Node {} not found in graph", name))
}
