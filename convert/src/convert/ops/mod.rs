use std::collections::HashMap;
use std::sync::Arc;

use anyhow::format_err;
use tract_onnx::pb::NodeProto;
use tract_onnx::prelude::*;

use super::builder::{Builder, Value, Wire};
use super::naming::sanitize;
use super::onnx::NodeProtoExt;

pub mod array;
pub mod math;
pub mod nn;

/// Converts one ONNX node. Inputs are in node order, `None` for omitted optional inputs.
pub type OpConverter = fn(&mut Builder, &NodeProto, &[Option<Value>]) -> TractResult<TVec<Value>>;

#[derive(Default)]
pub struct OpRegister(HashMap<&'static str, OpConverter>);

impl OpRegister {
    pub fn insert(&mut self, op: &'static str, converter: OpConverter) {
        self.0.insert(op, converter);
    }

    pub fn get(&self, op: &str) -> Option<OpConverter> {
        self.0.get(op).copied()
    }
}

pub fn register_all_ops(reg: &mut OpRegister) {
    array::register_all_ops(reg);
    math::register_all_ops(reg);
    nn::register_all_ops(reg);
}

pub fn opt_input<'a>(inputs: &'a [Option<Value>], ix: usize) -> Option<&'a Value> {
    inputs.get(ix).and_then(|v| v.as_ref())
}

pub fn input<'a>(
    node: &NodeProto,
    inputs: &'a [Option<Value>],
    ix: usize,
) -> TractResult<&'a Value> {
    opt_input(inputs, ix).ok_or_else(|| {
        format_err!("Node {} ({}) is missing input #{}", node.display_name(), node.op_type, ix)
    })
}

pub fn static_input<'a>(
    node: &NodeProto,
    inputs: &'a [Option<Value>],
    ix: usize,
) -> TractResult<&'a Arc<Tensor>> {
    input(node, inputs, ix)?
        .as_static()
        .ok_or_else(|| node.unsupported(format!("input #{} must be known at conversion time", ix)))
}

pub fn opt_static<'a>(
    node: &NodeProto,
    inputs: &'a [Option<Value>],
    ix: usize,
) -> TractResult<Option<&'a Arc<Tensor>>> {
    opt_input(inputs, ix).map(|_| static_input(node, inputs, ix)).transpose()
}

/// Input `ix` as a wire, constants being materialized.
pub fn wire_input(
    b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
    ix: usize,
) -> TractResult<Wire> {
    let value = input(node, inputs, ix)?;
    b.wire(value, &format!("{}_input_{}", sanitize(node.display_name()), ix))
}

pub fn ints(t: &Tensor) -> TractResult<Vec<i64>> {
    Ok(t.cast_to::<i64>()?.as_slice::<i64>()?.to_vec())
}
