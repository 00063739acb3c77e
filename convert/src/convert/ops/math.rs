use tract_onnx::pb::NodeProto;
use tract_onnx::prelude::tract_ndarray::{Array1, Ix2};
use tract_onnx::prelude::*;

use super::{OpRegister, input, opt_static, static_input, wire_input};
use crate::convert::builder::{Builder, Layout, Value, Wire};
use crate::convert::fold;
use crate::convert::naming::sanitize;
use crate::convert::onnx::{NodeProtoExt, permute};
use crate::convert::fold::broadcast_shape;

pub fn register_all_ops(reg: &mut OpRegister) {
    reg.insert("Add", binary);
    reg.insert("Div", binary);
    reg.insert("Gemm", gemm);
    reg.insert("MatMul", mat_mul);
    reg.insert("Mul", binary);
    reg.insert("Sub", binary);
}

fn binary(b: &mut Builder, node: &NodeProto, inputs: &[Option<Value>]) -> TractResult<TVec<Value>> {
    let (a, c) = (input(node, inputs, 0)?, input(node, inputs, 1)?);
    if let (Value::Static(a), Value::Static(c)) = (a, c) {
        return Ok(tvec!(fold::binary(&node.op_type, a, c)?.into()));
    }
    let (kind, op) = match &*node.op_type {
        "Add" => ("Add", "Add"),
        "Sub" => ("Subtract", "Sub"),
        "Mul" => ("Multiply", "Mul"),
        _ => ("Lambda", "RealDiv"),
    };
    let shape = broadcast_shape(a.shape(), c.shape())?;
    let (a, c, layout) = match (a, c) {
        (Value::Wire(a), Value::Wire(c)) => {
            let layout = if a.layout == c.layout {
                a.layout
            } else if a.rank() == 4 && c.rank() == 4 {
                Layout::ChannelsLast
            } else {
                Layout::Native
            };
            (b.to_layout(a, layout)?.node, b.to_layout(c, layout)?.node, layout)
        }
        (Value::Wire(w), Value::Static(t)) | (Value::Static(t), Value::Wire(w)) => {
            let w = if w.layout == Layout::ChannelsLast && shape.len() != 4 {
                b.native(w)?
            } else {
                w.clone()
            };
            let aligned = b.align_static(t, &w)?;
            let konst = b.konst(&format!("{}_const", sanitize(node.display_name())), &aligned)?;
            if matches!(a, Value::Static(_)) {
                (konst, w.node, w.layout)
            } else {
                (w.node, konst, w.layout)
            }
        }
        (Value::Static(_), Value::Static(_)) => unreachable!(),
    };
    let layer = b.layer(node, kind);
    let output = b.push(b.op(&layer, op, op).input(a).input(c))?;
    let wire = Wire::new(output, shape, layout);
    b.finish(layer, &wire);
    Ok(tvec!(wire.into()))
}

/// A fully connected layer: `x . kernel + bias` with x a matrix of computed features.
fn dense(
    b: &mut Builder,
    node: &NodeProto,
    x: &Wire,
    kernel: Tensor,
    bias: Option<Tensor>,
) -> TractResult<TVec<Value>> {
    if x.rank() != 2 || kernel.rank() != 2 || x.shape[1] != kernel.shape()[0] {
        return Err(node.unsupported(format!("product of {:?} by {:?}", x.shape, kernel.shape())));
    }
    let units = kernel.shape()[1];
    let mut layer = b.layer(node, "Dense");
    let kernel = b.weight(&mut layer, "kernel", kernel, true)?;
    let mut output = b.push(
        b.op(&layer, "MatMul", "MatMul")
            .input(&x.node)
            .input(kernel)
            .attr("transpose_a", crate::graph::bool_attr(false))
            .attr("transpose_b", crate::graph::bool_attr(false)),
    )?;
    if let Some(bias) = bias {
        let bias = b.weight(&mut layer, "bias", bias, true)?;
        output = b.push(
            b.op(&layer, "BiasAdd", "BiasAdd")
                .input(output)
                .input(bias)
                .attr("data_format", "NHWC"),
        )?;
    }
    let wire = Wire::new(output, vec![x.shape[0], units], Layout::Native);
    b.finish(layer, &wire);
    Ok(tvec!(wire.into()))
}

fn scale(t: &Tensor, factor: f32) -> TractResult<Tensor> {
    let t = t.cast_to::<f32>()?.into_owned();
    if factor == 1.0 {
        return Ok(t);
    }
    Ok(t.into_array::<f32>()?.mapv(|x| x * factor).into_tensor())
}

fn gemm(b: &mut Builder, node: &NodeProto, inputs: &[Option<Value>]) -> TractResult<TVec<Value>> {
    let x = wire_input(b, node, inputs, 0)?;
    if node.get_attr_opt::<i64>("transA")?.unwrap_or(0) != 0 {
        return Err(node.unsupported("transA"));
    }
    let alpha = node.get_attr_opt::<f32>("alpha")?.unwrap_or(1.0);
    let beta = node.get_attr_opt::<f32>("beta")?.unwrap_or(1.0);
    let weights = static_input(node, inputs, 1)?;
    if weights.rank() != 2 {
        return Err(node.unsupported(format!("B of shape {:?}", weights.shape())));
    }
    let kernel = if node.get_attr_opt::<i64>("transB")?.unwrap_or(0) != 0 {
        permute(&*weights.cast_to::<f32>()?, &[1, 0])?
    } else {
        weights.cast_to::<f32>()?.into_owned()
    };
    let kernel = scale(&kernel, alpha)?;
    let units = kernel.shape()[1];
    let bias = match opt_static(node, inputs, 2)? {
        Some(c) => {
            let c = scale(c, beta)?;
            let dims = c.shape().to_vec();
            let c = match &*dims {
                [] | [1] | [1, 1] => {
                    let v = c.as_slice::<f32>()?[0];
                    Array1::from_elem(units, v).into_tensor()
                }
                [n] | [1, n] if *n == units => c.into_shape(&[units])?,
                shape => {
                    let detail = format!("C of shape {:?} for {} units", shape, units);
                    return Err(node.unsupported(detail));
                }
            };
            Some(c)
        }
        None => None,
    };
    let x = b.to_layout(&x, Layout::Native)?;
    dense(b, node, &x, kernel, bias)
}

fn mat_mul(
    b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
) -> TractResult<TVec<Value>> {
    if let (Value::Static(a), Value::Static(c)) = (input(node, inputs, 0)?, input(node, inputs, 1)?)
    {
        let a = a.cast_to::<f32>()?;
        let c = c.cast_to::<f32>()?;
        let a = a.to_array_view::<f32>()?.into_dimensionality::<Ix2>()?;
        let product = a.dot(&c.to_array_view::<f32>()?.into_dimensionality::<Ix2>()?);
        return Ok(tvec!(product.into_tensor().into()));
    }
    let x = wire_input(b, node, inputs, 0)?;
    let kernel = static_input(node, inputs, 1)?.cast_to::<f32>()?.into_owned();
    dense(b, node, &x, kernel, None)
}
