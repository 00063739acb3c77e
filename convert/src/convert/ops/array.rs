use tract_onnx::pb::NodeProto;
use tract_onnx::prelude::*;
use tract_tensorflow::tfpb::tensorflow::DataType;

use super::{OpRegister, input, ints, opt_input, static_input};
use crate::convert::builder::{Builder, Layout, TO_CHANNELS_LAST, Value, Wire};
use crate::convert::fold;
use crate::convert::onnx::{self, NodeProtoExt, permute};

pub fn register_all_ops(reg: &mut OpRegister) {
    reg.insert("Cast", cast);
    reg.insert("Concat", concat);
    reg.insert("Constant", constant);
    reg.insert("Dropout", identity);
    reg.insert("Flatten", flatten);
    reg.insert("Gather", gather);
    reg.insert("Identity", identity);
    reg.insert("Reshape", reshape);
    reg.insert("Shape", shape);
    reg.insert("Squeeze", squeeze);
    reg.insert("Transpose", transpose);
    reg.insert("Unsqueeze", unsqueeze);
}

fn identity(
    _b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
) -> TractResult<TVec<Value>> {
    Ok(tvec!(input(node, inputs, 0)?.clone()))
}

fn cast(_b: &mut Builder, node: &NodeProto, inputs: &[Option<Value>]) -> TractResult<TVec<Value>> {
    let dt = onnx::datum_type(node.get_attr::<i32>("to")?)
        .map_err(|e| node.unsupported(e.to_string()))?;
    match input(node, inputs, 0)? {
        Value::Static(t) => Ok(tvec!(t.cast_to_dt(dt)?.into_owned().into())),
        wire @ Value::Wire(_) if dt == DatumType::F32 => Ok(tvec!(wire.clone())),
        Value::Wire(_) => Err(node.unsupported(format!("cast of a computed tensor to {:?}", dt))),
    }
}

fn constant(
    _b: &mut Builder,
    node: &NodeProto,
    _inputs: &[Option<Value>],
) -> TractResult<TVec<Value>> {
    let tensor = if let Some(t) = node.get_attr_opt::<&tract_onnx::pb::TensorProto>("value")? {
        tract_onnx::tensor::load_tensor(&*tract_onnx::data_resolver::default(), t, None)?
    } else if let Some(f) = node.get_attr_opt::<f32>("value_float")? {
        tensor0(f)
    } else if let Some(f) = node.get_attr_opt_slice::<f32>("value_floats")? {
        tensor1(f)
    } else if let Some(i) = node.get_attr_opt::<i64>("value_int")? {
        tensor0(i)
    } else if let Some(i) = node.get_attr_opt_slice::<i64>("value_ints")? {
        tensor1(i)
    } else {
        return Err(node.unsupported("constant without a supported value attribute"));
    };
    Ok(tvec!(tensor.into()))
}

fn shape(_b: &mut Builder, node: &NodeProto, inputs: &[Option<Value>]) -> TractResult<TVec<Value>> {
    let shape = input(node, inputs, 0)?.shape();
    let rank = shape.len() as i64;
    let clamp = |i: i64| (if i < 0 { i + rank } else { i }).clamp(0, rank) as usize;
    let start = clamp(node.get_attr_opt("start")?.unwrap_or(0));
    let end = clamp(node.get_attr_opt("end")?.unwrap_or(rank)).max(start);
    let dims: Vec<i64> = shape[start..end].iter().map(|&d| d as i64).collect();
    Ok(tvec!(tensor1(&dims).into()))
}

fn gather(
    _b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
) -> TractResult<TVec<Value>> {
    let data = static_input(node, inputs, 0)?;
    let indices = static_input(node, inputs, 1)?;
    let axis = onnx::axis(node.get_attr_opt("axis")?.unwrap_or(0), data.rank())?;
    Ok(tvec!(fold::gather(data, indices, axis)?.into()))
}

/// Axes from the attribute before opset 13, from the second input after.
fn axes(b: &Builder, node: &NodeProto, inputs: &[Option<Value>]) -> TractResult<Vec<i64>> {
    if b.opset < 13 {
        Ok(node.get_attr_opt_slice::<i64>("axes")?.map(|a| a.to_vec()).unwrap_or_default())
    } else if opt_input(inputs, 1).is_some() {
        ints(static_input(node, inputs, 1)?)
    } else {
        Ok(vec![])
    }
}

/// Same data, new logical shape.
fn reshape_value(
    b: &mut Builder,
    node: &NodeProto,
    value: &Value,
    shape: Vec<usize>,
    kind: &'static str,
) -> TractResult<Value> {
    let x = match value {
        Value::Static(t) => return Ok(fold::reshape(t, &shape)?.into()),
        Value::Wire(w) => b.row_major(w)?,
    };
    let layer = b.layer(node, kind);
    let dims: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
    let target = b.int_const(&layer.scoped("shape"), &dims, &[dims.len()])?;
    let output = b.push(
        b.op(&layer, "Reshape", "Reshape")
            .input(&x.node)
            .input(target)
            .attr("Tshape", DataType::DtInt32),
    )?;
    let wire = Wire::new(output, shape, Layout::Native);
    b.finish(layer, &wire);
    Ok(wire.into())
}

fn squeeze(
    b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
) -> TractResult<TVec<Value>> {
    let axes = axes(b, node, inputs)?;
    let value = input(node, inputs, 0)?;
    let shape = fold::squeezed(value.shape(), &axes)?;
    Ok(tvec!(reshape_value(b, node, value, shape, "Reshape")?))
}

fn unsqueeze(
    b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
) -> TractResult<TVec<Value>> {
    let axes = axes(b, node, inputs)?;
    let value = input(node, inputs, 0)?;
    let shape = fold::unsqueezed(value.shape(), &axes)?;
    Ok(tvec!(reshape_value(b, node, value, shape, "Reshape")?))
}

fn flatten(
    b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
) -> TractResult<TVec<Value>> {
    let value = input(node, inputs, 0)?;
    let dims = value.shape();
    let rank = dims.len();
    let axis: i64 = node.get_attr_opt("axis")?.unwrap_or(1);
    let axis = if axis == rank as i64 { rank } else { onnx::axis(axis, rank)? };
    let shape = vec![dims[..axis].iter().product(), dims[axis..].iter().product()];
    Ok(tvec!(reshape_value(b, node, value, shape, "Flatten")?))
}

fn reshape(
    b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
) -> TractResult<TVec<Value>> {
    let value = input(node, inputs, 0)?;
    let spec = ints(static_input(node, inputs, 1)?)?;
    let allowzero = node.get_attr_opt::<i64>("allowzero")?.unwrap_or(0) != 0;
    let shape = fold::reshaped(value.shape(), &spec, allowzero)?;
    Ok(tvec!(reshape_value(b, node, value, shape, "Reshape")?))
}

fn transpose(
    b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
) -> TractResult<TVec<Value>> {
    let value = input(node, inputs, 0)?;
    let rank = value.shape().len();
    let perm = node.usizes_or("perm", (0..rank).rev().collect())?;
    let mut sorted = perm.clone();
    sorted.sort();
    if sorted != (0..rank).collect::<Vec<_>>() {
        return Err(node.unsupported(format!("perm {:?} for rank {}", perm, rank)));
    }
    let x = match value {
        Value::Static(t) => return Ok(tvec!(fold::transpose(t, &perm)?.into())),
        Value::Wire(w) => w,
    };
    let shape: Vec<usize> = perm.iter().map(|&ax| x.shape[ax]).collect();
    // permutation of the physical tensor
    let physical: Vec<usize> = perm.iter().map(|&ax| x.physical_axis(ax)).collect();
    if physical.iter().enumerate().all(|(ix, &ax)| ix == ax) {
        return Ok(tvec!(Wire::new(x.node.clone(), shape, Layout::Native).into()));
    }
    let layer = b.layer(node, "Permute");
    let physical: Vec<i64> = physical.iter().map(|&p| p as i64).collect();
    let perm = b.int_const(&layer.scoped("perm"), &physical, &[rank])?;
    let output = b.push(
        b.op(&layer, "transpose", "Transpose")
            .input(&x.node)
            .input(perm)
            .attr("Tperm", DataType::DtInt32),
    )?;
    let wire = Wire::new(output, shape, Layout::Native);
    b.finish(layer, &wire);
    Ok(tvec!(wire.into()))
}

fn concat(
    b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
) -> TractResult<TVec<Value>> {
    let values: Vec<&Value> = inputs.iter().flatten().collect();
    let first = values.first().ok_or_else(|| node.unsupported("no input"))?;
    let rank = first.shape().len();
    let axis = onnx::axis(node.get_attr("axis")?, rank)?;
    let mut shape = first.shape().to_vec();
    shape[axis] = 0;
    for v in &values {
        let compatible = v.shape().len() == rank
            && v.shape().iter().enumerate().all(|(ax, &d)| ax == axis || d == first.shape()[ax]);
        if !compatible {
            let shapes: Vec<&[usize]> = values.iter().map(|v| v.shape()).collect();
            return Err(node.unsupported(format!("inputs of shapes {:?}", shapes)));
        }
        shape[axis] += v.shape()[axis];
    }
    if values.iter().all(|v| v.as_static().is_some()) {
        let tensors: Vec<&Tensor> =
            values.iter().filter_map(|v| v.as_static()).map(|t| &**t).collect();
        return Ok(tvec!(fold::concat(&tensors, axis)?.into()));
    }
    let channels_last =
        values.iter().any(|v| matches!(v, Value::Wire(w) if w.layout == Layout::ChannelsLast));
    let layout = if rank == 4 && channels_last { Layout::ChannelsLast } else { Layout::Native };
    let layer = b.layer(node, "Concatenate");
    let mut parts = vec![];
    for (ix, v) in values.iter().enumerate() {
        parts.push(match v {
            Value::Wire(w) => b.to_layout(w, layout)?.node,
            Value::Static(t) => {
                let t = t.cast_to::<f32>()?.into_owned();
                let t = match layout {
                    Layout::ChannelsLast => permute(&t, &TO_CHANNELS_LAST)?,
                    Layout::Native => t,
                };
                b.konst(&layer.scoped(&format!("values_{}", ix)), &t)?
            }
        });
    }
    let physical_axis = Wire::new(String::new(), shape.clone(), layout).physical_axis(axis);
    let axis = b.int_const(&layer.scoped("axis"), &[physical_axis as i64], &[])?;
    let mut concat = b.op(&layer, "concat", "ConcatV2");
    for part in &parts {
        concat = concat.input(part);
    }
    let concat =
        concat.input(axis).attr("N", parts.len() as i64).attr("Tidx", DataType::DtInt32);
    let output = b.push(concat)?;
    let wire = Wire::new(output, shape, layout);
    b.finish(layer, &wire);
    Ok(tvec!(wire.into()))
}
