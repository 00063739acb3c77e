use anyhow::{ensure, format_err};
use tract_onnx::pb::NodeProto;
use tract_onnx::prelude::*;
use tract_tensorflow::tfpb::tensorflow::DataType;

use super::{OpRegister, opt_static, static_input, wire_input};
use crate::convert::builder::{Builder, Layer, Layout, Value, Wire};
use crate::convert::onnx::{self, NodeProtoExt, permute};
use crate::padding::{self, Geometry, Lowering, TfPadding};

pub fn register_all_ops(reg: &mut OpRegister) {
    reg.insert("AveragePool", |b, n, i| pool(b, n, i, false));
    reg.insert("BatchNormalization", batch_norm);
    reg.insert("Conv", conv);
    reg.insert("GlobalAveragePool", |b, n, i| global_pool(b, n, i, false));
    reg.insert("GlobalMaxPool", |b, n, i| global_pool(b, n, i, true));
    reg.insert("MaxPool", |b, n, i| pool(b, n, i, true));
    reg.insert("Relu", |b, n, i| activation(b, n, i, "Relu"));
    reg.insert("Sigmoid", |b, n, i| activation(b, n, i, "Sigmoid"));
    reg.insert("Softmax", softmax);
}

fn spatial_input(
    b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
) -> TractResult<Wire> {
    let x = wire_input(b, node, inputs, 0)?;
    if x.rank() != 4 {
        let detail = format!("only 2D images are supported, got input shape {:?}", x.shape);
        return Err(node.unsupported(detail));
    }
    Ok(x)
}

/// Declared ONNX padding, as (before, after) per spatial axis.
fn pads(
    node: &NodeProto,
    input: &[usize],
    kernel: &[usize],
    dilations: &[usize],
    strides: &[usize],
) -> TractResult<(Vec<usize>, Vec<usize>)> {
    let rank = input.len();
    match node.get_attr_opt::<&str>("auto_pad")?.unwrap_or("NOTSET") {
        "NOTSET" => {
            let pads = node.usizes_or("pads", vec![0; 2 * rank])?;
            if pads.len() != 2 * rank {
                return Err(node.unsupported(format!("pads {:?} for {} spatial axes", pads, rank)));
            }
            Ok((pads[..rank].to_vec(), pads[rank..].to_vec()))
        }
        "VALID" => Ok((vec![0; rank], vec![0; rank])),
        mode @ ("SAME_UPPER" | "SAME_LOWER") => Ok((0..rank)
            .map(|ax| {
                let upper = mode == "SAME_UPPER";
                padding::onnx_auto_pad(input[ax], kernel[ax], dilations[ax], strides[ax], upper)
            })
            .unzip()),
        other => Err(node.unsupported(format!("auto_pad {}", other))),
    }
}

fn spatial_attr(node: &NodeProto, name: &str, default: Vec<usize>) -> TractResult<Vec<usize>> {
    let values = node.usizes_or(name, default)?;
    if values.len() != 2 {
        return Err(node.unsupported(format!("{} {:?}", name, values)));
    }
    Ok(values)
}

fn nhwc(values: &[usize]) -> Vec<i64> {
    vec![1, values[0] as i64, values[1] as i64, 1]
}

/// Input node and TensorFlow padding for a lowered window.
///
/// Explicit padding is written as zero blocks concatenated around the rows, then
/// around the columns, of the channels-last input.
fn lowered_input(
    b: &mut Builder,
    layer: &Layer,
    x: &Wire,
    lowering: &Lowering,
) -> TractResult<(String, TfPadding)> {
    let pads = match lowering {
        Lowering::Native(padding) => return Ok((x.node.clone(), *padding)),
        Lowering::Explicit(pads) => pads,
    };
    ensure!(x.layout == Layout::ChannelsLast && pads.len() == 2, "Explicit padding of {:?}", x);
    let mut shape = x.physical_shape();
    let mut input = x.node.clone();
    let axes = [(1, "pad_rows"), (2, "pad_cols")];
    for ((axis, suffix), &(before, after)) in axes.into_iter().zip(pads) {
        if before == 0 && after == 0 {
            continue;
        }
        let mut zeros = |side: &str, size: usize| -> TractResult<String> {
            let mut block = shape.clone();
            block[axis] = size;
            let name = layer.scoped(&format!("{}/{}", suffix, side));
            b.konst(&name, &Tensor::zero::<f32>(&block)?)
        };
        let mut parts = vec![];
        if before > 0 {
            parts.push(zeros("before", before)?);
        }
        parts.push(input);
        if after > 0 {
            parts.push(zeros("after", after)?);
        }
        let axis_name = layer.scoped(&format!("{}/axis", suffix));
        let axis_node = b.int_const(&axis_name, &[axis as i64], &[])?;
        let mut concat = b.op(layer, suffix, "ConcatV2");
        for part in &parts {
            concat = concat.input(part);
        }
        let concat = concat
            .input(axis_node)
            .attr("N", parts.len() as i64)
            .attr("Tidx", DataType::DtInt32);
        input = b.push(concat)?;
        shape[axis] += before + after;
    }
    Ok((input, TfPadding::Valid))
}

fn conv(b: &mut Builder, node: &NodeProto, inputs: &[Option<Value>]) -> TractResult<TVec<Value>> {
    let x = spatial_input(b, node, inputs)?;
    let weights = static_input(node, inputs, 1)?.cast_to::<f32>()?.into_owned();
    let bias = opt_static(node, inputs, 2)?;
    let &[oc, icg, kh, kw] = weights.shape() else {
        return Err(node.unsupported(format!("kernel of shape {:?}", weights.shape())));
    };
    let ic = x.shape[1];
    let kernel = spatial_attr(node, "kernel_shape", vec![kh, kw])?;
    if kernel != [kh, kw] {
        let detail = format!("kernel_shape {:?} for weights {:?}", kernel, weights.shape());
        return Err(node.unsupported(detail));
    }
    let strides = spatial_attr(node, "strides", vec![1, 1])?;
    let dilations = spatial_attr(node, "dilations", vec![1, 1])?;
    let group = node.get_attr_opt::<usize>("group")?.unwrap_or(1);
    let depthwise = if group == 1 && icg == ic {
        false
    } else if group == ic && icg == 1 && oc % ic == 0 {
        true
    } else {
        return Err(node.unsupported(format!(
            "group {} with {} input channels and kernel {:?}",
            group,
            ic,
            weights.shape()
        )));
    };
    let (before, after) = pads(node, &x.shape[2..], &kernel, &dilations, &strides)?;
    let geometry =
        padding::lower(&x.shape[2..], &kernel, &dilations, &strides, &before, &after, false)?;

    let x = b.channels_last(&x)?;
    let (kind, op, kernel_name, hwio) = if depthwise {
        let reshaped = weights.into_shape(&[ic, oc / ic, kh, kw])?;
        let hwio = permute(&reshaped, &[2, 3, 0, 1])?;
        ("DepthwiseConv2D", "DepthwiseConv2dNative", "depthwise_kernel", hwio)
    } else {
        ("Conv2D", "Conv2D", "kernel", permute(&weights, &[2, 3, 1, 0])?)
    };
    let mut layer = b.layer(node, kind);
    let kernel = b.weight(&mut layer, kernel_name, hwio, true)?;
    let (input, padding) = lowered_input(b, &layer, &x, &geometry.lowering)?;
    let mut output = b.push(
        b.op(&layer, op, op)
            .input(input)
            .input(kernel)
            .attr("strides", nhwc(&strides))
            .attr("dilations", nhwc(&dilations))
            .attr("padding", padding.as_str())
            .attr("data_format", "NHWC"),
    )?;
    if let Some(bias) = bias {
        ensure!(
            bias.shape() == [oc],
            "Conv bias of shape {:?} for {} output channels",
            bias.shape(),
            oc
        );
        let bias = b.weight(&mut layer, "bias", (**bias).clone(), true)?;
        output = b.push(
            b.op(&layer, "BiasAdd", "BiasAdd")
                .input(output)
                .input(bias)
                .attr("data_format", "NHWC"),
        )?;
    }
    let shape = vec![x.shape[0], oc, geometry.output[0], geometry.output[1]];
    let wire = Wire::new(output, shape, Layout::ChannelsLast);
    b.finish(layer, &wire);
    Ok(tvec!(wire.into()))
}

/// Inference mode batch normalization, expanded the way Keras writes it in a graph.
fn batch_norm(
    b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
) -> TractResult<TVec<Value>> {
    let x = wire_input(b, node, inputs, 0)?;
    if x.rank() != 2 && x.rank() != 4 {
        return Err(node.unsupported(format!("input of rank {}", x.rank())));
    }
    if node.get_attr_opt::<i64>("training_mode")?.unwrap_or(0) != 0 {
        return Err(node.unsupported("training mode"));
    }
    let channels = x.shape[1];
    let mut params = vec![];
    for ix in 1..5 {
        let param = static_input(node, inputs, ix)?;
        ensure!(
            param.shape() == [channels],
            "Batch norm parameter of shape {:?} for {} channels",
            param.shape(),
            channels
        );
        params.push((**param).clone());
    }
    let epsilon = node.get_attr_opt::<f32>("epsilon")?.unwrap_or(1e-5);
    let x = if x.rank() == 4 { b.channels_last(&x)? } else { x };

    let mut layer = b.layer(node, "BatchNormalization");
    let mut params = params.into_iter();
    let mut next = || params.next().ok_or_else(|| format_err!("missing batch norm parameter"));
    let gamma = b.weight(&mut layer, "gamma", next()?, true)?;
    let beta = b.weight(&mut layer, "beta", next()?, true)?;
    let mean = b.weight(&mut layer, "moving_mean", next()?, false)?;
    let variance = b.weight(&mut layer, "moving_variance", next()?, false)?;

    let eps = b.konst(&layer.scoped("batchnorm/add/y"), &tensor0(epsilon))?;
    let add = b.push(b.op(&layer, "batchnorm/add", "Add").input(variance).input(eps))?;
    let rsqrt = b.push(b.op(&layer, "batchnorm/Rsqrt", "Rsqrt").input(add))?;
    let mul = b.push(b.op(&layer, "batchnorm/mul", "Mul").input(rsqrt).input(gamma))?;
    let mul_1 = b.push(b.op(&layer, "batchnorm/mul_1", "Mul").input(&x.node).input(&mul))?;
    let mul_2 = b.push(b.op(&layer, "batchnorm/mul_2", "Mul").input(mean).input(&mul))?;
    let sub = b.push(b.op(&layer, "batchnorm/sub", "Sub").input(beta).input(mul_2))?;
    let output = b.push(b.op(&layer, "batchnorm/add_1", "Add").input(mul_1).input(sub))?;
    let wire = Wire::new(output, x.shape.clone(), x.layout);
    b.finish(layer, &wire);
    Ok(tvec!(wire.into()))
}

/// TensorFlow windows reproducing the ONNX pool, if any.
fn pool_lowering(
    node: &NodeProto,
    input: &[usize],
    geometry: &Geometry,
    kernel: &[usize],
    strides: &[usize],
    ceil_mode: bool,
    max: bool,
) -> TractResult<Lowering> {
    let count_include_pad = node.get_attr_opt::<i64>("count_include_pad")?.unwrap_or(0) != 0;
    match &geometry.lowering {
        Lowering::Native(TfPadding::Same)
            if !max && count_include_pad && geometry.has_padding() =>
        {
            let explicit: Vec<(usize, usize)> = (0..input.len())
                .map(|ax| {
                    let (before, after) = geometry.declared[ax];
                    let dim = padding::onnx_dim(
                        input[ax],
                        kernel[ax],
                        1,
                        strides[ax],
                        before,
                        after,
                        ceil_mode,
                    );
                    (dim.pad_before, dim.pad_after)
                })
                .collect();
            if explicit.iter().zip(&geometry.declared).any(|(e, d)| e.1 > d.1) {
                let detail = "windows beyond the declared padding with count_include_pad";
                return Err(node.unsupported(detail));
            }
            Ok(Lowering::Explicit(explicit))
        }
        Lowering::Native(padding) => Ok(Lowering::Native(*padding)),
        Lowering::Explicit(pads) if max => Err(node.unsupported(format!(
            "max pooling padding {:?} has no TensorFlow equivalent",
            pads
        ))),
        Lowering::Explicit(pads) if !count_include_pad || geometry.overflows() => {
            let detail = format!("average pooling padding {:?} without count_include_pad", pads);
            Err(node.unsupported(detail))
        }
        explicit => Ok(explicit.clone()),
    }
}

fn pool(
    b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
    max: bool,
) -> TractResult<TVec<Value>> {
    let x = spatial_input(b, node, inputs)?;
    let kernel = spatial_attr(node, "kernel_shape", vec![])?;
    let strides = spatial_attr(node, "strides", vec![1, 1])?;
    let dilations = spatial_attr(node, "dilations", vec![1, 1])?;
    if dilations != [1, 1] {
        return Err(node.unsupported(format!("dilations {:?}", dilations)));
    }
    let ceil_mode = node.get_attr_opt::<i64>("ceil_mode")?.unwrap_or(0) != 0;
    let spatial = &x.shape[2..];
    let (before, after) = pads(node, spatial, &kernel, &dilations, &strides)?;
    let geometry =
        padding::lower(spatial, &kernel, &dilations, &strides, &before, &after, ceil_mode)?;
    let lowering = pool_lowering(node, spatial, &geometry, &kernel, &strides, ceil_mode, max)?;

    let x = b.channels_last(&x)?;
    let (kind, op) =
        if max { ("MaxPooling2D", "MaxPool") } else { ("AveragePooling2D", "AvgPool") };
    let layer = b.layer(node, kind);
    let (input, padding) = lowered_input(b, &layer, &x, &lowering)?;
    let output = b.push(
        b.op(&layer, op, op)
            .input(input)
            .attr("ksize", nhwc(&kernel))
            .attr("strides", nhwc(&strides))
            .attr("padding", padding.as_str())
            .attr("data_format", "NHWC"),
    )?;
    let shape = vec![x.shape[0], x.shape[1], geometry.output[0], geometry.output[1]];
    let wire = Wire::new(output, shape, Layout::ChannelsLast);
    b.finish(layer, &wire);
    Ok(tvec!(wire.into()))
}

fn global_pool(
    b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
    max: bool,
) -> TractResult<TVec<Value>> {
    let x = spatial_input(b, node, inputs)?;
    let x = b.channels_last(&x)?;
    let (kind, op) =
        if max { ("GlobalMaxPooling2D", "MaxPool") } else { ("GlobalAveragePooling2D", "AvgPool") };
    let layer = b.layer(node, kind);
    let output = b.push(
        b.op(&layer, op, op)
            .input(&x.node)
            .attr("ksize", nhwc(&x.shape[2..]))
            .attr("strides", vec![1i64, 1, 1, 1])
            .attr("padding", TfPadding::Valid.as_str())
            .attr("data_format", "NHWC"),
    )?;
    let wire = Wire::new(output, vec![x.shape[0], x.shape[1], 1, 1], Layout::ChannelsLast);
    b.finish(layer, &wire);
    Ok(tvec!(wire.into()))
}

fn activation(
    b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
    op: &str,
) -> TractResult<TVec<Value>> {
    let x = wire_input(b, node, inputs, 0)?;
    let layer = b.layer(node, "Activation");
    let output = b.push(b.op(&layer, op, op).input(&x.node))?;
    let wire = Wire::new(output, x.shape.clone(), x.layout);
    b.finish(layer, &wire);
    Ok(tvec!(wire.into()))
}

fn softmax(
    b: &mut Builder,
    node: &NodeProto,
    inputs: &[Option<Value>],
) -> TractResult<TVec<Value>> {
    let x = wire_input(b, node, inputs, 0)?;
    let default_axis = if b.opset < 13 { 1 } else { -1 };
    let axis = onnx::axis(node.get_attr_opt("axis")?.unwrap_or(default_axis), x.rank())?;
    if axis + 1 != x.rank() {
        let detail = format!("softmax on axis {} of a rank {} tensor", axis, x.rank());
        return Err(node.unsupported(detail));
    }
    let x = if x.rank() == 4 { b.native(&x)? } else { x };
    let layer = b.layer(node, "Softmax");
    let output = b.push(b.op(&layer, "Softmax", "Softmax").input(&x.node))?;
    let wire = Wire::new(output, x.shape.clone(), Layout::Native);
    b.finish(layer, &wire);
    Ok(tvec!(wire.into()))
}
