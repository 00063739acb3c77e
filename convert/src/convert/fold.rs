//! Evaluation of operators on tensors known at conversion time, mostly the shape
//! arithmetic exporters leave in front of `Reshape`.

use std::ops::{Add, Mul, Sub};

use anyhow::{bail, ensure, format_err};
use tract_onnx::prelude::tract_ndarray::{self, ArrayD, ArrayViewD, Axis, IxDyn, Zip};
use tract_onnx::prelude::*;

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> TractResult<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |s: &[usize], ax: usize| {
        if ax + s.len() < rank { 1 } else { s[ax + s.len() - rank] }
    };
    (0..rank)
        .map(|ax| match (dim(a, ax), dim(b, ax)) {
            (x, y) if x == y => Ok(x),
            (1, y) => Ok(y),
            (x, 1) => Ok(x),
            _ => bail!("Can not broadcast {:?} against {:?}", a, b),
        })
        .collect()
}

fn broadcast_zip<T: Datum + Copy>(
    a: ArrayViewD<T>,
    b: ArrayViewD<T>,
    f: impl Fn(T, T) -> T,
) -> TractResult<ArrayD<T>> {
    let shape = broadcast_shape(a.shape(), b.shape())?;
    match (a.broadcast(&*shape), b.broadcast(&*shape)) {
        (Some(a), Some(b)) => Ok(Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y))),
        _ => bail!("Can not broadcast {:?} against {:?}", a.shape(), b.shape()),
    }
}

pub fn binary(op: &str, a: &Tensor, b: &Tensor) -> TractResult<Tensor> {
    fn zip<T>(op: &str, a: &Tensor, b: &Tensor, div: impl Fn(T, T) -> T) -> TractResult<Tensor>
    where
        T: Datum + Copy + Add<Output = T> + Sub<Output = T> + Mul<Output = T>,
    {
        let (a, b) = (a.to_array_view::<T>()?, b.to_array_view::<T>()?);
        let result = match op {
            "Add" => broadcast_zip(a, b, |x, y| x + y)?,
            "Sub" => broadcast_zip(a, b, |x, y| x - y)?,
            "Mul" => broadcast_zip(a, b, |x, y| x * y)?,
            "Div" => broadcast_zip(a, b, div)?,
            _ => bail!("Can not fold {}", op),
        };
        Ok(result.into_tensor())
    }
    let dt = if a.datum_type() == DatumType::F32 || b.datum_type() == DatumType::F32 {
        DatumType::F32
    } else {
        a.datum_type()
    };
    let (a, b) = (a.cast_to_dt(dt)?, b.cast_to_dt(dt)?);
    match dt {
        DatumType::F32 => zip::<f32>(op, &a, &b, |x, y| x / y),
        DatumType::I64 => {
            ensure!(
                op != "Div" || !b.as_slice::<i64>()?.contains(&0),
                "Division by zero while folding"
            );
            zip::<i64>(op, &a, &b, |x, y| x / y)
        }
        DatumType::I32 => {
            ensure!(
                op != "Div" || !b.as_slice::<i32>()?.contains(&0),
                "Division by zero while folding"
            );
            zip::<i32>(op, &a, &b, |x, y| x / y)
        }
        dt => bail!("Can not fold {} on {:?}", op, dt),
    }
}

/// ONNX `Gather`: picks `indices` along `axis`, the output taking the indices
/// shape in place of the axis.
pub fn gather(data: &Tensor, indices: &Tensor, axis: usize) -> TractResult<Tensor> {
    fn pick<T: Datum + Copy>(
        data: &Tensor,
        indices: &[usize],
        shape: &[usize],
        axis: usize,
    ) -> TractResult<Tensor> {
        let picked = data.to_array_view::<T>()?.select(Axis(axis), indices);
        Ok(picked.into_shape(IxDyn(shape))?.into_tensor())
    }
    ensure!(axis < data.rank(), "Gather axis {} out of range for {:?}", axis, data.shape());
    let dim = data.shape()[axis] as i64;
    let indices_values = indices.cast_to::<i64>()?;
    let picked = indices_values
        .as_slice::<i64>()?
        .iter()
        .map(|&i| {
            let i = if i < 0 { i + dim } else { i };
            ensure!((0..dim).contains(&i), "Gather index out of bounds");
            Ok(i as usize)
        })
        .collect::<TractResult<Vec<usize>>>()?;
    let mut shape = data.shape()[..axis].to_vec();
    shape.extend_from_slice(indices.shape());
    shape.extend_from_slice(&data.shape()[axis + 1..]);
    match data.datum_type() {
        DatumType::F32 => pick::<f32>(data, &picked, &shape, axis),
        DatumType::I64 => pick::<i64>(data, &picked, &shape, axis),
        DatumType::I32 => pick::<i32>(data, &picked, &shape, axis),
        dt => bail!("Can not fold Gather on {:?}", dt),
    }
}

pub fn concat(tensors: &[&Tensor], axis: usize) -> TractResult<Tensor> {
    fn cat<T: Datum + Copy>(tensors: &[&Tensor], axis: usize) -> TractResult<Tensor> {
        let views =
            tensors.iter().map(|t| t.to_array_view::<T>()).collect::<TractResult<Vec<_>>>()?;
        Ok(tract_ndarray::concatenate(Axis(axis), &views)?.into_tensor())
    }
    ensure!(!tensors.is_empty(), "Concat without inputs");
    let dt = tensors[0].datum_type();
    let tensors = tensors.iter().map(|t| t.cast_to_dt(dt)).collect::<TractResult<Vec<_>>>()?;
    let refs: Vec<&Tensor> = tensors.iter().map(|t| &**t).collect();
    match dt {
        DatumType::F32 => cat::<f32>(&refs, axis),
        DatumType::I64 => cat::<i64>(&refs, axis),
        DatumType::I32 => cat::<i32>(&refs, axis),
        dt => bail!("Can not fold Concat on {:?}", dt),
    }
}

/// Output shape of ONNX `Unsqueeze`.
pub fn unsqueezed(shape: &[usize], axes: &[i64]) -> TractResult<Vec<usize>> {
    let rank = shape.len() + axes.len();
    let mut axes =
        axes.iter().map(|&a| super::onnx::axis(a, rank)).collect::<TractResult<Vec<_>>>()?;
    axes.sort();
    axes.dedup();
    ensure!(axes.len() + shape.len() == rank, "Duplicate axes in Unsqueeze");
    let mut dims = shape.iter();
    Ok((0..rank)
        .map(|ax| if axes.contains(&ax) { 1 } else { *dims.next().unwrap_or(&1) })
        .collect())
}

/// Output shape of ONNX `Squeeze`, all unit axes when `axes` is empty.
pub fn squeezed(shape: &[usize], axes: &[i64]) -> TractResult<Vec<usize>> {
    let axes = axes
        .iter()
        .map(|&a| super::onnx::axis(a, shape.len()))
        .collect::<TractResult<Vec<_>>>()?;
    for &ax in &axes {
        ensure!(shape[ax] == 1, "Squeezing axis {} of size {}", ax, shape[ax]);
    }
    Ok(shape
        .iter()
        .enumerate()
        .filter(|(ax, d)| if axes.is_empty() { **d != 1 } else { !axes.contains(ax) })
        .map(|(_, &d)| d)
        .collect())
}

/// Output shape of ONNX `Reshape`: `0` copies the input dimension (unless
/// `allowzero`), `-1` is inferred.
pub fn reshaped(input: &[usize], spec: &[i64], allowzero: bool) -> TractResult<Vec<usize>> {
    let volume: usize = input.iter().product();
    let mut dims: Vec<Option<usize>> = Vec::with_capacity(spec.len());
    for (ax, &d) in spec.iter().enumerate() {
        dims.push(match d {
            -1 => None,
            0 if !allowzero => Some(
                *input.get(ax).ok_or_else(|| format_err!("Reshape copies missing axis {}", ax))?,
            ),
            d if d >= 0 => Some(d as usize),
            _ => bail!("Invalid Reshape shape {:?}", spec),
        });
    }
    ensure!(
        dims.iter().filter(|d| d.is_none()).count() <= 1,
        "Multiple -1 in Reshape shape {:?}",
        spec
    );
    let known: usize = dims.iter().flatten().product();
    let shape: Vec<usize> = dims
        .iter()
        .map(|d| d.unwrap_or_else(|| if known == 0 { 0 } else { volume / known }))
        .collect();
    ensure!(
        shape.iter().product::<usize>() == volume,
        "Can not reshape {:?} with {:?}",
        input,
        spec
    );
    Ok(shape)
}

pub fn reshape(t: &Tensor, shape: &[usize]) -> TractResult<Tensor> {
    t.clone().into_shape(shape)
}

pub fn transpose(t: &Tensor, perm: &[usize]) -> TractResult<Tensor> {
    t.clone().permute_axes(perm)
}
