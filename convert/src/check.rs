//! Numerical comparison of the reference and converted outputs.

use std::fmt;

use anyhow::ensure;
use tract_onnx::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, new)]
pub struct Discrepancy {
    /// `max(reference - converted)`, the figure printed as `Error:`.
    pub max_signed: f32,
    /// `max(|reference - converted|)`.
    pub max_abs: f32,
}

impl Discrepancy {
    pub fn within(&self, tolerance: f32) -> bool {
        self.max_abs <= tolerance
    }
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error: {}", self.max_signed)
    }
}

pub fn compare(reference: &Tensor, converted: &Tensor) -> TractResult<Discrepancy> {
    ensure!(
        reference.shape() == converted.shape(),
        "Output shapes differ: reference {:?}, converted {:?}",
        reference.shape(),
        converted.shape()
    );
    ensure!(reference.len() > 0, "Can not compare empty outputs of shape {:?}", reference.shape());
    let reference = reference.cast_to::<f32>()?;
    let converted = converted.cast_to::<f32>()?;
    let mut max_signed = f32::NEG_INFINITY;
    let mut max_abs = 0f32;
    for (r, c) in reference.as_slice::<f32>()?.iter().zip(converted.as_slice::<f32>()?) {
        let diff = r - c;
        max_signed = max_signed.max(diff);
        max_abs = max_abs.max(diff.abs());
        if diff.is_nan() {
            max_signed = f32::NAN;
            max_abs = f32::NAN;
            break;
        }
    }
    let discrepancy = Discrepancy::new(max_signed, max_abs);
    debug!("{:?}", discrepancy);
    Ok(discrepancy)
}
