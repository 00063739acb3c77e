//! Spatial geometry of convolutions and pools.
//!
//! ONNX describes padding explicitly (with a `ceil_mode` twist for pools), TensorFlow
//! only knows `VALID` and `SAME`. [`lower`] finds the TensorFlow form producing the
//! same windows, or reports the explicit padding to insert in front of the operator.

use anyhow::bail;
use tract_onnx::prelude::TractResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TfPadding {
    Valid,
    Same,
}

impl TfPadding {
    pub fn as_str(&self) -> &'static str {
        match self {
            TfPadding::Valid => "VALID",
            TfPadding::Same => "SAME",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct ComputedDim {
    pub output: usize,
    pub pad_before: usize,
    pub pad_after: usize,
}

fn kernel_field(kernel: usize, dilation: usize) -> usize {
    (kernel - 1) * dilation + 1
}

/// Output size and padding of one spatial axis, TensorFlow semantics.
pub fn tf_dim(
    input: usize,
    kernel: usize,
    dilation: usize,
    stride: usize,
    padding: TfPadding,
) -> ComputedDim {
    let field = kernel_field(kernel, dilation);
    match padding {
        TfPadding::Valid => {
            ComputedDim::new((input + 1).saturating_sub(field).div_ceil(stride), 0, 0)
        }
        TfPadding::Same => {
            let output = input.div_ceil(stride);
            let pad = ((output.max(1) - 1) * stride + field).saturating_sub(input);
            ComputedDim::new(output, pad / 2, pad - pad / 2)
        }
    }
}

/// Output size of one spatial axis, ONNX semantics.
///
/// `pad_after` is the padding the last window actually reaches: it can exceed the
/// declared padding in `ceil_mode`, and drops the part no window covers.
pub fn onnx_dim(
    input: usize,
    kernel: usize,
    dilation: usize,
    stride: usize,
    before: usize,
    after: usize,
    ceil_mode: bool,
) -> ComputedDim {
    let field = kernel_field(kernel, dilation);
    let dividend = (input + before + after).saturating_sub(field);
    let mut output = if ceil_mode { dividend.div_ceil(stride) } else { dividend / stride } + 1;
    if ceil_mode && (output - 1) * stride >= input + before {
        // the last window must start inside the image
        output -= 1;
    }
    let covered = (output - 1) * stride + field;
    ComputedDim::new(output, before, covered.saturating_sub(input + before))
}

/// Same-padding split, used for ONNX `auto_pad`.
pub fn onnx_auto_pad(
    input: usize,
    kernel: usize,
    dilation: usize,
    stride: usize,
    upper: bool,
) -> (usize, usize) {
    let same = tf_dim(input, kernel, dilation, stride, TfPadding::Same);
    if upper {
        (same.pad_before, same.pad_after)
    } else {
        (same.pad_after, same.pad_before)
    }
}

/// How an ONNX window is expressed in TensorFlow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lowering {
    /// The TensorFlow padding mode gives the exact same windows.
    Native(TfPadding),
    /// Pad explicitly (before, after) on each spatial axis, then run with `VALID`.
    Explicit(Vec<(usize, usize)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub lowering: Lowering,
    pub output: Vec<usize>,
    /// Padding ONNX declares, ignoring the `ceil_mode` extension.
    pub declared: Vec<(usize, usize)>,
}

impl Geometry {
    /// True when `ceil_mode` asks for windows beyond the declared padding.
    pub fn overflows(&self) -> bool {
        match &self.lowering {
            Lowering::Explicit(pads) => pads.iter().zip(&self.declared).any(|(p, d)| p.1 > d.1),
            Lowering::Native(_) => false,
        }
    }

    pub fn has_padding(&self) -> bool {
        self.declared.iter().any(|&(b, a)| b > 0 || a > 0)
    }
}

/// Maps an ONNX window specification onto TensorFlow.
#[allow(clippy::too_many_arguments)]
pub fn lower(
    input: &[usize],
    kernel: &[usize],
    dilations: &[usize],
    strides: &[usize],
    before: &[usize],
    after: &[usize],
    ceil_mode: bool,
) -> TractResult<Geometry> {
    let rank = input.len();
    if [kernel.len(), dilations.len(), strides.len(), before.len(), after.len()]
        .iter()
        .any(|&l| l != rank)
    {
        bail!(
            "Inconsistent window geometry: input {:?} kernel {:?} dilations {:?} \
             strides {:?} pads {:?} {:?}",
            input,
            kernel,
            dilations,
            strides,
            before,
            after
        );
    }
    if strides.contains(&0) || dilations.contains(&0) || kernel.contains(&0) {
        bail!("Null stride, dilation or kernel size in {:?} {:?} {:?}", strides, dilations, kernel);
    }
    let onnx: Vec<ComputedDim> = (0..rank)
        .map(|ax| {
            onnx_dim(
                input[ax],
                kernel[ax],
                dilations[ax],
                strides[ax],
                before[ax],
                after[ax],
                ceil_mode,
            )
        })
        .collect();
    let output: Vec<usize> = onnx.iter().map(|d| d.output).collect();
    let declared: Vec<(usize, usize)> = before.iter().cloned().zip(after.iter().cloned()).collect();
    let tf = |padding| -> Vec<ComputedDim> {
        (0..rank)
            .map(|ax| tf_dim(input[ax], kernel[ax], dilations[ax], strides[ax], padding))
            .collect()
    };
    let unpadded = declared.iter().all(|&(b, a)| b == 0 && a == 0);
    let valid = tf(TfPadding::Valid);
    if unpadded && valid.iter().zip(&onnx).all(|(v, o)| v.output == o.output) {
        return Ok(Geometry { lowering: Lowering::Native(TfPadding::Valid), output, declared });
    }
    let same = tf(TfPadding::Same);
    if same.iter().zip(&onnx).all(|(s, o)| s.output == o.output && s.pad_before == o.pad_before) {
        return Ok(Geometry { lowering: Lowering::Native(TfPadding::Same), output, declared });
    }
    let pads = onnx.iter().map(|d| (d.pad_before, d.pad_after)).collect();
    Ok(Geometry { lowering: Lowering::Explicit(pads), output, declared })
}
