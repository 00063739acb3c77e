//! Reloading a written graph with tract's TensorFlow frontend.

use std::path::Path;

use anyhow::{Context, bail};
use tract_onnx::prelude::*;

use crate::check::{Discrepancy, compare};

/// Runs a frozen graph file on `input`, returning the value of `output_name`.
pub fn run_frozen(
    path: impl AsRef<Path>,
    output_name: &str,
    input: &Tensor,
) -> TractResult<Tensor> {
    let path = path.as_ref();
    let mut model = tract_tensorflow::tensorflow()
        .model_for_path(path)
        .with_context(|| format!("Loading frozen graph {}", path.display()))?;
    model.set_output_names([output_name])?;
    let model = model
        .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), input.shape()))?
        .into_optimized()?
        .into_runnable()?;
    let mut outputs = model.run(tvec!(input.clone().into()))?;
    if outputs.is_empty() {
        bail!("Frozen graph {} produced no output", path.display());
    }
    Ok(outputs.remove(0).into_tensor())
}

/// Compares the frozen graph file with the output the converted model produced on the same input.
pub fn verify_frozen(
    path: impl AsRef<Path>,
    output_name: &str,
    input: &Tensor,
    expected: &Tensor,
) -> TractResult<Discrepancy> {
    let reloaded = run_frozen(path, output_name, input)?;
    let discrepancy = compare(expected, &reloaded)?;
    info!(
        "Reloaded frozen graph, max absolute difference with converted model: {}",
        discrepancy.max_abs
    );
    Ok(discrepancy)
}
