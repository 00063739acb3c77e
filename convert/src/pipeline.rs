//! The conversion pipeline, stage by stage.
//!
//! Each stage is a plain function, [`Pipeline::run`] chains them in order and stops
//! at the first failure. The output file is written by the last stage only, so a
//! failed run leaves nothing behind.

use std::path::{Path, PathBuf};

use anyhow::{Context, format_err};
use tract_onnx::prelude::*;
use tract_tensorflow::tfpb::tensorflow::GraphDef;

use crate::check::{self, Discrepancy};
use crate::convert::{self, ConvertOptions, ConvertedModel, NamePolicy};
use crate::freeze;
use crate::harness::{self, InputShape};
use crate::serialize;
use crate::source::SourceModel;
use crate::verify;
use crate::zoo::{self, ModelZoo};

pub const DEFAULT_MODEL: &str = "sqnxt23v5_w2";
pub const DEFAULT_SIZE: usize = 224;
pub const DEFAULT_OUTPUT_FILE: &str = "saved_model.pb";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub model: String,
    pub size: usize,
    pub output_dir: PathBuf,
    pub output_file: String,
    /// Seed for the random input, drawn from entropy when absent.
    pub seed: Option<u64>,
    pub name_policy: NamePolicy,
    pub verbose: bool,
    pub as_text: bool,
    pub keep_var_names: Vec<String>,
    pub clear_devices: bool,
    /// Reload the written graph and compare it with the converted model.
    pub verify: bool,
    /// Read the model from this file instead of the zoo.
    pub model_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> PipelineConfig {
        PipelineConfig {
            model: DEFAULT_MODEL.to_string(),
            size: DEFAULT_SIZE,
            output_dir: PathBuf::from("."),
            output_file: DEFAULT_OUTPUT_FILE.to_string(),
            seed: None,
            name_policy: NamePolicy::default(),
            verbose: true,
            as_text: false,
            keep_var_names: vec![],
            clear_devices: true,
            verify: false,
            model_path: None,
        }
    }
}

impl PipelineConfig {
    pub fn input_shape(&self) -> InputShape {
        InputShape::square(self.size)
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.output_file)
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    pub model: String,
    pub input_shape: InputShape,
    pub discrepancy: Discrepancy,
    pub summary: String,
    pub output_names: Vec<String>,
    pub path: PathBuf,
    /// Difference between the reloaded file and the converted model, if checked.
    pub verified: Option<Discrepancy>,
}

impl Report {
    /// What the conversion prints: the error line, the layer table and the output names.
    pub fn console(&self) -> String {
        format!(
            "{}\n{}\n{}\n",
            self.discrepancy,
            self.summary.trim_end(),
            format_names(&self.output_names)
        )
    }
}

/// Formats names the way a Python list of strings prints.
pub fn format_names(names: &[impl AsRef<str>]) -> String {
    let quoted: Vec<String> = names.iter().map(|n| format!("'{}'", n.as_ref())).collect();
    format!("[{}]", quoted.join(", "))
}

pub fn load_model(config: &PipelineConfig, zoo: &ModelZoo) -> TractResult<SourceModel> {
    match &config.model_path {
        Some(path) => SourceModel::for_path(&config.model, path, config.input_shape()),
        None => zoo.load(&config.model, true, Some(config.size)),
    }
}

pub fn reference_output(source: &SourceModel, input: &Tensor) -> TractResult<Tensor> {
    source.forward(input).with_context(|| format!("Running {} on random input", source.name))
}

pub fn convert_model(source: &SourceModel, config: &PipelineConfig) -> TractResult<ConvertedModel> {
    let options = ConvertOptions::new(source.input_shape, config.verbose, config.name_policy);
    convert::convert(source, &options).with_context(|| format!("Converting {}", source.name))
}

pub fn check_model(
    converted: &mut ConvertedModel,
    input: &Tensor,
    reference: &Tensor,
) -> TractResult<(Tensor, Discrepancy)> {
    let output = converted.predict(input).context("Running converted model")?;
    let discrepancy = check::compare(reference, &output)?;
    Ok((output, discrepancy))
}

pub fn freeze_model(converted: &ConvertedModel, config: &PipelineConfig) -> TractResult<GraphDef> {
    freeze::freeze_session(
        &converted.session,
        &config.keep_var_names,
        &converted.output_names,
        config.clear_devices,
    )
    .context("Freezing converted model")
}

pub fn save_model(frozen: &GraphDef, config: &PipelineConfig) -> TractResult<PathBuf> {
    serialize::write_graph(frozen, &config.output_dir, &config.output_file, config.as_text)
}

#[derive(Debug, Clone, new)]
pub struct Pipeline {
    pub config: PipelineConfig,
}

impl Pipeline {
    pub fn run(&self, zoo: &ModelZoo) -> TractResult<Report> {
        if self.config.model_path.is_none() {
            zoo::entry(&self.config.model)?;
        }
        let source = load_model(&self.config, zoo)?;
        self.run_source(&source)
    }

    /// Runs every stage after loading on an already loaded model.
    pub fn run_source(&self, source: &SourceModel) -> TractResult<Report> {
        let config = &self.config;
        let input = harness::random_input(source.input_shape, config.seed)?;
        let reference = reference_output(source, &input)?;
        let mut converted = convert_model(source, config)?;
        let (output, discrepancy) = check_model(&mut converted, &input, &reference)?;
        info!("Max absolute difference with {}: {}", source.name, discrepancy.max_abs);
        let frozen = freeze_model(&converted, config)?;
        let path = save_model(&frozen, config)?;
        let verified = if config.verify {
            if config.as_text {
                warn!("Skipping verification of text graph {}", path.display());
                None
            } else {
                Some(verify_saved(&path, &converted, &input, &output)?)
            }
        } else {
            None
        };
        Ok(Report {
            model: source.name.clone(),
            input_shape: source.input_shape,
            discrepancy,
            summary: converted.summary(),
            output_names: converted.output_names.clone(),
            path,
            verified,
        })
    }
}

fn verify_saved(
    path: &Path,
    converted: &ConvertedModel,
    input: &Tensor,
    output: &Tensor,
) -> TractResult<Discrepancy> {
    let output_name = converted
        .output_names
        .first()
        .ok_or_else(|| format_err!("Converted model has no output"))?;
    verify::verify_frozen(path, output_name, input, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zoo::ZooError;

    #[test]
    fn defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.model, "sqnxt23v5_w2");
        assert_eq!(config.input_shape(), InputShape::new(3, 224, 224));
        assert_eq!(config.output_path(), Path::new("./saved_model.pb"));
        assert!(config.clear_devices && config.verbose && !config.as_text);
    }

    #[test]
    fn python_list() {
        assert_eq!(format_names(&["LAYER_57/Softmax"]), "['LAYER_57/Softmax']");
        assert_eq!(format_names(&["a", "b"]), "['a', 'b']");
        assert_eq!(format_names(&[] as &[&str]), "[]");
    }

    #[test]
    fn unknown_model_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            model: "nope".to_string(),
            output_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let err = Pipeline::new(config.clone()).run(&ModelZoo::new(dir.path())).unwrap_err();
        assert_eq!(err.downcast_ref::<ZooError>(), Some(&ZooError::UnknownModel("nope".into())));
        assert!(!config.output_path().exists());
    }
}
