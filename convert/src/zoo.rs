//! A small model zoo: pretrained classifiers addressable by name.
//!
//! Models are ONNX files named `<name>.onnx` in a cache directory. A missing file
//! is downloaded from `<base_url>/<name>.onnx` when a base URL is configured.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tract_onnx::prelude::*;

use crate::harness::InputShape;
use crate::source::SourceModel;

pub const ZOO_DIR_ENV: &str = "TRACT_CONVERT_ZOO";
pub const ZOO_URL_ENV: &str = "TRACT_CONVERT_ZOO_URL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZooEntry {
    pub name: &'static str,
    pub input_size: usize,
    pub classes: usize,
}

macro_rules! entries {
    ($($name: literal),*) => {
        &[$(ZooEntry { name: $name, input_size: 224, classes: 1000 }),*]
    };
}

/// The SqueezeNext family, in its 23 layers variants.
pub const MODELS: &[ZooEntry] = entries!(
    "sqnxt23_w1",
    "sqnxt23_w3d2",
    "sqnxt23_w2",
    "sqnxt23v5_w1",
    "sqnxt23v5_w3d2",
    "sqnxt23v5_w2"
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZooError {
    UnknownModel(String),
    NotPretrained(String),
    NotCached { name: String, path: PathBuf },
}

impl fmt::Display for ZooError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ZooError::UnknownModel(name) => write!(f, "Unknown model name {:?}", name),
            ZooError::NotPretrained(name) => {
                write!(f, "Model {} is only available with pretrained weights", name)
            }
            ZooError::NotCached { name, path } => write!(
                f,
                "Model {} is not in the cache ({}) and no download URL is configured",
                name,
                path.display()
            ),
        }
    }
}

impl std::error::Error for ZooError {}

pub fn entry(name: &str) -> Result<&'static ZooEntry, ZooError> {
    MODELS.iter().find(|e| e.name == name).ok_or_else(|| ZooError::UnknownModel(name.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelZoo {
    cache_dir: PathBuf,
    base_url: Option<String>,
}

impl ModelZoo {
    pub fn new(cache_dir: impl Into<PathBuf>) -> ModelZoo {
        ModelZoo { cache_dir: cache_dir.into(), base_url: None }
    }

    pub fn with_base_url(self, url: impl Into<String>) -> ModelZoo {
        ModelZoo { base_url: Some(url.into().trim_end_matches('/').to_string()), ..self }
    }

    /// Cache in `$TRACT_CONVERT_ZOO`, or `~/.cache/tract-convert`, downloads from
    /// `$TRACT_CONVERT_ZOO_URL` if set.
    pub fn from_env() -> TractResult<ModelZoo> {
        let dir = match std::env::var_os(ZOO_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => home::home_dir()
                .context("Can not locate home directory for the model cache")?
                .join(".cache")
                .join("tract-convert"),
        };
        let zoo = ModelZoo::new(dir);
        Ok(match std::env::var(ZOO_URL_ENV) {
            Ok(url) if !url.is_empty() => zoo.with_base_url(url),
            _ => zoo,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.onnx", name))
    }

    /// Local path of the model file, downloading it if needed.
    pub fn fetch(&self, name: &str) -> TractResult<PathBuf> {
        entry(name)?;
        let path = self.path_for(name);
        if path.exists() {
            debug!("Using cached {}", path.display());
            return Ok(path);
        }
        let Some(base) = &self.base_url else {
            return Err(ZooError::NotCached { name: name.to_string(), path }.into());
        };
        let url = format!("{}/{}.onnx", base, name);
        info!("Downloading {}", url);
        let bytes = reqwest::blocking::get(&url)
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.bytes())
            .with_context(|| format!("Fetching {}", url))?;
        fs_err::create_dir_all(&self.cache_dir)?;
        let partial = path.with_extension("onnx.part");
        fs_err::write(&partial, &bytes)?;
        fs_err::rename(&partial, &path)?;
        info!("Saved {} bytes to {}", bytes.len(), path.display());
        Ok(path)
    }

    /// Loads a model by name, in inference mode.
    ///
    /// Fails before any IO if the name is unknown.
    pub fn load(
        &self,
        name: &str,
        pretrained: bool,
        size: Option<usize>,
    ) -> TractResult<SourceModel> {
        let entry = entry(name)?;
        if !pretrained {
            return Err(ZooError::NotPretrained(name.to_string()).into());
        }
        let path = self.fetch(name)?;
        let shape = InputShape::square(size.unwrap_or(entry.input_size));
        SourceModel::for_path(name, path, shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry() {
        assert_eq!(entry("sqnxt23v5_w2").unwrap().input_size, 224);
        assert_eq!(entry("resnet9000"), Err(ZooError::UnknownModel("resnet9000".into())));
    }

    #[test]
    fn unknown_name_fails_before_io() {
        let zoo = ModelZoo::new("/nonexistent/zoo").with_base_url("http://127.0.0.1:9");
        let err = zoo.load("not_a_model", true, None).unwrap_err();
        let unknown = ZooError::UnknownModel("not_a_model".into());
        assert_eq!(err.downcast_ref::<ZooError>(), Some(&unknown));
    }

    #[test]
    fn untrained_is_refused() {
        let zoo = ModelZoo::new("/nonexistent/zoo");
        let err = zoo.load("sqnxt23_w1", false, None).unwrap_err();
        assert!(matches!(err.downcast_ref::<ZooError>(), Some(ZooError::NotPretrained(_))));
    }

    #[test]
    fn not_cached_without_url() {
        let dir = tempfile::tempdir().unwrap();
        let zoo = ModelZoo::new(dir.path());
        let err = zoo.fetch("sqnxt23v5_w2").unwrap_err();
        assert!(matches!(err.downcast_ref::<ZooError>(), Some(ZooError::NotCached { .. })));
    }

    #[test]
    fn cached_file_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let zoo = ModelZoo::new(dir.path()).with_base_url("http://127.0.0.1:9/");
        std::fs::write(zoo.path_for("sqnxt23_w2"), b"onnx").unwrap();
        assert_eq!(zoo.fetch("sqnxt23_w2").unwrap(), dir.path().join("sqnxt23_w2.onnx"));
    }

    #[test]
    fn partial_download_is_not_a_cached_model() {
        let dir = tempfile::tempdir().unwrap();
        let zoo = ModelZoo::new(dir.path()).with_base_url("http://127.0.0.1:9");
        std::fs::write(dir.path().join("sqnxt23_w2.onnx.part"), b"onn").unwrap();
        assert!(zoo.fetch("sqnxt23_w2").is_err());
        assert!(!zoo.path_for("sqnxt23_w2").exists());
    }
}
