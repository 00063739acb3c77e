//! # Tract convert
//!
//! Turns a pretrained ONNX image classifier into a frozen TensorFlow graph.
//!
//! The pipeline is a fixed sequence of steps:
//!
//! 1. load the source model from the [`zoo`],
//! 2. run it once on a random input ([`harness`]),
//! 3. translate it into a TensorFlow graph backed by a live [`session::Session`] ([`convert`]),
//! 4. compare both outputs ([`check`]),
//! 5. replace the variables by constants ([`freeze`]),
//! 6. write the frozen graph to disk ([`serialize`]).
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use tract_convert::prelude::*;
//!
//! let zoo = ModelZoo::from_env()?;
//! let report = Pipeline::new(PipelineConfig::default()).run(&zoo)?;
//! println!("Error: {}", report.discrepancy.max_signed);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate derive_new;
#[macro_use]
extern crate log;

pub mod check;
pub mod convert;
pub mod freeze;
pub mod graph;
pub mod harness;
pub mod padding;
pub mod pipeline;
pub mod serialize;
pub mod session;
pub mod source;
pub mod summary;
pub mod verify;
pub mod zoo;

pub use tract_onnx;
pub use tract_tensorflow;
pub use tract_tensorflow::tfpb;

pub mod prelude {
    pub use crate::check::{Discrepancy, compare};
    pub use crate::convert::{ConvertError, ConvertOptions, ConvertedModel, NamePolicy, convert};
    pub use crate::freeze::freeze_session;
    pub use crate::harness::{InputShape, random_input};
    pub use crate::pipeline::{Pipeline, PipelineConfig, Report};
    pub use crate::serialize::{read_graph, write_graph};
    pub use crate::session::Session;
    pub use crate::source::SourceModel;
    pub use crate::zoo::{ModelZoo, ZooError};
}

#[cfg(test)]
pub(crate) fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("TRACT_LOG").try_init();
}
