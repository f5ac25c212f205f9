#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Offline resharding of tensor/pipeline-parallel model checkpoints.
//!
//! A checkpoint saved with tensor-parallel degree `TP1` and pipeline degree `PP1` is
//! rewritten for `TP2`/`PP2`. Each parameter is merged back into its full tensor with the
//! rule its partition dictates, re-split for the target degree, and stored on whichever
//! target stage owns its layer.
//!
//! ```no_run
//! use reshard::{ConversionRequest, ParallelConfig, ReshardOptions, reshard};
//!
//! let report = reshard(&ConversionRequest {
//!     input: "ckpt-tp2".into(),
//!     output: "ckpt-tp1-pp2".into(),
//!     source: ParallelConfig::new(2, 1),
//!     target: ParallelConfig::new(1, 2),
//!     options: ReshardOptions::default(),
//! })?;
//! println!("{} parameters converted", report.parameters.len());
//! # Ok::<(), reshard::ReshardError>(())
//! ```

mod checkpoint;
mod config;
mod engine;
mod error;
mod orchestrator;
mod retry;
mod tensor;

pub mod archive;
pub mod catalog;
pub mod pipeline;
pub mod sharding;

pub use checkpoint::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use orchestrator::*;
pub use retry::*;
pub use tensor::*;
