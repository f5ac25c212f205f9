use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::ParallelConfig;

/// Errors raised while reading, converting or writing a checkpoint.
///
/// Every variant carries enough context (parameter name, shapes, rank indices, paths)
/// to diagnose the failure without re-running the conversion.
#[derive(Debug, Error)]
pub enum ReshardError {
    /// The manifest or a shard blob is structurally invalid.
    #[error("archive `{}` is corrupt: {reason}", .path.display())]
    ArchiveCorrupt {
        /// Archive root or the offending file.
        path: PathBuf,
        /// What was found to be inconsistent.
        reason: String,
    },

    /// The archive declares a format version this reader does not understand.
    #[error("archive format version {found} is not supported (this reader handles version {supported})")]
    ArchiveIncompatible {
        /// Version declared by the manifest.
        found: u32,
        /// Version understood by this build.
        supported: u32,
    },

    /// No catalog rule matches the parameter name.
    #[error("no partition rule matches parameter `{name}`")]
    UnknownParameterKind {
        /// Global parameter name.
        name: String,
    },

    /// More than one catalog rule matches the parameter name.
    #[error("parameter `{name}` matches several partition rules: {patterns:?}")]
    AmbiguousParameterKind {
        /// Global parameter name.
        name: String,
        /// Every pattern that matched.
        patterns: Vec<String>,
    },

    /// A dimension (or head count) cannot be divided evenly by the target degree.
    #[error(
        "parameter `{name}` with shape {shape:?} cannot split {what} of {extent} into {degree} equal parts"
    )]
    IndivisiblePartition {
        /// Global parameter name.
        name: String,
        /// Full (merged) shape of the parameter.
        shape: Vec<usize>,
        /// Which extent was being divided (`dim 0`, `dim 1`, `heads`).
        what: String,
        /// Size of that extent.
        extent: usize,
        /// Target tensor-parallel degree.
        degree: usize,
    },

    /// Shards of one parameter disagree on dtype or on a dimension that is not partitioned.
    #[error("parameter `{name}` on tensor rank {tensor_rank}: expected {expected}, found {found}")]
    ShapeMismatch {
        /// Global parameter name.
        name: String,
        /// Tensor rank whose copy disagrees.
        tensor_rank: usize,
        /// What the other shards declare.
        expected: String,
        /// What this shard declares.
        found: String,
    },

    /// A replicated parameter is not byte-identical across tensor ranks.
    #[error("replicated parameter `{name}` differs between tensor rank 0 and tensor rank {tensor_rank}")]
    ReplicaMismatch {
        /// Global parameter name.
        name: String,
        /// First tensor rank whose copy differs from rank 0.
        tensor_rank: usize,
    },

    /// The pipeline split rank does not describe a valid encoder/decoder boundary.
    #[error("invalid pipeline split rank {split_rank:?} for pipeline size {pipeline_parallel_size}: {reason}")]
    InvalidSplitRank {
        /// The requested split rank.
        split_rank: Option<usize>,
        /// Pipeline-parallel degree it was checked against.
        pipeline_parallel_size: usize,
        /// Why it was rejected.
        reason: String,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested source layout is not the one the archive declares.
    #[error("source layout {requested} does not match the archive layout {declared}")]
    ConfigMismatch {
        /// Layout passed by the caller.
        requested: ParallelConfig,
        /// Layout recorded in the manifest.
        declared: ParallelConfig,
    },

    /// A transient I/O failure kept timing out after every retry.
    #[error("timed out on `{}` after {attempts} attempts", .path.display())]
    IoTimeout {
        /// File being accessed.
        path: PathBuf,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// An I/O operation failed.
    #[error("I/O failure on `{}`: {source}", .path.display())]
    Io {
        /// File or directory being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Another conversion currently owns the output path.
    #[error("output `{}` is being written by another conversion", .path.display())]
    ArchiveBusy {
        /// Contended output path.
        path: PathBuf,
    },

    /// The output path already exists; archives are never overwritten.
    #[error("output `{}` already exists", .path.display())]
    OutputExists {
        /// Existing output path.
        path: PathBuf,
    },

    /// The conversion was cancelled before it finished.
    #[error("conversion cancelled")]
    Cancelled,
}

/// Result type alias for resharding operations.
pub type Result<T> = core::result::Result<T, ReshardError>;

impl ReshardError {
    pub(crate) fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::ArchiveCorrupt {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape_mismatch(
        name: &str,
        tensor_rank: usize,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::ShapeMismatch {
            name: name.to_string(),
            tensor_rank,
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Whether retrying the failed operation could succeed.
    ///
    /// Data-integrity failures are deterministic and never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::IoTimeout { .. } => true,
            Self::Io { source, .. } => is_transient_io(source),
            _ => false,
        }
    }
}

pub(crate) fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}
