use core::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReshardError, Result};
use crate::retry::RetryPolicy;
use crate::sharding::{DeviceMesh, ShardCoord, shard_mesh};

/// Tensor- and pipeline-parallel layout of a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Number of ranks each weight matrix is split across.
    pub tensor_parallel_size: usize,
    /// Number of ranks the transformer layers are distributed across.
    pub pipeline_parallel_size: usize,
    /// First pipeline rank holding decoder layers, for encoder/decoder models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_split_rank: Option<usize>,
}

impl ParallelConfig {
    /// A layout without an encoder/decoder split.
    pub fn new(tensor_parallel_size: usize, pipeline_parallel_size: usize) -> Self {
        Self {
            tensor_parallel_size,
            pipeline_parallel_size,
            pipeline_split_rank: None,
        }
    }

    /// Sets the encoder/decoder split rank.
    pub fn with_split_rank(mut self, split_rank: usize) -> Self {
        self.pipeline_split_rank = Some(split_rank);
        self
    }

    /// Number of shards in a checkpoint with this layout.
    pub fn world_size(&self) -> usize {
        self.tensor_parallel_size * self.pipeline_parallel_size
    }

    /// Checks degree and split-rank ranges. Model-dependent checks live in
    /// [`LayerAssignment::compute`](crate::pipeline::LayerAssignment::compute).
    pub fn validate(&self) -> Result<()> {
        if self.tensor_parallel_size == 0 {
            return Err(ReshardError::InvalidConfig(
                "tensor_parallel_size must be at least 1".to_string(),
            ));
        }
        if self.pipeline_parallel_size == 0 {
            return Err(ReshardError::InvalidConfig(
                "pipeline_parallel_size must be at least 1".to_string(),
            ));
        }
        if let Some(split) = self.pipeline_split_rank {
            if split == 0 || split >= self.pipeline_parallel_size {
                return Err(ReshardError::InvalidSplitRank {
                    split_rank: Some(split),
                    pipeline_parallel_size: self.pipeline_parallel_size,
                    reason: "split rank must lie strictly between 0 and the pipeline size"
                        .to_string(),
                });
            }
        }
        Ok(())
    }

    /// The `[pipeline, tensor]` mesh of shard coordinates, pipeline-major.
    pub fn mesh(&self) -> Result<DeviceMesh<ShardCoord>> {
        shard_mesh(self.tensor_parallel_size, self.pipeline_parallel_size)
            .map_err(|err| ReshardError::InvalidConfig(err.to_string()))
    }
}

impl fmt::Display for ParallelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TP={} PP={}",
            self.tensor_parallel_size, self.pipeline_parallel_size
        )?;
        if let Some(split) = self.pipeline_split_rank {
            write!(f, " split={split}")?;
        }
        Ok(())
    }
}

/// Architecture hyperparameters needed to interpret a checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Layers of the encoder stack, or of the only stack of a decoder-only model.
    pub num_layers: usize,
    /// Layers of the decoder stack of an encoder/decoder model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_decoder_layers: Option<usize>,
    /// Hidden size.
    pub hidden_size: usize,
    /// Attention heads per layer.
    pub num_attention_heads: usize,
    /// True vocabulary size, without padding.
    pub vocab_size: usize,
}

impl ModelConfig {
    /// Whether the model has a decoder stack.
    pub fn has_decoder(&self) -> bool {
        self.num_decoder_layers.is_some()
    }

    /// Rejects zero-sized hyperparameters.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("num_layers", self.num_layers),
            ("hidden_size", self.hidden_size),
            ("num_attention_heads", self.num_attention_heads),
            ("vocab_size", self.vocab_size),
            ("num_decoder_layers", self.num_decoder_layers.unwrap_or(1)),
        ];
        for (field, value) in fields {
            if value == 0 {
                return Err(ReshardError::InvalidConfig(format!(
                    "model {field} must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_queue_capacity() -> usize {
    8
}

fn default_vocab_divisor() -> usize {
    128
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

/// Tuning knobs of a conversion. None of them change the produced tensors except
/// `make_vocab_size_divisible_by`, which sets the vocabulary padding granularity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshardOptions {
    /// Worker threads converting parameters.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Parameters that may be converting or waiting for the writer at once. Workers pause
    /// rather than run further ahead of the writer.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Vocabulary tables are padded to a multiple of this times the target TP degree.
    #[serde(default = "default_vocab_divisor")]
    pub make_vocab_size_divisible_by: usize,
    /// Retry policy for transient read failures.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Deadline for a single blob read. An expired read counts as a transient timeout.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for ReshardOptions {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            make_vocab_size_divisible_by: default_vocab_divisor(),
            retry: RetryPolicy::default(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl ReshardOptions {
    /// Loads options from a JSON file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| ReshardError::io(path, err))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|err| {
            ReshardError::InvalidConfig(format!("cannot parse {}: {err}", path.display()))
        })
    }

    /// Saves options as pretty-printed JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|err| ReshardError::io(path, err))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .map_err(|err| ReshardError::io(path, err.into()))?;
        writer.flush().map_err(|err| ReshardError::io(path, err))
    }

    /// Deadline for a single blob read.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Rejects zero-sized pools, queues, divisors and read deadlines.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ReshardError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ReshardError::InvalidConfig(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.make_vocab_size_divisible_by == 0 {
            return Err(ReshardError::InvalidConfig(
                "make_vocab_size_divisible_by must be at least 1".into(),
            ));
        }
        if self.read_timeout_ms == 0 {
            return Err(ReshardError::InvalidConfig(
                "read_timeout_ms must be at least 1".into(),
            ));
        }
        self.retry.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_config_world_size_and_display() {
        let config = ParallelConfig::new(2, 4).with_split_rank(2);

        assert_eq!(config.world_size(), 8);
        assert_eq!(config.to_string(), "TP=2 PP=4 split=2");
        assert!(config.validate().is_ok());
    }

    #[test]
    #[should_panic = "InvalidSplitRank"]
    fn test_split_rank_zero_is_rejected() {
        ParallelConfig::new(1, 2).with_split_rank(0).validate().unwrap();
    }

    #[test]
    #[should_panic = "InvalidSplitRank"]
    fn test_split_rank_past_last_stage_is_rejected() {
        ParallelConfig::new(1, 2).with_split_rank(2).validate().unwrap();
    }

    #[test]
    #[should_panic = "tensor_parallel_size must be at least 1"]
    fn test_zero_tensor_parallel_is_rejected() {
        ParallelConfig::new(0, 1).validate().unwrap();
    }

    #[test]
    fn test_options_fill_missing_fields_with_defaults() {
        let options: ReshardOptions =
            serde_json::from_str(r#"{ "queue_capacity": 2 }"#).unwrap();

        assert_eq!(options.queue_capacity, 2);
        assert_eq!(options.make_vocab_size_divisible_by, 128);
        assert_eq!(options.retry, RetryPolicy::default());
        assert_eq!(options.read_timeout(), Duration::from_secs(30));
        assert!(options.workers >= 1);
    }

    #[test]
    fn test_options_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        let options = ReshardOptions {
            workers: 3,
            ..ReshardOptions::default()
        };

        options.save(&path).unwrap();
        assert_eq!(ReshardOptions::load(&path).unwrap(), options);
    }

    #[test]
    fn test_split_rank_omitted_from_json_when_absent() {
        let json = serde_json::to_string(&ParallelConfig::new(2, 1)).unwrap();
        assert_eq!(json, r#"{"tensor_parallel_size":2,"pipeline_parallel_size":1}"#);
    }
}
