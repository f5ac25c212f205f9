use crate::config::{ModelConfig, ParallelConfig};
use crate::error::{ReshardError, Result};
use crate::pipeline::LayerAssignment;
use crate::sharding::ShardCoord;
use crate::tensor::TensorData;

/// Parameters owned by one `(tensor_rank, pipeline_rank)` pair.
///
/// Layer parameters are named with stage-local layer indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shard {
    /// Tensor-parallel rank.
    pub tensor_rank: usize,
    /// Pipeline rank.
    pub pipeline_rank: usize,
    /// Parameters in storage order.
    pub parameters: Vec<(String, TensorData)>,
}

impl Shard {
    /// An empty shard.
    pub fn new(tensor_rank: usize, pipeline_rank: usize) -> Self {
        Self {
            tensor_rank,
            pipeline_rank,
            parameters: Vec::new(),
        }
    }

    /// Coordinates of the shard.
    pub fn coord(&self) -> ShardCoord {
        ShardCoord::new(self.tensor_rank, self.pipeline_rank)
    }

    /// Appends a parameter.
    pub fn push<S: Into<String>>(&mut self, name: S, tensor: TensorData) {
        self.parameters.push((name.into(), tensor));
    }

    /// Looks a parameter up by name.
    pub fn get(&self, name: &str) -> Option<&TensorData> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }
}

/// A whole checkpoint held in memory.
///
/// Only suitable for small models and tests; conversions stream through
/// [`ArchiveReader`](crate::archive::ArchiveReader) instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    /// Layout the shards were produced under.
    pub parallel_config: ParallelConfig,
    /// Architecture hyperparameters.
    pub model_config: ModelConfig,
    /// Shards, pipeline-major then tensor rank.
    pub shards: Vec<Shard>,
}

impl Checkpoint {
    /// Shard at the given coordinates.
    pub fn shard(&self, tensor_rank: usize, pipeline_rank: usize) -> Option<&Shard> {
        self.shards
            .iter()
            .find(|s| s.tensor_rank == tensor_rank && s.pipeline_rank == pipeline_rank)
    }

    /// Checks that every coordinate of the layout appears exactly once, in mesh order,
    /// and returns the layer assignment implied by the configuration.
    pub fn validate(&self) -> Result<LayerAssignment> {
        let assignment = LayerAssignment::compute(&self.model_config, &self.parallel_config)?;
        let mesh = self.parallel_config.mesh()?;
        if mesh.len() != self.shards.len() {
            return Err(ReshardError::InvalidConfig(format!(
                "{} shards for layout {} which needs {}",
                self.shards.len(),
                self.parallel_config,
                mesh.len()
            )));
        }
        for (expected, shard) in mesh.iter().zip(&self.shards) {
            if *expected != shard.coord() {
                return Err(ReshardError::InvalidConfig(format!(
                    "shard at tensor rank {} pipeline rank {} is out of order, expected {:?}",
                    shard.tensor_rank, shard.pipeline_rank, expected
                )));
            }
        }
        Ok(assignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ModelConfig {
        ModelConfig {
            num_layers: 2,
            num_decoder_layers: None,
            hidden_size: 4,
            num_attention_heads: 2,
            vocab_size: 8,
        }
    }

    #[test]
    fn test_validate_accepts_mesh_order() {
        let checkpoint = Checkpoint {
            parallel_config: ParallelConfig::new(2, 2),
            model_config: model(),
            shards: vec![
                Shard::new(0, 0),
                Shard::new(1, 0),
                Shard::new(0, 1),
                Shard::new(1, 1),
            ],
        };

        let assignment = checkpoint.validate().unwrap();
        assert_eq!(assignment.num_stages(), 2);
        assert!(checkpoint.shard(1, 1).is_some());
        assert!(checkpoint.shard(2, 0).is_none());
    }

    #[test]
    #[should_panic = "is out of order"]
    fn test_validate_rejects_tensor_major_order() {
        let checkpoint = Checkpoint {
            parallel_config: ParallelConfig::new(2, 2),
            model_config: model(),
            shards: vec![
                Shard::new(0, 0),
                Shard::new(0, 1),
                Shard::new(1, 0),
                Shard::new(1, 1),
            ],
        };
        checkpoint.validate().unwrap();
    }

    #[test]
    fn test_shard_lookup() {
        let mut shard = Shard::new(0, 0);
        shard.push("a", TensorData::from_f32(vec![1], &[1.0]));

        assert!(shard.get("a").is_some());
        assert!(shard.get("b").is_none());
    }
}
