//! Merge and re-split of tensor-parallel shards.
//!
//! Every parameter goes through the full, unsharded tensor: merge the source shards with
//! the partition's merge rule, then split for the target degree. This works for any pair
//! of degrees, and peak memory is bounded by the largest single parameter.

use serde::Serialize;

use crate::catalog::ParameterCatalog;
use crate::error::{ReshardError, Result};
use crate::sharding::Partition;
use crate::tensor::{DType, TensorData};

/// Zero rows appended to a vocabulary table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Padding {
    /// Rows in the true vocabulary.
    pub vocab_size: usize,
    /// Rows after padding, summed over all target ranks.
    pub padded_rows: usize,
}

impl Padding {
    /// Number of zero rows added.
    pub fn added_rows(&self) -> usize {
        self.padded_rows - self.vocab_size
    }
}

/// Output of resharding one parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resharded {
    /// Unsharded shape, after padding.
    pub full_shape: Vec<usize>,
    /// One tensor per target tensor rank, in rank order.
    pub shards: Vec<TensorData>,
    /// Vocabulary padding applied, if any.
    pub padding: Option<Padding>,
}

/// Stateless merge/split arithmetic, parameterised by the vocabulary padding divisor.
#[derive(Clone, Copy, Debug)]
pub struct ReshardEngine {
    vocab_divisor: usize,
}

impl Default for ReshardEngine {
    fn default() -> Self {
        Self::new(128)
    }
}

fn describe(dtype: DType, shape: &[usize]) -> String {
    format!("{dtype}{shape:?}")
}

impl ReshardEngine {
    /// Pads vocabulary tables to a multiple of `vocab_divisor × target degree`.
    pub fn new(vocab_divisor: usize) -> Self {
        Self {
            vocab_divisor: vocab_divisor.max(1),
        }
    }

    /// Rows of a vocabulary table of `vocab_size` entries split over `degree` ranks.
    pub fn padded_vocab_size(&self, vocab_size: usize, degree: usize) -> usize {
        vocab_size.next_multiple_of(self.vocab_divisor * degree)
    }

    /// Merges and re-splits one parameter for `target_degree` tensor ranks.
    pub fn reshard(
        &self,
        name: &str,
        partition: Partition,
        shards: &[TensorData],
        target_degree: usize,
    ) -> Result<Resharded> {
        let full = self.merge(name, partition, shards)?;
        self.split(name, partition, full, target_degree)
    }

    /// Reconstructs the unsharded tensor from shards in tensor-rank order.
    ///
    /// Vocabulary tables come back without padding rows.
    pub fn merge(&self, name: &str, partition: Partition, shards: &[TensorData]) -> Result<TensorData> {
        let first = shards.first().ok_or_else(|| ReshardError::ShapeMismatch {
            name: name.to_string(),
            tensor_rank: 0,
            expected: "at least one shard".to_string(),
            found: "none".to_string(),
        })?;

        for (rank, shard) in shards.iter().enumerate().skip(1) {
            if shard.dtype() != first.dtype() || shard.shape().len() != first.shape().len() {
                return Err(ReshardError::shape_mismatch(
                    name,
                    rank,
                    describe(first.dtype(), first.shape()),
                    describe(shard.dtype(), shard.shape()),
                ));
            }
        }

        match partition {
            Partition::Replicated => {
                for (rank, shard) in shards.iter().enumerate().skip(1) {
                    if shard.shape() != first.shape() {
                        return Err(ReshardError::shape_mismatch(
                            name,
                            rank,
                            describe(first.dtype(), first.shape()),
                            describe(shard.dtype(), shard.shape()),
                        ));
                    }
                    if shard.bytes() != first.bytes() {
                        return Err(ReshardError::ReplicaMismatch {
                            name: name.to_string(),
                            tensor_rank: rank,
                        });
                    }
                }
                Ok(first.clone())
            }
            Partition::Row => {
                check_other_dims(name, shards, 0)?;
                Ok(TensorData::concat_leading(shards))
            }
            Partition::Column => {
                let last = first.shape().len().checked_sub(1).ok_or_else(|| {
                    ReshardError::shape_mismatch(name, 0, "a tensor with a trailing dimension", "a scalar")
                })?;
                check_other_dims(name, shards, last)?;
                Ok(TensorData::concat_trailing(shards))
            }
            Partition::Head { head_count } => {
                check_other_dims(name, shards, 0)?;
                let rows: usize = shards.iter().map(|s| s.shape()[0]).sum();
                if head_count == 0 || rows % head_count != 0 {
                    return Err(ReshardError::shape_mismatch(
                        name,
                        0,
                        format!("a leading dimension made of {head_count} equal head blocks"),
                        format!("{rows} rows"),
                    ));
                }
                let block = rows / head_count;
                for (rank, shard) in shards.iter().enumerate() {
                    if shard.shape()[0] % block != 0 {
                        return Err(ReshardError::shape_mismatch(
                            name,
                            rank,
                            format!("whole head blocks of {block} rows"),
                            format!("{} rows", shard.shape()[0]),
                        ));
                    }
                }
                // Each rank holds a contiguous run of heads, so rank order is head order.
                Ok(TensorData::concat_leading(shards))
            }
            Partition::VocabRow { vocab_size } => {
                check_other_dims(name, shards, 0)?;
                let merged = TensorData::concat_leading(shards);
                let rows = merged.shape()[0];
                if rows < vocab_size {
                    return Err(ReshardError::shape_mismatch(
                        name,
                        0,
                        format!("at least {vocab_size} vocabulary rows"),
                        format!("{rows} rows"),
                    ));
                }
                Ok(merged.resize_leading(vocab_size))
            }
        }
    }

    /// Splits an unsharded tensor into `degree` shards.
    pub fn split(
        &self,
        name: &str,
        partition: Partition,
        full: TensorData,
        degree: usize,
    ) -> Result<Resharded> {
        let indivisible = |what: &str, extent: usize, full: &TensorData| {
            ReshardError::IndivisiblePartition {
                name: name.to_string(),
                shape: full.shape().to_vec(),
                what: what.to_string(),
                extent,
                degree,
            }
        };
        if degree == 0 {
            return Err(ReshardError::InvalidConfig(
                "target tensor-parallel degree must be at least 1".to_string(),
            ));
        }

        let mut full_shape = full.shape().to_vec();
        let mut padding = None;
        let shards = match partition {
            Partition::Replicated => vec![full; degree],
            Partition::Row => {
                let rows = leading(name, &full)?;
                if rows % degree != 0 {
                    return Err(indivisible("dim 0", rows, &full));
                }
                full.split_leading(&vec![rows / degree; degree])
            }
            Partition::Column => {
                let last = full.shape().len().checked_sub(1).ok_or_else(|| {
                    ReshardError::shape_mismatch(name, 0, "a tensor with a trailing dimension", "a scalar")
                })?;
                let cols = full.shape()[last];
                if cols % degree != 0 {
                    return Err(indivisible(&format!("dim {last}"), cols, &full));
                }
                full.split_trailing(degree)
            }
            Partition::Head { head_count } => {
                let rows = leading(name, &full)?;
                if head_count == 0 || rows % head_count != 0 {
                    return Err(ReshardError::shape_mismatch(
                        name,
                        0,
                        format!("a leading dimension made of {head_count} equal head blocks"),
                        format!("{rows} rows"),
                    ));
                }
                if head_count % degree != 0 {
                    return Err(indivisible("heads", head_count, &full));
                }
                let block = rows / head_count;
                full.split_leading(&vec![block * (head_count / degree); degree])
            }
            Partition::VocabRow { vocab_size } => {
                let rows = leading(name, &full)?;
                if rows < vocab_size {
                    return Err(ReshardError::shape_mismatch(
                        name,
                        0,
                        format!("at least {vocab_size} vocabulary rows"),
                        format!("{rows} rows"),
                    ));
                }
                let padded_rows = self.padded_vocab_size(vocab_size, degree);
                if padded_rows > vocab_size {
                    padding = Some(Padding {
                        vocab_size,
                        padded_rows,
                    });
                }
                full_shape[0] = padded_rows;
                // Anything past the true vocabulary is padding and is rewritten as zeros.
                full.resize_leading(vocab_size)
                    .resize_leading(padded_rows)
                    .split_leading(&vec![padded_rows / degree; degree])
            }
        };

        Ok(Resharded {
            full_shape,
            shards,
            padding,
        })
    }

    /// Reshards every parameter of one pipeline stage.
    ///
    /// `shards` holds one `(name, tensor)` list per source tensor rank, all listing the
    /// same names in the same order. Returns one list per target tensor rank.
    pub fn reshard_stage(
        &self,
        catalog: &ParameterCatalog,
        shards: &[Vec<(String, TensorData)>],
        target_degree: usize,
    ) -> Result<Vec<Vec<(String, TensorData)>>> {
        let mut out = vec![Vec::new(); target_degree];
        let Some(first) = shards.first() else {
            return Ok(out);
        };

        for (idx, (name, _)) in first.iter().enumerate() {
            let mut parts = Vec::with_capacity(shards.len());
            for (rank, shard) in shards.iter().enumerate() {
                match shard.get(idx) {
                    Some((other, tensor)) if other == name => parts.push(tensor.clone()),
                    _ => {
                        return Err(ReshardError::shape_mismatch(
                            name,
                            rank,
                            format!("parameter `{name}` at position {idx}"),
                            "a different parameter list",
                        ));
                    }
                }
            }
            let descriptor = catalog.classify(name)?;
            let resharded = self.reshard(name, descriptor.partition, &parts, target_degree)?;
            for (target, tensor) in out.iter_mut().zip(resharded.shards) {
                target.push((name.clone(), tensor));
            }
        }
        Ok(out)
    }
}

fn leading(name: &str, tensor: &TensorData) -> Result<usize> {
    tensor.shape().first().copied().ok_or_else(|| {
        ReshardError::shape_mismatch(name, 0, "a tensor with a leading dimension", "a scalar")
    })
}

/// Checks that all dims except `dim` agree across shards.
fn check_other_dims(name: &str, shards: &[TensorData], dim: usize) -> Result<()> {
    let first = &shards[0];
    if first.shape().is_empty() {
        return Err(ReshardError::shape_mismatch(
            name,
            0,
            "a tensor with at least one dimension",
            "a scalar",
        ));
    }
    for (rank, shard) in shards.iter().enumerate().skip(1) {
        let agrees = shard
            .shape()
            .iter()
            .zip(first.shape())
            .enumerate()
            .all(|(d, (a, b))| d == dim || a == b);
        if !agrees {
            return Err(ReshardError::shape_mismatch(
                name,
                rank,
                describe(first.dtype(), first.shape()),
                describe(shard.dtype(), shard.shape()),
            ));
        }
    }
    Ok(())
}
