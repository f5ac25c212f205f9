use core::fmt;

use serde::{Deserialize, Serialize};

/// The axis along which a parameter is partitioned across tensor-parallel ranks.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionAxis {
    /// Fully replicated.
    None,
    /// Leading dimension.
    Row,
    /// Trailing dimension.
    Column,
    /// Leading dimension, in whole attention-head blocks.
    Head,
}

impl fmt::Display for PartitionAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartitionAxis::None => "none",
            PartitionAxis::Row => "row",
            PartitionAxis::Column => "column",
            PartitionAxis::Head => "head",
        })
    }
}

/// Describes how a single parameter is distributed over tensor-parallel ranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Partition {
    /// Every rank holds an identical copy.
    Replicated,
    /// Ranks hold consecutive slices of the leading dimension.
    Row,
    /// Ranks hold consecutive slices of the trailing dimension.
    Column,
    /// The leading dimension is `head_count` equal blocks and ranks hold whole blocks.
    Head {
        /// Number of attention heads in the unsharded tensor.
        head_count: usize,
    },
    /// A row partition over a vocabulary, padded so every rank gets an equal slice.
    ///
    /// Rows at index `vocab_size` and above are zero padding.
    VocabRow {
        /// True vocabulary size, without padding.
        vocab_size: usize,
    },
}

impl Partition {
    /// The axis this partition splits.
    pub fn axis(&self) -> PartitionAxis {
        match self {
            Partition::Replicated => PartitionAxis::None,
            Partition::Row | Partition::VocabRow { .. } => PartitionAxis::Row,
            Partition::Column => PartitionAxis::Column,
            Partition::Head { .. } => PartitionAxis::Head,
        }
    }
}

/// One of the two transformer stacks a layer can belong to.
///
/// Decoder-only models keep all of their layers in the `Encoder` stack; the name follows
/// the parameter naming scheme rather than the architecture.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stack {
    /// The first (or only) stack.
    Encoder,
    /// The decoder stack of an encoder/decoder model.
    Decoder,
}

impl Stack {
    /// Prefix used by parameter names of this stack.
    pub fn prefix(self) -> &'static str {
        match self {
            Stack::Encoder => "encoder",
            Stack::Decoder => "decoder",
        }
    }
}

impl fmt::Display for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Which pipeline stage owns a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageAnchor {
    /// A per-layer parameter, owned by the stage holding that layer of `Stack`.
    Layer(Stack),
    /// Owned by pipeline rank 0 (embeddings).
    First,
    /// Owned by the last pipeline rank (output head).
    Last,
    /// Owned by the last pipeline rank holding layers of the stack (final norms).
    LastOf(Stack),
}

/// Partition rule for every parameter whose name matches `name_pattern`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterDescriptor {
    /// Anchored regular expression over global parameter names.
    pub name_pattern: String,
    /// How the parameter is split across tensor-parallel ranks.
    pub partition: Partition,
    /// Which pipeline stage owns the parameter.
    pub anchor: StageAnchor,
}

impl ParameterDescriptor {
    /// Creates a descriptor.
    pub fn new<S: Into<String>>(name_pattern: S, partition: Partition, anchor: StageAnchor) -> Self {
        Self {
            name_pattern: name_pattern.into(),
            partition,
            anchor,
        }
    }

    /// Shorthand for `self.partition.axis()`.
    pub fn axis(&self) -> PartitionAxis {
        self.partition.axis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vocab_row_is_a_row_partition() {
        assert_eq!(Partition::VocabRow { vocab_size: 10 }.axis(), PartitionAxis::Row);
        assert_eq!(Partition::Head { head_count: 4 }.axis(), PartitionAxis::Head);
        assert_eq!(Partition::Replicated.axis(), PartitionAxis::None);
    }

    #[test]
    fn test_axis_serializes_lowercase() {
        let json = serde_json::to_string(&PartitionAxis::Column).unwrap();
        assert_eq!(json, "\"column\"");
    }
}
