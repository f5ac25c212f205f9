//! Assignment of transformer layers to pipeline stages.
//!
//! Archives name layer parameters with *local* layer indices (`encoder.layers.0.*` is the
//! first layer held by that stage). Resharding along the pipeline axis therefore goes
//! through global names: local → global with the source assignment, then global → local
//! with the target assignment.

use core::ops::Range;

use serde::{Deserialize, Serialize};

use crate::config::{ModelConfig, ParallelConfig};
use crate::error::{ReshardError, Result};
use crate::sharding::{StageAnchor, Stack};

/// Global layer ranges held by one pipeline stage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLayers {
    /// Encoder (or only-stack) layers.
    pub encoder: Range<usize>,
    /// Decoder layers. Empty for decoder-only models.
    #[serde(default)]
    pub decoder: Range<usize>,
}

impl StageLayers {
    /// Layer range of the given stack.
    pub fn range(&self, stack: Stack) -> &Range<usize> {
        match stack {
            Stack::Encoder => &self.encoder,
            Stack::Decoder => &self.decoder,
        }
    }

    fn range_mut(&mut self, stack: Stack) -> &mut Range<usize> {
        match stack {
            Stack::Encoder => &mut self.encoder,
            Stack::Decoder => &mut self.decoder,
        }
    }

    /// Total layers held by this stage.
    pub fn num_layers(&self) -> usize {
        self.encoder.len() + self.decoder.len()
    }
}

/// Layer ranges of every pipeline stage, indexed by pipeline rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerAssignment {
    stages: Vec<StageLayers>,
}

/// Splits `layers` consecutive layers over `ranks` stages, earlier stages taking the remainder.
fn distribute(layers: usize, ranks: usize) -> Vec<Range<usize>> {
    let base = layers / ranks;
    let remainder = layers % ranks;
    let mut start = 0;
    (0..ranks)
        .map(|rank| {
            let len = base + usize::from(rank < remainder);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

impl LayerAssignment {
    /// Computes the assignment of `model`'s layers for `config`.
    ///
    /// Without a split rank every stage holds a slice of the encoder stack; an
    /// encoder/decoder model may then only use a single stage, which holds both stacks.
    /// With a split rank, encoder layers go to `[0, split)` and decoder layers to
    /// `[split, pp)`. Every stage must receive at least one layer.
    pub fn compute(model: &ModelConfig, config: &ParallelConfig) -> Result<Self> {
        config.validate()?;
        model.validate()?;
        let pp = config.pipeline_parallel_size;
        let split_error = |reason: &str| ReshardError::InvalidSplitRank {
            split_rank: config.pipeline_split_rank,
            pipeline_parallel_size: pp,
            reason: reason.to_string(),
        };

        let mut stages = vec![StageLayers::default(); pp];
        match (config.pipeline_split_rank, model.num_decoder_layers) {
            (Some(_), None) => {
                return Err(split_error(
                    "the model has no decoder stack to place after the split",
                ));
            }
            (None, Some(decoder_layers)) => {
                if pp > 1 {
                    return Err(split_error(
                        "an encoder/decoder model needs a split rank to use more than one stage",
                    ));
                }
                stages[0].encoder = 0..model.num_layers;
                stages[0].decoder = 0..decoder_layers;
            }
            (None, None) => {
                Self::fill(&mut stages, Stack::Encoder, model.num_layers)?;
            }
            (Some(split), Some(decoder_layers)) => {
                let (encoder_stages, decoder_stages) = stages.split_at_mut(split);
                Self::fill(encoder_stages, Stack::Encoder, model.num_layers)?;
                Self::fill(decoder_stages, Stack::Decoder, decoder_layers)?;
            }
        }

        Ok(Self { stages })
    }

    fn fill(stages: &mut [StageLayers], stack: Stack, layers: usize) -> Result<()> {
        let ranks = stages.len();
        if layers < ranks {
            return Err(ReshardError::InvalidConfig(format!(
                "{layers} {stack} layers cannot give each of {ranks} pipeline stages a layer"
            )));
        }
        for (stage, range) in stages.iter_mut().zip(distribute(layers, ranks)) {
            *stage.range_mut(stack) = range;
        }
        Ok(())
    }

    /// Wraps stages declared by an archive, checking that each stack is covered exactly
    /// once by contiguous ranges in rank order.
    pub fn from_stages(stages: Vec<StageLayers>, model: &ModelConfig) -> Result<Self> {
        let assignment = Self { stages };
        assignment
            .check_coverage(Stack::Encoder, model.num_layers)
            .and_then(|_| {
                assignment.check_coverage(Stack::Decoder, model.num_decoder_layers.unwrap_or(0))
            })
            .map_err(ReshardError::InvalidConfig)?;
        Ok(assignment)
    }

    fn check_coverage(&self, stack: Stack, layers: usize) -> core::result::Result<(), String> {
        let mut next = 0;
        for (rank, stage) in self.stages.iter().enumerate() {
            let range = stage.range(stack);
            if range.is_empty() {
                continue;
            }
            if range.start != next {
                return Err(format!(
                    "{stack} layers of stage {rank} start at {} but {next} was expected",
                    range.start
                ));
            }
            next = range.end;
        }
        if next != layers {
            return Err(format!(
                "{stack} stages cover {next} layers but the model has {layers}"
            ));
        }
        Ok(())
    }

    /// Per-stage ranges, indexed by pipeline rank.
    pub fn stages(&self) -> &[StageLayers] {
        &self.stages
    }

    /// Ranges of one stage.
    pub fn stage(&self, pipeline_rank: usize) -> Option<&StageLayers> {
        self.stages.get(pipeline_rank)
    }

    /// Number of pipeline stages.
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Stage holding global layer `layer` of `stack`.
    pub fn rank_of_layer(&self, stack: Stack, layer: usize) -> Option<usize> {
        self.stages
            .iter()
            .position(|stage| stage.range(stack).contains(&layer))
    }

    /// Last stage holding layers of `stack`.
    pub fn last_rank_of(&self, stack: Stack) -> Option<usize> {
        self.stages
            .iter()
            .rposition(|stage| !stage.range(stack).is_empty())
    }

    /// Stage owning a parameter, given its anchor and (for layer parameters) its global
    /// layer index.
    pub fn owner(&self, anchor: StageAnchor, layer: Option<usize>) -> Option<usize> {
        match anchor {
            StageAnchor::First => Some(0),
            StageAnchor::Last => self.stages.len().checked_sub(1),
            StageAnchor::LastOf(stack) => self.last_rank_of(stack),
            StageAnchor::Layer(stack) => self.rank_of_layer(stack, layer?),
        }
    }
}

/// A parameter name of the form `<stack>.layers.<index>.<suffix>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayerName<'a> {
    /// Stack the layer belongs to.
    pub stack: Stack,
    /// Layer index, local or global depending on context.
    pub index: usize,
    /// Everything after the index.
    pub suffix: &'a str,
}

impl<'a> LayerName<'a> {
    /// Parses a layer parameter name. Returns `None` for pre/post-process parameters.
    pub fn parse(name: &'a str) -> Option<Self> {
        let (stack, rest) = name.split_once('.')?;
        let stack = match stack {
            "encoder" => Stack::Encoder,
            "decoder" => Stack::Decoder,
            _ => return None,
        };
        let (index, suffix) = rest.strip_prefix("layers.")?.split_once('.')?;
        let index = index.parse().ok()?;
        Some(Self {
            stack,
            index,
            suffix,
        })
    }

    fn with_index(&self, index: usize) -> String {
        format!("{}.layers.{index}.{}", self.stack.prefix(), self.suffix)
    }
}

/// Rewrites a stage-local parameter name to its global name.
///
/// Returns `None` when the local index lies outside the stage's layers.
pub fn to_global(name: &str, stage: &StageLayers) -> Option<String> {
    match LayerName::parse(name) {
        Some(layer) => {
            let range = stage.range(layer.stack);
            let global = range.start.checked_add(layer.index)?;
            range.contains(&global).then(|| layer.with_index(global))
        }
        None => Some(name.to_string()),
    }
}

/// Rewrites a global parameter name to the local name used by `stage`.
///
/// Returns `None` when the stage does not hold that layer.
pub fn to_local(name: &str, stage: &StageLayers) -> Option<String> {
    match LayerName::parse(name) {
        Some(layer) => {
            let range = stage.range(layer.stack);
            range
                .contains(&layer.index)
                .then(|| layer.with_index(layer.index - range.start))
        }
        None => Some(name.to_string()),
    }
}
