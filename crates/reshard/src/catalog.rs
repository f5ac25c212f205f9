//! Maps parameter names to partition rules.
//!
//! A mis-classified parameter would be silently corrupted by the merge/split arithmetic,
//! so classification is strict: a name must match exactly one rule.

use regex::RegexSet;

use crate::config::ModelConfig;
use crate::error::{ReshardError, Result};
use crate::sharding::{ParameterDescriptor, Partition, StageAnchor, Stack};

/// Ordered set of partition rules.
#[derive(Debug)]
pub struct ParameterCatalog {
    set: RegexSet,
    rules: Vec<ParameterDescriptor>,
}

/// Accumulates rules for a [`ParameterCatalog`].
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    rules: Vec<ParameterDescriptor>,
}

impl CatalogBuilder {
    /// Starts an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule. `pattern` is anchored at both ends when the catalog is built.
    pub fn rule<S: Into<String>>(
        mut self,
        pattern: S,
        partition: Partition,
        anchor: StageAnchor,
    ) -> Self {
        self.rules
            .push(ParameterDescriptor::new(pattern, partition, anchor));
        self
    }

    /// Adds a per-layer rule for both stacks. `suffix` follows `<stack>.layers.<n>.`.
    fn layer_rule(self, suffix: &str, partition: Partition) -> Self {
        let encoder = format!(r"encoder\.layers\.\d+\.{suffix}");
        let decoder = format!(r"decoder\.layers\.\d+\.{suffix}");
        self.rule(encoder, partition, StageAnchor::Layer(Stack::Encoder))
            .rule(decoder, partition, StageAnchor::Layer(Stack::Decoder))
    }

    /// Compiles the rules.
    pub fn build(self) -> Result<ParameterCatalog> {
        let anchored = self.rules.iter().map(|rule| format!("^(?:{})$", rule.name_pattern));
        let set = RegexSet::new(anchored)
            .map_err(|err| ReshardError::InvalidConfig(format!("bad catalog pattern: {err}")))?;
        Ok(ParameterCatalog {
            set,
            rules: self.rules,
        })
    }
}

impl ParameterCatalog {
    /// Rules for the Megatron GPT/BERT/T5 parameter naming scheme.
    ///
    /// Fused QKV projections and cross-attention projections are head-partitioned,
    /// column-parallel linears are row-partitioned (their output dimension leads), and
    /// row-parallel linears are column-partitioned. Biases of row-parallel linears and
    /// all norms are replicated.
    pub fn megatron(model: &ModelConfig) -> Result<Self> {
        let heads = Partition::Head {
            head_count: model.num_attention_heads,
        };
        let vocab = Partition::VocabRow {
            vocab_size: model.vocab_size,
        };

        CatalogBuilder::new()
            .rule(r"embedding\.word_embeddings\.weight", vocab, StageAnchor::First)
            .rule(
                r"embedding\.(?:position|tokentype)_embeddings\.weight",
                Partition::Replicated,
                StageAnchor::First,
            )
            .layer_rule(
                r"(?:input|post_attention|post_inter_attention)_layernorm\.(?:weight|bias)",
                Partition::Replicated,
            )
            .layer_rule(r"self_attention\.query_key_value\.(?:weight|bias)", heads)
            .layer_rule(r"inter_attention\.(?:query|key_value)\.(?:weight|bias)", heads)
            .layer_rule(r"(?:self|inter)_attention\.dense\.weight", Partition::Column)
            .layer_rule(r"(?:self|inter)_attention\.dense\.bias", Partition::Replicated)
            .layer_rule(r"mlp\.dense_h_to_4h\.(?:weight|bias)", Partition::Row)
            .layer_rule(r"mlp\.dense_4h_to_h\.weight", Partition::Column)
            .layer_rule(r"mlp\.dense_4h_to_h\.bias", Partition::Replicated)
            .rule(
                r"encoder\.final_layernorm\.(?:weight|bias)",
                Partition::Replicated,
                StageAnchor::LastOf(Stack::Encoder),
            )
            .rule(
                r"decoder\.final_layernorm\.(?:weight|bias)",
                Partition::Replicated,
                StageAnchor::LastOf(Stack::Decoder),
            )
            .rule(
                r"pooler\.dense\.(?:weight|bias)",
                Partition::Replicated,
                StageAnchor::LastOf(Stack::Encoder),
            )
            .rule(r"output_layer\.weight", vocab, StageAnchor::Last)
            .build()
    }

    /// Every rule, in registration order.
    pub fn rules(&self) -> &[ParameterDescriptor] {
        &self.rules
    }

    /// Finds the single rule matching a global parameter name.
    pub fn classify(&self, name: &str) -> Result<&ParameterDescriptor> {
        let matches = self.set.matches(name);
        let mut iter = matches.iter();
        match (iter.next(), iter.next()) {
            (Some(idx), None) => Ok(&self.rules[idx]),
            (None, _) => Err(ReshardError::UnknownParameterKind {
                name: name.to_string(),
            }),
            (Some(_), Some(_)) => Err(ReshardError::AmbiguousParameterKind {
                name: name.to_string(),
                patterns: matches
                    .iter()
                    .map(|idx| self.rules[idx].name_pattern.clone())
                    .collect(),
            }),
        }
    }
}
