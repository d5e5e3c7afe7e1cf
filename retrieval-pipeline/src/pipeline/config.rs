use common::types::DocumentType;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::scoring::{BoostMagnitudes, WeightSplit};

/// Immutable per-call configuration for the retrieval pipeline. Thresholds
/// are assumed to satisfy `fallback <= relevance <= answer`; the ladder in
/// the orchestrator relies on that ordering without enforcing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    pub weights: WeightSplit,
    pub boosts: BoostMagnitudes,
    pub relevance_threshold: f32,
    pub answer_threshold: f32,
    pub fallback_threshold: f32,
    pub mmr_lambda: f32,
    pub max_initial_chunks: usize,
    pub mmr_result_count: usize,
    pub max_chunks: usize,
    pub max_chunks_per_doc: usize,
    pub max_tokens: usize,
    pub max_tokens_per_chunk: usize,
    pub reranker_enabled: bool,
    pub rerank_timeout_ms: u64,
    pub embed_timeout_ms: u64,
    /// `config` drops empty arrays when layering the serialized defaults, so
    /// the field must tolerate being absent after deserialization.
    #[serde(default)]
    pub extra_stopwords: Vec<String>,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            weights: WeightSplit::default(),
            boosts: BoostMagnitudes::default(),
            relevance_threshold: 0.35,
            answer_threshold: 0.45,
            fallback_threshold: 0.25,
            mmr_lambda: 0.7,
            max_initial_chunks: 120,
            mmr_result_count: 12,
            max_chunks: 8,
            max_chunks_per_doc: 5,
            max_tokens: 2800,
            max_tokens_per_chunk: 600,
            reranker_enabled: false,
            rerank_timeout_ms: 2_000,
            embed_timeout_ms: 5_000,
            extra_stopwords: Vec::new(),
        }
    }
}

impl RagConfig {
    /// Normalize the weight split so downstream code can rely on the
    /// sum-to-one invariant regardless of what deserialization produced.
    pub fn normalized(mut self) -> Self {
        self.weights = WeightSplit::new(self.weights.embedding, self.weights.bm25);
        self
    }

    /// Layer a `retrieval` file source and `RETRIEVAL_*` environment
    /// overrides over the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::with_name("retrieval").required(false))
            .add_source(Environment::with_prefix("RETRIEVAL").separator("__"))
            .build()?;

        config.try_deserialize().map(Self::normalized)
    }
}

/// Per-request overrides accepted by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOptions {
    pub top_k: Option<usize>,
    pub include_diagnostics: bool,
    pub force_document_type: Option<DocumentType>,
    pub disable_reranker: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds_form_a_ladder() {
        let config = RagConfig::default();
        assert!(config.fallback_threshold <= config.relevance_threshold);
        assert!(config.relevance_threshold <= config.answer_threshold);
    }

    #[test]
    fn load_without_sources_yields_defaults() {
        let loaded = RagConfig::load().expect("config load failed");
        let defaults = RagConfig::default();
        assert_eq!(loaded.max_chunks, defaults.max_chunks);
        assert!((loaded.relevance_threshold - defaults.relevance_threshold).abs() < 1e-6);
        assert!((loaded.weights.embedding + loaded.weights.bm25 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalized_restores_weight_invariant() {
        let config = RagConfig {
            weights: WeightSplit {
                embedding: 3.0,
                bm25: 1.0,
            },
            ..RagConfig::default()
        }
        .normalized();
        assert!((config.weights.embedding + config.weights.bm25 - 1.0).abs() < 1e-6);
        assert!((config.weights.embedding - 0.75).abs() < 1e-6);
    }
}
