use std::collections::HashMap;

use serde::Serialize;

/// Captures per-query instrumentation when diagnostics are requested.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalDiagnostics {
    pub top_before_mmr: Vec<CandidateSnapshot>,
    pub top_after_mmr: Vec<CandidateSnapshot>,
    pub boosts_by_chunk: HashMap<String, Vec<String>>,
    pub reranker_applied: bool,
    pub reranker_model: Option<String>,
    /// Reason markers for every degraded path taken during the query.
    pub degraded: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateSnapshot {
    pub chunk_id: String,
    pub document_id: String,
    pub relevance: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStageTimings {
    pub fetch_candidates_ms: u128,
    pub score_ms: u128,
    pub mmr_ms: u128,
    pub cap_ms: u128,
    pub expand_ms: u128,
    pub rerank_ms: u128,
    pub assemble_ms: u128,
}

impl PipelineStageTimings {
    pub fn record_fetch_candidates(&mut self, duration: std::time::Duration) {
        self.fetch_candidates_ms += duration.as_millis();
    }

    pub fn record_score(&mut self, duration: std::time::Duration) {
        self.score_ms += duration.as_millis();
    }

    pub fn record_mmr(&mut self, duration: std::time::Duration) {
        self.mmr_ms += duration.as_millis();
    }

    pub fn record_cap(&mut self, duration: std::time::Duration) {
        self.cap_ms += duration.as_millis();
    }

    pub fn record_expand(&mut self, duration: std::time::Duration) {
        self.expand_ms += duration.as_millis();
    }

    pub fn record_rerank(&mut self, duration: std::time::Duration) {
        self.rerank_ms += duration.as_millis();
    }

    pub fn record_assemble(&mut self, duration: std::time::Duration) {
        self.assemble_ms += duration.as_millis();
    }
}
