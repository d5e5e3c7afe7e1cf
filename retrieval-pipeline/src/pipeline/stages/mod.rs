use std::{collections::HashMap, time::Duration, time::Instant};

use common::{
    error::RetrievalError,
    storage::ChunkStore,
    types::{DocumentMeta, DocumentType},
    utils::{
        embedding::{hashed_embedding, EmbeddingProvider},
        text::{analyze_query, QueryAnalysis},
    },
};
use state_machines::core::GuardError;
use tracing::{debug, instrument, warn};

use crate::{
    capping::cap_by_document,
    context::{build_context, AssembledContext},
    mmr::apply_mmr,
    neighbors::{expand_neighbors, SectionCache},
    reranking::{rerank_fail_open, Reranker},
    scoring::{boost_codes, score_pool, ScoredChunk},
};

use super::{
    config::{RagConfig, RetrievalOptions},
    diagnostics::{CandidateSnapshot, PipelineStageTimings, RetrievalDiagnostics},
    state::{
        CandidatesFetched, Decided, Init, RetrievalMachine, Scored, ThresholdChecked, TypeFiltered,
    },
};

/// Dimensionality of the hashed fallback when no embedding provider is wired.
const FALLBACK_EMBED_DIM: usize = 384;
const SNAPSHOT_LIMIT: usize = 8;

pub struct PipelineContext<'a> {
    pub store: &'a dyn ChunkStore,
    pub embedding_provider: Option<&'a EmbeddingProvider>,
    pub reranker: Option<&'a dyn Reranker>,
    pub section_cache: &'a SectionCache,
    pub input_text: String,
    pub config: RagConfig,
    pub options: RetrievalOptions,
    pub analysis: Option<QueryAnalysis>,
    pub query_embedding: Option<Vec<f32>>,
    pub pool: Vec<common::types::RetrieverChunk>,
    pub documents: HashMap<String, DocumentMeta>,
    pub scored: Vec<ScoredChunk>,
    pub selected: Vec<ScoredChunk>,
    pub assembled: Option<AssembledContext>,
    pub variant_filtered: bool,
    pub raw_answer_eligible: bool,
    pub clarify: Option<String>,
    pub diagnostics: Option<RetrievalDiagnostics>,
    stage_timings: PipelineStageTimings,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        store: &'a dyn ChunkStore,
        embedding_provider: Option<&'a EmbeddingProvider>,
        reranker: Option<&'a dyn Reranker>,
        section_cache: &'a SectionCache,
        input_text: String,
        config: RagConfig,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            store,
            embedding_provider,
            reranker,
            section_cache,
            input_text,
            config,
            options,
            analysis: None,
            query_embedding: None,
            pool: Vec::new(),
            documents: HashMap::new(),
            scored: Vec::new(),
            selected: Vec::new(),
            assembled: None,
            variant_filtered: false,
            raw_answer_eligible: false,
            clarify: None,
            diagnostics: None,
            stage_timings: PipelineStageTimings::default(),
        }
    }

    pub fn enable_diagnostics(&mut self) {
        if self.diagnostics.is_none() {
            self.diagnostics = Some(RetrievalDiagnostics::default());
        }
    }

    pub fn take_diagnostics(&mut self) -> Option<RetrievalDiagnostics> {
        self.diagnostics.take()
    }

    pub fn take_stage_timings(&mut self) -> PipelineStageTimings {
        std::mem::take(&mut self.stage_timings)
    }

    fn mark_degraded(&mut self, marker: &str) {
        if let Some(diag) = self.diagnostics.as_mut() {
            diag.degraded.push(marker.to_owned());
        }
    }

    fn ensure_analysis(&self) -> Result<&QueryAnalysis, RetrievalError> {
        self.analysis.as_ref().ok_or_else(|| {
            RetrievalError::InternalError("query analysis missing before scoring".to_string())
        })
    }

    fn ensure_embedding(&self) -> Result<&Vec<f32>, RetrievalError> {
        self.query_embedding.as_ref().ok_or_else(|| {
            RetrievalError::InternalError("query embedding missing before scoring".to_string())
        })
    }

    fn effective_max_chunks(&self) -> usize {
        match self.options.top_k {
            Some(top_k) if top_k > 0 => top_k.min(self.config.max_chunks),
            _ => self.config.max_chunks,
        }
    }
}

fn snapshot(chunks: &[ScoredChunk]) -> Vec<CandidateSnapshot> {
    chunks
        .iter()
        .take(SNAPSHOT_LIMIT)
        .map(|scored| CandidateSnapshot {
            chunk_id: scored.chunk.id.clone(),
            document_id: scored.chunk.document_id.clone(),
            relevance: scored.relevance,
        })
        .collect()
}

/// Analyze the query, embed it (hashed fallback on provider failure or
/// timeout), and load the bounded candidate pool. Store unavailability is
/// the one fatal error here.
#[instrument(level = "trace", skip_all)]
pub async fn fetch_candidates(
    machine: RetrievalMachine<(), Init>,
    ctx: &mut PipelineContext<'_>,
) -> Result<RetrievalMachine<(), CandidatesFetched>, RetrievalError> {
    let start = Instant::now();

    let analysis = analyze_query(&ctx.input_text, &ctx.config.extra_stopwords);
    debug!(
        tokens = analysis.tokens.len(),
        sku_candidates = analysis.sku_candidates.len(),
        installation_intent = analysis.installation_intent,
        catalog_intent = analysis.catalog_intent,
        "Query analyzed"
    );

    let embedding = match ctx.embedding_provider {
        Some(provider) => {
            let deadline = Duration::from_millis(ctx.config.embed_timeout_ms);
            match tokio::time::timeout(deadline, provider.embed(&analysis.normalized)).await {
                Ok(Ok(vector)) => vector,
                Ok(Err(err)) => {
                    warn!(error = %err, "Embedding provider failed; using hashed fallback");
                    ctx.mark_degraded("embedding_fallback");
                    hashed_embedding(&analysis.normalized, provider.dimension())
                }
                Err(_) => {
                    warn!(
                        timeout_ms = ctx.config.embed_timeout_ms,
                        "Embedding provider timed out; using hashed fallback"
                    );
                    ctx.mark_degraded("embedding_fallback");
                    hashed_embedding(&analysis.normalized, provider.dimension())
                }
            }
        }
        None => hashed_embedding(&analysis.normalized, FALLBACK_EMBED_DIM),
    };

    let pool = ctx.store.candidate_pool(ctx.config.max_initial_chunks).await?;
    let documents: HashMap<String, DocumentMeta> = ctx
        .store
        .document_meta()
        .await?
        .into_iter()
        .map(|meta| (meta.id.clone(), meta))
        .collect();

    debug!(pool = pool.len(), documents = documents.len(), "Candidate pool loaded");

    ctx.analysis = Some(analysis);
    ctx.query_embedding = Some(embedding);
    ctx.pool = pool;
    ctx.documents = documents;
    ctx.stage_timings.record_fetch_candidates(start.elapsed());

    machine
        .fetch_candidates()
        .map_err(|(_, guard)| map_guard_error("fetch_candidates", guard))
}

#[instrument(level = "trace", skip_all)]
pub fn score(
    machine: RetrievalMachine<(), CandidatesFetched>,
    ctx: &mut PipelineContext<'_>,
) -> Result<RetrievalMachine<(), Scored>, RetrievalError> {
    let start = Instant::now();

    let analysis = ctx.ensure_analysis()?.clone();
    let embedding = ctx.ensure_embedding()?.clone();
    let pool = std::mem::take(&mut ctx.pool);

    let scored = score_pool(
        pool,
        &analysis,
        &embedding,
        &ctx.documents,
        ctx.config.weights,
        &ctx.config.boosts,
    );

    ctx.variant_filtered = scored
        .first()
        .map(|top| top.has_boost(boost_codes::VARIANT_MATCH))
        .unwrap_or(false);

    if let Some(diag) = ctx.diagnostics.as_mut() {
        diag.top_before_mmr = snapshot(&scored);
    }

    debug!(
        scored = scored.len(),
        variant_filtered = ctx.variant_filtered,
        "Candidate pool scored"
    );
    ctx.scored = scored;
    ctx.stage_timings.record_score(start.elapsed());

    machine
        .score()
        .map_err(|(_, guard)| map_guard_error("score", guard))
}

/// Relevance-threshold ladder: keep candidates above `relevance_threshold`,
/// retry with `fallback_threshold`, otherwise resolve to Clarify without
/// touching the model.
#[instrument(level = "trace", skip_all)]
pub fn check_thresholds(
    machine: RetrievalMachine<(), Scored>,
    ctx: &mut PipelineContext<'_>,
) -> Result<RetrievalMachine<(), ThresholdChecked>, RetrievalError> {
    let above_relevance: Vec<ScoredChunk> = ctx
        .scored
        .iter()
        .filter(|candidate| candidate.relevance >= ctx.config.relevance_threshold)
        .cloned()
        .collect();

    if !above_relevance.is_empty() {
        ctx.scored = above_relevance;
    } else {
        let above_fallback: Vec<ScoredChunk> = ctx
            .scored
            .iter()
            .filter(|candidate| candidate.relevance >= ctx.config.fallback_threshold)
            .cloned()
            .collect();

        if above_fallback.is_empty() {
            debug!("No candidates above fallback threshold; resolving to clarification");
            ctx.scored.clear();
            ctx.clarify = Some(
                "Не удалось найти подходящую информацию в документах. Уточните, пожалуйста, запрос."
                    .to_owned(),
            );
        } else {
            debug!(
                kept = above_fallback.len(),
                "Relevance threshold empty; degrading to fallback threshold"
            );
            ctx.mark_degraded("fallback_threshold");
            ctx.scored = above_fallback;
        }
    }

    machine
        .check_thresholds()
        .map_err(|(_, guard)| map_guard_error("check_thresholds", guard))
}

/// Intent- or caller-forced document-type filter. Emptying the set resolves
/// to a type-specific clarification instead of an empty answer.
#[instrument(level = "trace", skip_all)]
pub fn filter_types(
    machine: RetrievalMachine<(), ThresholdChecked>,
    ctx: &mut PipelineContext<'_>,
) -> Result<RetrievalMachine<(), TypeFiltered>, RetrievalError> {
    if ctx.clarify.is_none() {
        let analysis = ctx.ensure_analysis()?;
        let wanted = ctx.options.force_document_type.or(
            match (analysis.installation_intent, analysis.catalog_intent) {
                (true, false) => Some(DocumentType::Instruction),
                (false, true) => Some(DocumentType::Catalog),
                _ => None,
            },
        );

        if let Some(doc_type) = wanted {
            let filtered: Vec<ScoredChunk> = ctx
                .scored
                .iter()
                .filter(|candidate| candidate.chunk.document_type == doc_type)
                .cloned()
                .collect();

            if filtered.is_empty() {
                debug!(%doc_type, "Type filter emptied the candidate set");
                ctx.scored.clear();
                ctx.clarify = Some(match doc_type {
                    DocumentType::Instruction => {
                        "По этому запросу нет подходящих инструкций по монтажу. Уточните, пожалуйста, запрос.".to_owned()
                    }
                    DocumentType::Catalog => {
                        "По этому запросу нет подходящих каталожных данных. Уточните, пожалуйста, запрос.".to_owned()
                    }
                    DocumentType::General => {
                        "По этому запросу нет подходящих документов. Уточните, пожалуйста, запрос.".to_owned()
                    }
                });
            } else {
                debug!(%doc_type, kept = filtered.len(), "Applied document-type filter");
                ctx.scored = filtered;
            }
        }
    }

    machine
        .filter_types()
        .map_err(|(_, guard)| map_guard_error("filter_types", guard))
}

/// Diversify, cap, expand neighbors, rerank (fail-open) and assemble the
/// context, then settle the final decision inputs.
#[instrument(level = "trace", skip_all)]
pub async fn decide(
    machine: RetrievalMachine<(), TypeFiltered>,
    ctx: &mut PipelineContext<'_>,
) -> Result<RetrievalMachine<(), Decided>, RetrievalError> {
    if ctx.clarify.is_none() {
        let max_chunks = ctx.effective_max_chunks();

        let start = Instant::now();
        let diversified = apply_mmr(
            std::mem::take(&mut ctx.scored),
            ctx.config.mmr_lambda,
            ctx.config.mmr_result_count,
        );
        ctx.stage_timings.record_mmr(start.elapsed());

        if let Some(diag) = ctx.diagnostics.as_mut() {
            diag.top_after_mmr = snapshot(&diversified);
        }

        let start = Instant::now();
        let capped = cap_by_document(diversified, max_chunks, ctx.config.max_chunks_per_doc);
        ctx.stage_timings.record_cap(start.elapsed());

        // Post-cap threshold check on the surviving top relevance.
        let top_relevance = capped.first().map(|c| c.relevance).unwrap_or(0.0);
        if top_relevance < ctx.config.answer_threshold {
            if top_relevance >= ctx.config.fallback_threshold {
                debug!(top_relevance, "Top relevance below answer threshold; degraded answer");
                ctx.mark_degraded("answer_fallback_threshold");
            } else {
                debug!(top_relevance, "Top relevance below fallback threshold after capping");
                ctx.clarify = Some(
                    "Найденные документы недостаточно релевантны. Уточните, пожалуйста, запрос."
                        .to_owned(),
                );
            }
        }

        if ctx.clarify.is_none() {
            let start = Instant::now();
            let expanded = expand_neighbors(capped, ctx.store, ctx.section_cache).await;
            ctx.stage_timings.record_expand(start.elapsed());

            let reranker = if ctx.config.reranker_enabled && !ctx.options.disable_reranker {
                ctx.reranker
            } else {
                None
            };

            let start = Instant::now();
            let documents: Vec<String> = expanded
                .iter()
                .map(|candidate| candidate.chunk.content.clone())
                .collect();
            let outcome = rerank_fail_open(
                reranker,
                &ctx.input_text,
                &documents,
                Duration::from_millis(ctx.config.rerank_timeout_ms),
            )
            .await;
            ctx.stage_timings.record_rerank(start.elapsed());

            if ctx.config.reranker_enabled && !ctx.options.disable_reranker && !outcome.applied {
                ctx.mark_degraded("reranker_fail_open");
            }
            if let Some(diag) = ctx.diagnostics.as_mut() {
                diag.reranker_applied = outcome.applied;
                diag.reranker_model = outcome.model.clone();
            }

            let mut slots: Vec<Option<ScoredChunk>> = expanded.into_iter().map(Some).collect();
            let ordered: Vec<ScoredChunk> = outcome
                .order
                .iter()
                .filter_map(|&index| slots.get_mut(index).and_then(Option::take))
                .collect();

            // Boost reasons cover the final selection, stitched neighbors
            // included, not just the pre-MMR leaderboard.
            if let Some(diag) = ctx.diagnostics.as_mut() {
                for candidate in &ordered {
                    diag.boosts_by_chunk
                        .insert(candidate.chunk.id.clone(), candidate.boosts_applied.clone());
                }
            }

            let start = Instant::now();
            let assembled = build_context(
                &ordered,
                max_chunks,
                ctx.config.max_tokens,
                ctx.config.max_tokens_per_chunk,
            );
            ctx.stage_timings.record_assemble(start.elapsed());

            if assembled.sources.is_empty() {
                ctx.clarify = Some(
                    "Не удалось собрать контекст из найденных документов. Уточните, пожалуйста, запрос."
                        .to_owned(),
                );
            } else {
                ctx.raw_answer_eligible = raw_answer_eligible(&assembled, ctx.variant_filtered);
                ctx.selected = ordered;
                ctx.assembled = Some(assembled);
            }
        }
    }

    machine
        .decide()
        .map_err(|(_, guard)| map_guard_error("decide", guard))
}

/// The spec-sheet shortcut: a tiny, single-section, catalog-only result set
/// produced by the variant hard filter is answered from source text directly.
fn raw_answer_eligible(assembled: &AssembledContext, variant_filtered: bool) -> bool {
    if !variant_filtered || assembled.sources.len() > 2 {
        return false;
    }
    if !assembled
        .sources
        .iter()
        .all(|source| source.document_type == DocumentType::Catalog)
    {
        return false;
    }
    let mut sections = assembled
        .sources
        .iter()
        .map(|source| source.section_path.as_deref());
    let first = match sections.next() {
        Some(section) => section,
        None => return false,
    };
    sections.all(|section| section == first)
}

fn map_guard_error(stage: &'static str, err: GuardError) -> RetrievalError {
    RetrievalError::InternalError(format!(
        "state machine guard '{stage}' failed: guard={}, event={}, kind={:?}",
        err.guard, err.event, err.kind
    ))
}
