mod config;
mod diagnostics;
mod stages;
mod state;

pub use config::{RagConfig, RetrievalOptions};
pub use diagnostics::{CandidateSnapshot, PipelineStageTimings, RetrievalDiagnostics};
pub use stages::PipelineContext;

use std::time::Instant;

use common::{error::RetrievalError, storage::ChunkStore, utils::embedding::EmbeddingProvider};
use serde::Serialize;
use tracing::info;

use crate::{
    answer::{build_raw_answer, create_user_message, AnswerGenerator, DEFAULT_SYSTEM_PROMPT},
    context::ContextSourceEntry,
    neighbors::SectionCache,
    reranking::Reranker,
};

/// How the query was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RetrievalOutcome {
    /// Model-generated answer over the assembled context.
    Answer,
    /// Direct answer from source text/tables, no model call.
    RawAnswer,
    /// Not answerable; the caller should ask the user to refine the query.
    Clarify,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub chunk_id: String,
    pub document_id: String,
    pub filename: String,
    pub chunk_index: usize,
    pub relevance: f32,
    pub page_number: Option<u32>,
    pub section_path: Option<String>,
}

impl From<&ContextSourceEntry> for SourceRef {
    fn from(entry: &ContextSourceEntry) -> Self {
        Self {
            chunk_id: entry.chunk_id.clone(),
            document_id: entry.document_id.clone(),
            filename: entry.filename.clone(),
            chunk_index: entry.chunk_index,
            relevance: entry.relevance,
            page_number: entry.page_number,
            section_path: entry.section_path.clone(),
        }
    }
}

#[derive(Debug)]
pub struct RetrievalResponse {
    pub outcome: RetrievalOutcome,
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub response_time_ms: u128,
    pub token_estimate: usize,
    pub diagnostics: Option<RetrievalDiagnostics>,
    pub stage_timings: PipelineStageTimings,
    pub context: Option<String>,
}

/// Everything the pipeline needs besides the query itself. Collaborators are
/// borrowed; the pipeline owns no service state.
pub struct RetrievalServices<'a> {
    pub store: &'a dyn ChunkStore,
    pub embedding_provider: Option<&'a EmbeddingProvider>,
    pub reranker: Option<&'a dyn Reranker>,
    pub section_cache: &'a SectionCache,
    pub answer_generator: &'a dyn AnswerGenerator,
}

/// Run the full retrieval pipeline for one query and resolve it to an
/// answer, a raw answer, or a clarification request.
pub async fn run_pipeline(
    services: &RetrievalServices<'_>,
    query: &str,
    config: RagConfig,
    options: RetrievalOptions,
) -> Result<RetrievalResponse, RetrievalError> {
    let started = Instant::now();

    let query_chars = query.chars().count();
    let preview: String = query.chars().take(120).collect();
    info!(
        query_chars,
        preview = %preview.replace('\n', " "),
        "Starting retrieval pipeline"
    );

    let include_diagnostics = options.include_diagnostics;
    let mut ctx = PipelineContext::new(
        services.store,
        services.embedding_provider,
        services.reranker,
        services.section_cache,
        query.to_owned(),
        config.normalized(),
        options,
    );
    if include_diagnostics {
        ctx.enable_diagnostics();
    }

    drive(&mut ctx).await?;

    let diagnostics = ctx.take_diagnostics();
    let stage_timings = ctx.take_stage_timings();

    if let Some(message) = ctx.clarify.take() {
        return Ok(RetrievalResponse {
            outcome: RetrievalOutcome::Clarify,
            answer: message,
            sources: Vec::new(),
            response_time_ms: started.elapsed().as_millis(),
            token_estimate: 0,
            diagnostics,
            stage_timings,
            context: None,
        });
    }

    let assembled = ctx.assembled.take().ok_or_else(|| {
        RetrievalError::InternalError("pipeline decided without an assembled context".to_string())
    })?;
    let sources: Vec<SourceRef> = assembled.sources.iter().map(SourceRef::from).collect();

    let (outcome, answer) = if ctx.raw_answer_eligible {
        info!(sources = sources.len(), "Answering directly from catalog sources");
        (RetrievalOutcome::RawAnswer, build_raw_answer(&assembled.sources))
    } else {
        let user_message = create_user_message(&assembled.text, query);
        let answer = services
            .answer_generator
            .generate(DEFAULT_SYSTEM_PROMPT, &user_message)
            .await?;
        (RetrievalOutcome::Answer, answer)
    };

    Ok(RetrievalResponse {
        outcome,
        answer,
        sources,
        response_time_ms: started.elapsed().as_millis(),
        token_estimate: assembled.token_estimate,
        diagnostics,
        stage_timings,
        context: if include_diagnostics {
            Some(assembled.text)
        } else {
            None
        },
    })
}

async fn drive(ctx: &mut PipelineContext<'_>) -> Result<(), RetrievalError> {
    let machine = state::init();
    let machine = stages::fetch_candidates(machine, ctx).await?;
    let machine = stages::score(machine, ctx)?;
    let machine = stages::check_thresholds(machine, ctx)?;
    let machine = stages::filter_types(machine, ctx)?;
    let _machine = stages::decide(machine, ctx).await?;
    Ok(())
}
