use common::types::{DocumentType, TableRow};
use serde::Serialize;
use tracing::debug;

use crate::scoring::ScoredChunk;

/// Rough chars-per-token ratio used for budget estimation.
const CHARS_PER_TOKEN: usize = 4;
/// Flat token cost of one source header line.
const HEADER_OVERHEAD_TOKENS: usize = 12;

/// Rendering-ready projection of one selected chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSourceEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub filename: String,
    pub document_type: DocumentType,
    pub section_path: Option<String>,
    pub title: Option<String>,
    pub page_number: Option<u32>,
    pub chunk_index: usize,
    pub snippet: String,
    pub relevance: f32,
    pub boosts_applied: Vec<String>,
    pub table_rows: Vec<TableRow>,
}

#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub text: String,
    pub sources: Vec<ContextSourceEntry>,
    pub token_estimate: usize,
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

fn header_line(entry_number: usize, chunk: &ScoredChunk) -> String {
    let mut header = format!("[Источник {entry_number}: {}", chunk.chunk.filename);
    if let Some(section) = chunk.chunk.section_path.as_deref() {
        header.push_str(&format!(", раздел {section}"));
    }
    if let Some(page) = chunk.chunk.page_number {
        header.push_str(&format!(", стр. {page}"));
    }
    header.push(']');
    header
}

/// Truncate to at most `max_chars` characters, on a char boundary.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    text.chars().take(max_chars).collect()
}

/// Render the final ordered chunk list into a token-bounded context string.
/// Stops at `max_chunks` sources or budget exhaustion; an item whose header
/// alone does not fit ends assembly.
pub fn build_context(
    chunks: &[ScoredChunk],
    max_chunks: usize,
    max_tokens: usize,
    max_tokens_per_chunk: usize,
) -> AssembledContext {
    let mut text = String::new();
    let mut sources = Vec::new();
    let mut tokens_used = 0usize;

    for chunk in chunks {
        if sources.len() >= max_chunks {
            break;
        }

        let remaining = max_tokens.saturating_sub(tokens_used);
        if remaining <= HEADER_OVERHEAD_TOKENS {
            debug!(
                tokens_used,
                skipped = chunks.len() - sources.len(),
                "Token budget exhausted during context assembly"
            );
            break;
        }

        let content_budget = max_tokens_per_chunk.min(remaining - HEADER_OVERHEAD_TOKENS);
        let snippet = truncate_chars(
            chunk.chunk.content.trim(),
            content_budget * CHARS_PER_TOKEN,
        );
        if snippet.is_empty() {
            continue;
        }

        let cost = HEADER_OVERHEAD_TOKENS + estimate_tokens(&snippet);
        tokens_used += cost;

        let entry_number = sources.len() + 1;
        text.push_str(&header_line(entry_number, chunk));
        text.push('\n');
        text.push_str(&snippet);
        text.push_str("\n\n");

        sources.push(ContextSourceEntry {
            chunk_id: chunk.chunk.id.clone(),
            document_id: chunk.chunk.document_id.clone(),
            filename: chunk.chunk.filename.clone(),
            document_type: chunk.chunk.document_type,
            section_path: chunk.chunk.section_path.clone(),
            title: chunk
                .chunk
                .metadata
                .section_title
                .clone()
                .or_else(|| chunk.chunk.metadata.heading.clone()),
            page_number: chunk.chunk.page_number,
            chunk_index: chunk.chunk.chunk_index,
            snippet,
            relevance: chunk.relevance,
            boosts_applied: chunk.boosts_applied.clone(),
            table_rows: chunk.chunk.metadata.table_rows.clone(),
        });
    }

    AssembledContext {
        text,
        sources,
        token_estimate: tokens_used,
    }
}
