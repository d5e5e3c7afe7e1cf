use std::collections::HashMap;

use tracing::debug;

use crate::scoring::{sort_by_relevance_desc, ScoredChunk};

/// Share of the overall chunk budget reserved for the best document.
const PRIMARY_BUDGET_SHARE: f32 = 0.8;
/// Documents whose mean relevance is within this distance of the top
/// document's mean still contribute chunks.
const CLOSE_COMPETITOR_WINDOW: f32 = 0.15;

/// Allocate the chunk budget across documents: depth on the single
/// best-matching document first, then close competitors, under an overall
/// `max_chunks` ceiling.
pub fn cap_by_document(
    chunks: Vec<ScoredChunk>,
    max_chunks: usize,
    max_chunks_per_doc: usize,
) -> Vec<ScoredChunk> {
    if chunks.is_empty() || max_chunks == 0 {
        return Vec::new();
    }

    let mut by_document: HashMap<String, Vec<ScoredChunk>> = HashMap::new();
    for chunk in chunks {
        by_document
            .entry(chunk.chunk.document_id.clone())
            .or_default()
            .push(chunk);
    }

    let mut document_order: Vec<(String, f32)> = by_document
        .iter()
        .map(|(doc_id, doc_chunks)| {
            let mean = doc_chunks.iter().map(|c| c.relevance).sum::<f32>()
                / doc_chunks.len() as f32;
            (doc_id.clone(), mean)
        })
        .collect();
    document_order.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    let top_mean = document_order.first().map(|(_, mean)| *mean).unwrap_or(0.0);
    let primary_budget =
        max_chunks_per_doc.min(((max_chunks as f32) * PRIMARY_BUDGET_SHARE).round() as usize).max(1);
    let secondary_budget = max_chunks_per_doc.min(max_chunks.saturating_sub(primary_budget));

    let mut capped = Vec::new();
    for (position, (doc_id, mean)) in document_order.iter().enumerate() {
        if capped.len() >= max_chunks {
            break;
        }

        let budget = if position == 0 {
            primary_budget
        } else if top_mean - mean <= CLOSE_COMPETITOR_WINDOW {
            secondary_budget
        } else {
            0
        };
        if budget == 0 {
            continue;
        }

        let Some(mut doc_chunks) = by_document.remove(doc_id) else {
            continue;
        };
        sort_by_relevance_desc(&mut doc_chunks);

        let take = budget.min(max_chunks - capped.len());
        debug!(document_id = %doc_id, mean_relevance = mean, take, "Capping document contribution");
        capped.extend(doc_chunks.into_iter().take(take));
    }

    sort_by_relevance_desc(&mut capped);
    capped
}
