use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use common::{
    error::RetrievalError,
    storage::ChunkStore,
    types::{DocumentType, RetrieverChunk},
};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::scoring::{boost_codes, ScoredChunk};

/// Relevance factor for neighbors inside the same section.
const NEIGHBOR_RELEVANCE_FACTOR: f32 = 0.75;
/// Relevance factor for cross-section "bridge" neighbors.
const BRIDGE_RELEVANCE_FACTOR: f32 = 0.6;
/// How many chunks before/after the source are considered.
const NEIGHBOR_SPAN: usize = 2;
/// Cached sections kept before FIFO eviction kicks in.
const SECTION_CACHE_CAP: usize = 256;

type SectionKey = (String, String);
type SectionSlot = Arc<OnceCell<Arc<Vec<RetrieverChunk>>>>;

/// Process-wide cache of section lookups with single-flight semantics:
/// concurrent requests for the same `(document, section)` key share one
/// in-flight fetch instead of issuing duplicate loads.
#[derive(Default)]
pub struct SectionCache {
    inner: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<SectionKey, SectionSlot>,
    order: VecDeque<SectionKey>,
}

impl SectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_fetch(
        &self,
        store: &dyn ChunkStore,
        document_id: &str,
        section_path: &str,
    ) -> Result<Arc<Vec<RetrieverChunk>>, RetrievalError> {
        let key = (document_id.to_owned(), section_path.to_owned());
        let slot = {
            let mut state = self.inner.lock().await;
            if let Some(existing) = state.slots.get(&key) {
                Arc::clone(existing)
            } else {
                let slot: SectionSlot = Arc::new(OnceCell::new());
                state.slots.insert(key.clone(), Arc::clone(&slot));
                state.order.push_back(key.clone());
                while state.order.len() > SECTION_CACHE_CAP {
                    if let Some(evicted) = state.order.pop_front() {
                        state.slots.remove(&evicted);
                    }
                }
                slot
            }
        };

        slot.get_or_try_init(|| async {
            debug!(document_id, section_path, "Fetching section chunks");
            store
                .section_chunks(document_id, section_path)
                .await
                .map(Arc::new)
        })
        .await
        .map(Arc::clone)
    }
}

fn variant_compatible(source: &RetrieverChunk, neighbor: &RetrieverChunk) -> bool {
    match (source.variant_key(), neighbor.variant_key()) {
        (Some(a), Some(b)) => a == b,
        // No conflicting variant key on either side.
        _ => true,
    }
}

fn neighbor_scored(source: &ScoredChunk, neighbor: RetrieverChunk, bridge: bool) -> ScoredChunk {
    let factor = if bridge {
        BRIDGE_RELEVANCE_FACTOR
    } else {
        NEIGHBOR_RELEVANCE_FACTOR
    };
    let relevance = source.relevance * factor;
    let code = if bridge {
        boost_codes::NEIGHBOR_BRIDGE
    } else {
        boost_codes::NEIGHBOR_CHUNK
    };
    ScoredChunk {
        chunk: neighbor,
        bm25_score: 0.0,
        embedding_score: 0.0,
        boost_total: 0.0,
        hybrid_score: relevance,
        relevance,
        boosts_applied: vec![code.to_owned()],
    }
}

/// Stitch adjacent catalog chunks onto the selected set so tabular product
/// data is not truncated mid-variant. Lookup failures skip expansion for the
/// affected chunk only.
pub async fn expand_neighbors(
    selected: Vec<ScoredChunk>,
    store: &dyn ChunkStore,
    cache: &SectionCache,
) -> Vec<ScoredChunk> {
    let mut seen: HashSet<(String, usize)> = selected
        .iter()
        .map(|scored| (scored.chunk.document_id.clone(), scored.chunk.chunk_index))
        .collect();

    let mut expanded = Vec::with_capacity(selected.len());

    for source in selected {
        let mut additions: Vec<ScoredChunk> = Vec::new();

        if source.chunk.document_type == DocumentType::Catalog {
            match source.chunk.section_path.as_deref() {
                Some(section) => {
                    match cache
                        .get_or_fetch(store, &source.chunk.document_id, section)
                        .await
                    {
                        Ok(section_chunks) => {
                            additions =
                                section_neighbors(&source, &section_chunks, &seen);
                        }
                        Err(err) => {
                            warn!(
                                chunk_id = %source.chunk.id,
                                error = %err,
                                "Section lookup failed; skipping neighbor expansion for chunk"
                            );
                        }
                    }
                }
                None => {
                    match store
                        .adjacent_chunks(&source.chunk.document_id, source.chunk.chunk_index, 1)
                        .await
                    {
                        Ok(adjacent) => {
                            additions = adjacency_neighbors(&source, adjacent, &seen);
                        }
                        Err(err) => {
                            warn!(
                                chunk_id = %source.chunk.id,
                                error = %err,
                                "Adjacency lookup failed; skipping neighbor expansion for chunk"
                            );
                        }
                    }
                }
            }
        }

        expanded.push(source);
        for addition in additions {
            let key = (
                addition.chunk.document_id.clone(),
                addition.chunk.chunk_index,
            );
            if seen.insert(key) {
                expanded.push(addition);
            }
        }
    }

    expanded
}

fn section_neighbors(
    source: &ScoredChunk,
    section_chunks: &[RetrieverChunk],
    seen: &HashSet<(String, usize)>,
) -> Vec<ScoredChunk> {
    let Some(position) = section_chunks
        .iter()
        .position(|chunk| chunk.chunk_index == source.chunk.chunk_index)
    else {
        return Vec::new();
    };

    let low = position.saturating_sub(NEIGHBOR_SPAN);
    let high = (position + NEIGHBOR_SPAN).min(section_chunks.len().saturating_sub(1));

    section_chunks
        .get(low..=high)
        .unwrap_or_default()
        .iter()
        .filter(|chunk| chunk.chunk_index != source.chunk.chunk_index)
        .filter(|chunk| !seen.contains(&(chunk.document_id.clone(), chunk.chunk_index)))
        .filter(|chunk| variant_compatible(&source.chunk, chunk))
        .map(|chunk| neighbor_scored(source, chunk.clone(), false))
        .collect()
}

fn adjacency_neighbors(
    source: &ScoredChunk,
    adjacent: Vec<RetrieverChunk>,
    seen: &HashSet<(String, usize)>,
) -> Vec<ScoredChunk> {
    adjacent
        .into_iter()
        .filter(|chunk| !seen.contains(&(chunk.document_id.clone(), chunk.chunk_index)))
        .filter(|chunk| variant_compatible(&source.chunk, chunk))
        .map(|chunk| {
            let bridge = chunk.section_path != source.chunk.section_path;
            neighbor_scored(source, chunk, bridge)
        })
        .collect()
}
