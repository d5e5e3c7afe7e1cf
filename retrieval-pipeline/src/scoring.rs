use std::{cmp::Ordering, collections::HashMap};

use common::{
    types::{DocumentMeta, DocumentType, RetrieverChunk},
    utils::{
        embedding::hashed_embedding,
        text::{normalize_text, QueryAnalysis},
    },
};
use serde::{Deserialize, Serialize};

// Classic BM25 parameters. Statistics are computed over the per-query
// candidate pool, not the corpus; IDF is query-dependent by design.
const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

/// Term-overlap bonus saturates at this many distinct matching terms.
const TERM_OVERLAP_CAP: u32 = 4;
/// SKU match-count scaling saturates at 2x the base magnitude.
const SKU_SCALE_CAP: f32 = 2.0;

/// Domain keywords that earn a bonus when they co-occur in the query and the
/// chunk's section context.
const DOMAIN_KEYWORDS: &[&str] = &[
    "труб", "фитинг", "коллектор", "радиатор", "котел", "насос", "теплоносител", "стяжк",
    "крепеж",
];

/// Reason codes attached to boost contributions. Preserved verbatim through
/// diversification, capping, and expansion.
pub mod boost_codes {
    pub const SECTION_MATCH: &str = "section_match";
    pub const TITLE_MATCH: &str = "title_match";
    pub const TAG_MATCH: &str = "tag_match";
    pub const SKU_MATCH: &str = "sku_match";
    pub const DOC_TYPE_ALIGNMENT: &str = "doc_type_alignment";
    pub const DOC_TYPE_PENALTY: &str = "doc_type_penalty";
    pub const TERM_OVERLAP: &str = "term_overlap";
    pub const VARIANT_MATCH: &str = "variant_match";
    pub const KEYWORD_SECTION: &str = "keyword_section";
    pub const NEIGHBOR_CHUNK: &str = "neighbor_chunk";
    pub const NEIGHBOR_BRIDGE: &str = "neighbor_bridge";
}

/// Weight split between the embedding and lexical signals. Always normalized
/// so the two sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeightSplit {
    pub embedding: f32,
    pub bm25: f32,
}

impl WeightSplit {
    pub fn new(embedding: f32, bm25: f32) -> Self {
        let sum = embedding.max(0.0) + bm25.max(0.0);
        if sum <= f32::EPSILON {
            return Self::default();
        }
        Self {
            embedding: embedding.max(0.0) / sum,
            bm25: bm25.max(0.0) / sum,
        }
    }
}

impl Default for WeightSplit {
    fn default() -> Self {
        // Embeddings carry most of the signal; BM25 anchors exact wording.
        Self {
            embedding: 0.65,
            bm25: 0.35,
        }
    }
}

/// Magnitudes for the named boost signals. All boosts are additive and
/// independent; evaluation order does not affect the total.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoostMagnitudes {
    pub section_match: f32,
    pub title_match: f32,
    pub tag_match: f32,
    pub sku_match: f32,
    pub doc_type_alignment: f32,
    pub term_overlap: f32,
    pub variant_match: f32,
    pub keyword_section: f32,
}

impl Default for BoostMagnitudes {
    fn default() -> Self {
        Self {
            section_match: 0.05,
            title_match: 0.05,
            tag_match: 0.03,
            sku_match: 0.12,
            doc_type_alignment: 0.08,
            term_overlap: 0.02,
            variant_match: 0.15,
            keyword_section: 0.04,
        }
    }
}

/// One named, explainable boost contribution.
#[derive(Debug, Clone, Serialize)]
pub struct BoostSignal {
    pub code: &'static str,
    pub amount: f32,
}

/// A candidate chunk annotated with every retrieval signal.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: RetrieverChunk,
    pub bm25_score: f32,
    pub embedding_score: f32,
    pub boost_total: f32,
    pub hybrid_score: f32,
    pub relevance: f32,
    pub boosts_applied: Vec<String>,
}

impl ScoredChunk {
    pub fn has_boost(&self, code: &str) -> bool {
        self.boosts_applied.iter().any(|c| c == code)
    }
}

/// Pool-scoped lexical statistics for BM25.
#[derive(Debug, Default)]
pub struct PoolStats {
    doc_count: usize,
    avg_len: f32,
    doc_freq: HashMap<String, u32>,
}

impl PoolStats {
    /// Document frequency is gathered only for the query's terms; everything
    /// else contributes zero anyway.
    pub fn from_pool(pool: &[RetrieverChunk], query_terms: &[String]) -> Self {
        let doc_count = pool.len();
        let total_len: u64 = pool.iter().map(|chunk| u64::from(chunk.term_total)).sum();
        let avg_len = if doc_count == 0 {
            1.0
        } else {
            (total_len as f32 / doc_count as f32).max(1.0)
        };

        let mut doc_freq = HashMap::new();
        for term in query_terms {
            let df = pool
                .iter()
                .filter(|chunk| chunk.term_frequency(term) > 0)
                .count() as u32;
            doc_freq.insert(term.clone(), df);
        }

        Self {
            doc_count,
            avg_len,
            doc_freq,
        }
    }
}

/// Classic BM25 over the candidate pool. Terms absent from the chunk
/// contribute exactly zero.
pub fn bm25_score(chunk: &RetrieverChunk, query_terms: &[String], stats: &PoolStats) -> f32 {
    if stats.doc_count == 0 || chunk.term_total == 0 {
        return 0.0;
    }

    let doc_len = chunk.term_total as f32;
    let mut score = 0.0;

    for term in query_terms {
        let tf = chunk.term_frequency(term) as f32;
        if tf == 0.0 {
            continue;
        }
        let df = stats.doc_freq.get(term).copied().unwrap_or(0) as f32;
        let n = stats.doc_count as f32;
        let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
        let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / stats.avg_len);
        score += idf * (tf * (BM25_K1 + 1.0)) / denom;
    }

    score
}

/// Cosine similarity, zero on dimension mismatch or zero-norm input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Embedding similarity for a chunk; chunks without a vector get the
/// deterministic hashed fallback so scoring degrades instead of failing.
pub fn embedding_score(chunk: &RetrieverChunk, query_embedding: &[f32]) -> f32 {
    match chunk.embedding.as_deref() {
        Some(vector) => cosine_similarity(query_embedding, vector),
        None => {
            let fallback = hashed_embedding(&chunk.content, query_embedding.len());
            cosine_similarity(query_embedding, &fallback)
        }
    }
}

fn contains_any_token(haystack: &str, tokens: &[String]) -> bool {
    tokens.iter().any(|token| haystack.contains(token.as_str()))
}

/// Compute every applicable boost for one chunk. Purely additive; the caller
/// sums `amount`s and records `code`s.
pub fn compute_boosts(
    chunk: &RetrieverChunk,
    analysis: &QueryAnalysis,
    doc_meta: Option<&DocumentMeta>,
    magnitudes: &BoostMagnitudes,
) -> Vec<BoostSignal> {
    let mut signals = Vec::new();

    // Section / title / tag lexical overlap.
    if let Some(section) = chunk.section_path.as_deref() {
        if contains_any_token(&normalize_text(section), &analysis.tokens) {
            signals.push(BoostSignal {
                code: boost_codes::SECTION_MATCH,
                amount: magnitudes.section_match,
            });
        }
    }

    let title_text = [
        chunk.metadata.heading.as_deref(),
        chunk.metadata.section_title.as_deref(),
        doc_meta.and_then(|meta| meta.title.as_deref()),
    ]
    .iter()
    .flatten()
    .map(|part| normalize_text(part))
    .collect::<Vec<_>>()
    .join(" ");
    if !title_text.is_empty() && contains_any_token(&title_text, &analysis.tokens) {
        signals.push(BoostSignal {
            code: boost_codes::TITLE_MATCH,
            amount: magnitudes.title_match,
        });
    }

    if chunk
        .metadata
        .tags
        .iter()
        .any(|tag| contains_any_token(&normalize_text(tag), &analysis.tokens))
    {
        signals.push(BoostSignal {
            code: boost_codes::TAG_MATCH,
            amount: magnitudes.tag_match,
        });
    }

    // SKU exact/partial matches, scaled by match count and capped at 2x.
    if !analysis.sku_candidates.is_empty() {
        let content = normalize_text(&chunk.content);
        let product = chunk
            .metadata
            .product_name
            .as_deref()
            .map(normalize_text)
            .unwrap_or_default();
        let mut matches = 0.0f32;
        for sku in &analysis.sku_candidates {
            if content.contains(sku.as_str()) || product.contains(sku.as_str()) {
                matches += 1.0;
            } else if let Some(meta) = doc_meta {
                if meta
                    .product_names
                    .iter()
                    .any(|name| normalize_text(name).contains(sku.as_str()))
                {
                    matches += 0.5;
                }
            }
        }
        if matches > 0.0 {
            signals.push(BoostSignal {
                code: boost_codes::SKU_MATCH,
                amount: magnitudes.sku_match * matches.min(SKU_SCALE_CAP),
            });
        }
    }

    // Document-type vs intent alignment, with a symmetric half-magnitude
    // penalty for the mismatched type.
    if analysis.installation_intent {
        match chunk.document_type {
            DocumentType::Instruction => signals.push(BoostSignal {
                code: boost_codes::DOC_TYPE_ALIGNMENT,
                amount: magnitudes.doc_type_alignment,
            }),
            DocumentType::Catalog => signals.push(BoostSignal {
                code: boost_codes::DOC_TYPE_PENALTY,
                amount: -magnitudes.doc_type_alignment * 0.5,
            }),
            DocumentType::General => {}
        }
    }
    if analysis.catalog_intent {
        match chunk.document_type {
            DocumentType::Catalog => signals.push(BoostSignal {
                code: boost_codes::DOC_TYPE_ALIGNMENT,
                amount: magnitudes.doc_type_alignment,
            }),
            DocumentType::Instruction => signals.push(BoostSignal {
                code: boost_codes::DOC_TYPE_PENALTY,
                amount: -magnitudes.doc_type_alignment * 0.5,
            }),
            DocumentType::General => {}
        }
    }

    // Capped term-overlap bonus.
    let overlap = analysis
        .tokens
        .iter()
        .filter(|token| chunk.term_frequency(token) > 0)
        .count() as u32;
    if overlap > 0 {
        signals.push(BoostSignal {
            code: boost_codes::TERM_OVERLAP,
            amount: magnitudes.term_overlap * overlap.min(TERM_OVERLAP_CAP) as f32,
        });
    }

    // Variant-name match against product-variant metadata.
    if let Some(variant) = chunk.metadata.variant_name.as_deref() {
        let variant_norm = normalize_text(variant);
        if !variant_norm.is_empty() && analysis.normalized.contains(&variant_norm) {
            signals.push(BoostSignal {
                code: boost_codes::VARIANT_MATCH,
                amount: magnitudes.variant_match,
            });
        }
    }

    // Domain keyword + section co-occurrence.
    let section_context = [
        chunk.section_path.as_deref(),
        chunk.metadata.section_title.as_deref(),
        chunk.metadata.heading.as_deref(),
    ]
    .iter()
    .flatten()
    .map(|part| normalize_text(part))
    .collect::<Vec<_>>()
    .join(" ");
    if DOMAIN_KEYWORDS
        .iter()
        .any(|kw| analysis.normalized.contains(kw) && section_context.contains(kw))
    {
        signals.push(BoostSignal {
            code: boost_codes::KEYWORD_SECTION,
            amount: magnitudes.keyword_section,
        });
    }

    signals
}

/// Score the whole candidate pool: BM25 + cosine + boosts merged into one
/// hybrid score, then the variant hard filter and a stable sort.
pub fn score_pool(
    pool: Vec<RetrieverChunk>,
    analysis: &QueryAnalysis,
    query_embedding: &[f32],
    documents: &HashMap<String, DocumentMeta>,
    weights: WeightSplit,
    magnitudes: &BoostMagnitudes,
) -> Vec<ScoredChunk> {
    let stats = PoolStats::from_pool(&pool, &analysis.tokens);

    let mut scored: Vec<ScoredChunk> = pool
        .into_iter()
        .map(|chunk| {
            let bm25 = bm25_score(&chunk, &analysis.tokens, &stats);
            let embed = embedding_score(&chunk, query_embedding);
            let signals = compute_boosts(
                &chunk,
                analysis,
                documents.get(&chunk.document_id),
                magnitudes,
            );
            let boost_total: f32 = signals.iter().map(|signal| signal.amount).sum();
            let hybrid = weights.embedding * embed + weights.bm25 * bm25 + boost_total;

            ScoredChunk {
                chunk,
                bm25_score: bm25,
                embedding_score: embed,
                boost_total,
                hybrid_score: hybrid,
                relevance: hybrid,
                boosts_applied: signals.iter().map(|signal| signal.code.to_owned()).collect(),
            }
        })
        .collect();

    // Once the query clearly names a product variant, ignore all other
    // variants: a hard filter layered on top of soft scoring.
    if scored
        .iter()
        .any(|candidate| candidate.has_boost(boost_codes::VARIANT_MATCH))
    {
        scored.retain(|candidate| candidate.has_boost(boost_codes::VARIANT_MATCH));
    }

    sort_by_relevance_desc(&mut scored);
    scored
}

/// Stable descending sort; ties keep input order.
pub fn sort_by_relevance_desc(chunks: &mut [ScoredChunk]) {
    chunks.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(Ordering::Equal)
    });
}
