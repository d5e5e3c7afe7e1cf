use crate::scoring::{cosine_similarity, ScoredChunk};

/// Greedy Maximal-Marginal-Relevance selection over the scored candidates.
///
/// Each round picks the remaining candidate maximizing
/// `lambda * relevance - (1 - lambda) * max_similarity_to_selected`, where
/// similarity is embedding cosine (zero when either vector is missing) and
/// the max is taken over the already-selected set. Ties keep input order.
/// O(n * k) over the pre-bounded candidate pool.
pub fn apply_mmr(candidates: Vec<ScoredChunk>, lambda: f32, result_count: usize) -> Vec<ScoredChunk> {
    if result_count == 0 || candidates.is_empty() {
        return Vec::new();
    }

    let lambda = lambda.clamp(0.0, 1.0);
    let mut remaining: Vec<ScoredChunk> = candidates;
    let mut selected: Vec<ScoredChunk> = Vec::with_capacity(result_count.min(remaining.len()));

    while selected.len() < result_count && !remaining.is_empty() {
        let mut best_index = 0usize;
        let mut best_score = f32::NEG_INFINITY;

        for (index, candidate) in remaining.iter().enumerate() {
            let max_sim = selected
                .iter()
                .map(|picked| embedding_similarity(candidate, picked))
                .fold(0.0f32, f32::max);
            let mmr = lambda * candidate.relevance - (1.0 - lambda) * max_sim;
            // Strict comparison keeps the earliest candidate on ties.
            if mmr > best_score {
                best_score = mmr;
                best_index = index;
            }
        }

        selected.push(remaining.remove(best_index));
    }

    selected
}

fn embedding_similarity(a: &ScoredChunk, b: &ScoredChunk) -> f32 {
    match (a.chunk.embedding.as_deref(), b.chunk.embedding.as_deref()) {
        (Some(va), Some(vb)) => cosine_similarity(va, vb),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{DocumentType, RetrieverChunk};

    fn scored(id: &str, relevance: f32, embedding: Option<Vec<f32>>) -> ScoredChunk {
        let mut chunk =
            RetrieverChunk::new("doc1", 0, format!("содержимое {id}"), DocumentType::General, "d.pdf");
        chunk.id = id.to_owned();
        chunk.embedding = embedding;
        ScoredChunk {
            chunk,
            bm25_score: 0.0,
            embedding_score: 0.0,
            boost_total: 0.0,
            hybrid_score: relevance,
            relevance,
            boosts_applied: Vec::new(),
        }
    }

    #[test]
    fn never_exceeds_result_count_or_candidates() {
        let candidates = vec![
            scored("a", 0.9, None),
            scored("b", 0.8, None),
            scored("c", 0.7, None),
        ];
        assert_eq!(apply_mmr(candidates.clone(), 0.7, 2).len(), 2);
        assert_eq!(apply_mmr(candidates, 0.7, 10).len(), 3);
        assert!(apply_mmr(Vec::new(), 0.7, 5).is_empty());
    }

    #[test]
    fn first_pick_is_top_relevance_regardless_of_lambda() {
        for lambda in [0.0f32, 0.3, 0.7, 1.0] {
            let candidates = vec![
                scored("low", 0.2, Some(vec![1.0, 0.0])),
                scored("top", 0.95, Some(vec![0.0, 1.0])),
                scored("mid", 0.5, Some(vec![0.5, 0.5])),
            ];
            let picked = apply_mmr(candidates, lambda, 2);
            assert_eq!(picked[0].chunk.id, "top", "lambda={lambda}");
        }
    }

    #[test]
    fn diversity_term_avoids_near_duplicates() {
        // Two near-identical vectors and one distinct; with a diversity-heavy
        // lambda the distinct chunk beats the duplicate for second place.
        let candidates = vec![
            scored("first", 0.9, Some(vec![1.0, 0.0])),
            scored("duplicate", 0.85, Some(vec![0.99, 0.05])),
            scored("different", 0.6, Some(vec![0.0, 1.0])),
        ];
        let picked = apply_mmr(candidates, 0.3, 2);
        assert_eq!(picked[0].chunk.id, "first");
        assert_eq!(picked[1].chunk.id, "different");
    }

    #[test]
    fn missing_embeddings_count_as_dissimilar() {
        let candidates = vec![
            scored("a", 0.9, None),
            scored("b", 0.8, None),
        ];
        let picked = apply_mmr(candidates, 0.5, 2);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].chunk.id, "a");
    }
}
