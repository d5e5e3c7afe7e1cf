use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, warn};

use crate::{error::RetrievalError, types::RetrieverChunk, utils::config::AppConfig};

/// Chunks processed per batch during offline embedding regeneration.
const REGEN_BATCH_SIZE: usize = 5;

#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAI {
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    },
    Hashed {
        dimension: usize,
    },
}

impl EmbeddingProvider {
    pub fn new_openai(
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    ) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            },
        }
    }

    /// OpenAI-backed provider wired from application configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        let client = Client::with_config(
            OpenAIConfig::new()
                .with_api_key(config.openai_api_key.clone())
                .with_api_base(config.openai_base_url.clone()),
        );
        Self::new_openai(
            Arc::new(client),
            config.embedding_model.clone(),
            config.embedding_dimensions,
        )
    }

    pub fn new_hashed(dimension: usize) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::Hashed {
                dimension: dimension.max(1),
            },
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed { .. } => "hashed",
            EmbeddingInner::OpenAI { .. } => "openai",
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => *dimension,
            EmbeddingInner::OpenAI { dimensions, .. } => *dimensions as usize,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => Ok(hashed_embedding(text, *dimension)),
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            } => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model.clone())
                    .input([text])
                    .dimensions(*dimensions)
                    .build()?;

                let response = client.embeddings().create(request).await?;

                response
                    .data
                    .into_iter()
                    .next()
                    .map(|item| item.embedding)
                    .ok_or_else(|| anyhow!("No embedding data received from OpenAI API"))
            }
        }
    }
}

/// Deterministic fallback vector derived from the text's byte content.
/// Scoring never fails on a missing or unreachable embedding, it only
/// degrades. The result is L2-normalized.
pub fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];
    if text.is_empty() {
        return vector;
    }

    for token in tokens(text) {
        let idx = bucket(&token, dim);
        vector[idx] += 1.0;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}

/// Outcome of one offline regeneration pass.
#[derive(Debug, Default)]
pub struct RegenerationReport {
    pub updated: usize,
    pub failed: Vec<String>,
}

/// Re-embeds chunks in fixed-size batches. One failing item is recorded and
/// skipped; it never aborts its batch siblings. Offline maintenance only,
/// not part of the query path.
pub async fn regenerate_embeddings(
    provider: &EmbeddingProvider,
    chunks: &mut [RetrieverChunk],
) -> Result<RegenerationReport, RetrievalError> {
    let mut report = RegenerationReport::default();
    let expected_dim = provider.dimension();

    for batch in chunks.chunks_mut(REGEN_BATCH_SIZE) {
        for chunk in batch.iter_mut() {
            let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
            let embedding =
                Retry::spawn(retry_strategy, || provider.embed(&chunk.content)).await;

            match embedding {
                Ok(vector) if vector.len() == expected_dim => {
                    chunk.embedding = Some(vector);
                    report.updated += 1;
                }
                Ok(vector) => {
                    warn!(
                        chunk_id = %chunk.id,
                        got = vector.len(),
                        expected = expected_dim,
                        "Regenerated embedding has wrong dimension; skipping chunk"
                    );
                    report.failed.push(chunk.id.clone());
                }
                Err(err) => {
                    warn!(chunk_id = %chunk.id, error = %err, "Embedding regeneration failed for chunk");
                    report.failed.push(chunk.id.clone());
                }
            }
        }
        debug!(
            backend = provider.backend_label(),
            updated = report.updated,
            failed = report.failed.len(),
            "Processed embedding batch"
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentType;

    #[test]
    fn hashed_embedding_is_deterministic_and_normalized() {
        let a = hashed_embedding("труба стабил 16x2", 64);
        let b = hashed_embedding("труба стабил 16x2", 64);
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashed_embedding_empty_text_is_zero() {
        let v = hashed_embedding("", 16);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn from_config_selects_openai_backend() {
        let config = AppConfig {
            openai_api_key: "sk-test".to_owned(),
            openai_base_url: "http://localhost:1234/v1".to_owned(),
            embedding_model: "text-embedding-3-small".to_owned(),
            embedding_dimensions: 256,
            query_model: "gpt-4o-mini".to_owned(),
            reranking_enabled: false,
            reranking_pool_size: None,
            data_dir: "./data".to_owned(),
        };
        let provider = EmbeddingProvider::from_config(&config);
        assert_eq!(provider.backend_label(), "openai");
        assert_eq!(provider.dimension(), 256);
    }

    #[tokio::test]
    async fn regeneration_updates_all_chunks_with_hashed_backend() {
        let provider = EmbeddingProvider::new_hashed(32);
        let mut chunks = vec![
            RetrieverChunk::new("doc1", 0, "первый фрагмент", DocumentType::General, "a.pdf"),
            RetrieverChunk::new("doc1", 1, "второй фрагмент", DocumentType::General, "a.pdf"),
        ];

        let report = regenerate_embeddings(&provider, &mut chunks)
            .await
            .expect("regeneration failed");

        assert_eq!(report.updated, 2);
        assert!(report.failed.is_empty());
        assert!(chunks.iter().all(|c| c.embedding.is_some()));
    }
}
