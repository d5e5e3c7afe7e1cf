use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::available_parallelism,
    time::Duration,
};

use async_trait::async_trait;
use common::{error::RetrievalError, utils::config::AppConfig};
use fastembed::{RerankInitOptions, TextRerank};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

static NEXT_ENGINE: AtomicUsize = AtomicUsize::new(0);

fn pick_engine_index(pool_len: usize) -> usize {
    let n = NEXT_ENGINE.fetch_add(1, Ordering::Relaxed);
    n % pool_len
}

/// A reranked document reference: position in the input slice plus the
/// model-assigned score.
#[derive(Debug, Clone)]
pub struct RerankEntry {
    pub index: usize,
    pub score: f32,
}

/// Cross-encoder reranking backend. Implementations score `documents`
/// against `query`; the caller decides what to do with failures.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<RerankEntry>, RetrievalError>;

    fn model_id(&self) -> String;
}

pub struct RerankerPool {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
}

impl RerankerPool {
    /// Build the pool at startup.
    /// `pool_size` controls max parallel reranks.
    pub fn new(pool_size: usize) -> Result<Arc<Self>, RetrievalError> {
        Self::new_with_options(pool_size, RerankInitOptions::default())
    }

    fn new_with_options(
        pool_size: usize,
        init_options: RerankInitOptions,
    ) -> Result<Arc<Self>, RetrievalError> {
        if pool_size == 0 {
            return Err(RetrievalError::Validation(
                "RERANKING_POOL_SIZE must be greater than zero".to_string(),
            ));
        }

        fs::create_dir_all(&init_options.cache_dir)?;

        let mut engines = Vec::with_capacity(pool_size);
        for x in 0..pool_size {
            debug!("Creating reranking engine: {x}");
            let model = TextRerank::try_new(init_options.clone())
                .map_err(|e| RetrievalError::Rerank(e.to_string()))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
        }))
    }

    /// Initialize a pool using application configuration.
    pub fn maybe_from_config(config: &AppConfig) -> Result<Option<Arc<Self>>, RetrievalError> {
        if !config.reranking_enabled {
            return Ok(None);
        }

        let pool_size = config.reranking_pool_size.unwrap_or_else(default_pool_size);

        let init_options = build_rerank_init_options(config)?;
        Self::new_with_options(pool_size, init_options).map(Some)
    }

    /// Check out capacity + pick an engine.
    /// This returns a lease that can perform rerank().
    pub async fn checkout(&self) -> Result<RerankerLease, RetrievalError> {
        // Acquire a permit. This enforces backpressure.
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RetrievalError::Rerank("reranker pool closed".to_string()))?;

        // Pick an engine.
        // This is naive: just pick based on a simple modulo counter.
        // We use an atomic counter to avoid always choosing index 0.
        let idx = pick_engine_index(self.engines.len());
        let engine = self.engines[idx].clone();

        Ok(RerankerLease {
            _permit: permit,
            engine,
        })
    }
}

#[async_trait]
impl Reranker for RerankerPool {
    async fn rerank(
        &self,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<RerankEntry>, RetrievalError> {
        let lease = self.checkout().await?;
        lease.rerank_documents(query, documents).await
    }

    fn model_id(&self) -> String {
        "bge-reranker-base".to_string()
    }
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn build_rerank_init_options(config: &AppConfig) -> Result<RerankInitOptions, RetrievalError> {
    let mut options = RerankInitOptions::default();

    let cache_dir = env::var("RERANKING_CACHE_DIR")
        .ok()
        .map(PathBuf::from)
        .or_else(|| env::var("FASTEMBED_CACHE_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| {
            Path::new(&config.data_dir)
                .join("fastembed")
                .join("reranker")
        });
    fs::create_dir_all(&cache_dir)?;
    options.cache_dir = cache_dir;

    let show_progress = env_bool("RERANKING_SHOW_DOWNLOAD_PROGRESS")
        .or_else(|| env_bool("FASTEMBED_SHOW_DOWNLOAD_PROGRESS"))
        .unwrap_or(true);
    options.show_download_progress = show_progress;

    if let Some(max_length) = env::var("RERANKING_MAX_LENGTH")
        .ok()
        .and_then(|value| value.parse().ok())
    {
        options.max_length = max_length;
    }

    Ok(options)
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().map(|value| is_truthy(&value))
}

/// Active lease on a single TextRerank instance.
pub struct RerankerLease {
    // When this drops the semaphore permit is released.
    _permit: OwnedSemaphorePermit,
    engine: Arc<Mutex<TextRerank>>,
}

impl RerankerLease {
    pub async fn rerank_documents(
        &self,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<RerankEntry>, RetrievalError> {
        // Lock this specific engine so we get &mut TextRerank
        let mut guard = self.engine.lock().await;

        let results = guard
            .rerank(query.to_owned(), documents, false, None)
            .map_err(|e| RetrievalError::Rerank(e.to_string()))?;

        Ok(results
            .into_iter()
            .map(|r| RerankEntry {
                index: r.index,
                score: r.score,
            })
            .collect())
    }
}

/// Result of a fail-open rerank attempt. `order` always holds a valid
/// permutation of the input indices; `applied` records whether the model's
/// ordering was actually used.
#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub order: Vec<usize>,
    pub applied: bool,
    pub model: Option<String>,
}

impl RerankOutcome {
    fn identity(len: usize) -> Self {
        Self {
            order: (0..len).collect(),
            applied: false,
            model: None,
        }
    }
}

/// Rerank with a hard deadline; any failure degrades to the incoming order
/// instead of failing the request.
pub async fn rerank_fail_open(
    reranker: Option<&dyn Reranker>,
    query: &str,
    documents: &[String],
    timeout: Duration,
) -> RerankOutcome {
    let Some(reranker) = reranker else {
        return RerankOutcome::identity(documents.len());
    };
    if documents.is_empty() {
        return RerankOutcome::identity(0);
    }

    let attempt = tokio::time::timeout(timeout, reranker.rerank(query, documents.to_vec())).await;

    let entries = match attempt {
        Ok(Ok(entries)) => entries,
        Ok(Err(err)) => {
            warn!(error = %err, "Reranker failed; keeping hybrid order");
            return RerankOutcome::identity(documents.len());
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Reranker timed out; keeping hybrid order");
            return RerankOutcome::identity(documents.len());
        }
    };

    match validate_order(&entries, documents.len()) {
        Some(order) => RerankOutcome {
            order,
            applied: true,
            model: Some(reranker.model_id()),
        },
        None => {
            warn!("Reranker returned a malformed ordering; keeping hybrid order");
            RerankOutcome::identity(documents.len())
        }
    }
}

/// Accept only a complete permutation of `0..len`; anything else is treated
/// as a model failure.
fn validate_order(entries: &[RerankEntry], len: usize) -> Option<Vec<usize>> {
    if entries.len() != len {
        return None;
    }
    let mut seen = vec![false; len];
    for entry in entries {
        if entry.index >= len || seen[entry.index] {
            return None;
        }
        seen[entry.index] = true;
    }

    let mut sorted: Vec<&RerankEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.index.cmp(&b.index))
    });
    Some(sorted.into_iter().map(|entry| entry.index).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubReranker {
        entries: Result<Vec<RerankEntry>, String>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Reranker for StubReranker {
        async fn rerank(
            &self,
            _query: &str,
            _documents: Vec<String>,
        ) -> Result<Vec<RerankEntry>, RetrievalError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.entries
                .clone()
                .map_err(RetrievalError::Rerank)
        }

        fn model_id(&self) -> String {
            "stub-cross-encoder".to_string()
        }
    }

    fn docs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("документ {i}")).collect()
    }

    #[tokio::test]
    async fn missing_reranker_keeps_input_order() {
        let outcome = rerank_fail_open(None, "труба", &docs(3), Duration::from_millis(50)).await;
        assert_eq!(outcome.order, vec![0, 1, 2]);
        assert!(!outcome.applied);
        assert!(outcome.model.is_none());
    }

    #[tokio::test]
    async fn successful_rerank_orders_by_score() {
        let stub = StubReranker {
            entries: Ok(vec![
                RerankEntry { index: 0, score: 0.1 },
                RerankEntry { index: 1, score: 0.9 },
                RerankEntry { index: 2, score: 0.5 },
            ]),
            delay: None,
        };
        let outcome =
            rerank_fail_open(Some(&stub), "труба", &docs(3), Duration::from_millis(100)).await;
        assert_eq!(outcome.order, vec![1, 2, 0]);
        assert!(outcome.applied);
        assert_eq!(outcome.model.as_deref(), Some("stub-cross-encoder"));
    }

    #[tokio::test]
    async fn errors_degrade_to_identity() {
        let stub = StubReranker {
            entries: Err("onnx session crashed".to_string()),
            delay: None,
        };
        let outcome =
            rerank_fail_open(Some(&stub), "труба", &docs(4), Duration::from_millis(100)).await;
        assert_eq!(outcome.order, vec![0, 1, 2, 3]);
        assert!(!outcome.applied);
    }

    #[tokio::test]
    async fn timeout_degrades_to_identity() {
        let stub = StubReranker {
            entries: Ok(vec![RerankEntry { index: 0, score: 1.0 }]),
            delay: Some(Duration::from_millis(200)),
        };
        let outcome =
            rerank_fail_open(Some(&stub), "труба", &docs(1), Duration::from_millis(10)).await;
        assert_eq!(outcome.order, vec![0]);
        assert!(!outcome.applied);
    }

    #[tokio::test]
    async fn out_of_range_indices_are_rejected() {
        let stub = StubReranker {
            entries: Ok(vec![
                RerankEntry { index: 0, score: 0.2 },
                RerankEntry { index: 7, score: 0.9 },
            ]),
            delay: None,
        };
        let outcome =
            rerank_fail_open(Some(&stub), "труба", &docs(2), Duration::from_millis(100)).await;
        assert_eq!(outcome.order, vec![0, 1]);
        assert!(!outcome.applied);
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        assert!(matches!(
            RerankerPool::new(0),
            Err(RetrievalError::Validation(_))
        ));
    }

    #[test]
    fn disabled_config_builds_no_pool() {
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
        let pool = RerankerPool::maybe_from_config(&config).expect("config path failed");
        assert!(pool.is_none());
    }

    #[test]
    fn truthy_env_values_are_recognized() {
        for value in ["1", "true", "YES", " on "] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["0", "false", "off", ""] {
            assert!(!is_truthy(value), "{value}");
        }
    }
}
