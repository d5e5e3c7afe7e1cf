pub mod answer;
pub mod capping;
pub mod context;
pub mod mmr;
pub mod neighbors;
pub mod pipeline;
pub mod reranking;
pub mod scoring;

use common::error::RetrievalError;
use tracing::instrument;

pub use answer::{AnswerGenerator, OpenAiAnswerGenerator};
pub use context::{AssembledContext, ContextSourceEntry};
pub use neighbors::SectionCache;
pub use pipeline::{
    PipelineStageTimings, RagConfig, RetrievalDiagnostics, RetrievalOptions, RetrievalOutcome,
    RetrievalResponse, RetrievalServices, SourceRef,
};
pub use reranking::{Reranker, RerankerPool};
pub use scoring::{BoostMagnitudes, ScoredChunk, WeightSplit};

/// Primary entry point: resolve one query against the indexed corpus.
#[instrument(skip_all)]
pub async fn retrieve(
    services: &RetrievalServices<'_>,
    query: &str,
    config: RagConfig,
    options: RetrievalOptions,
) -> Result<RetrievalResponse, RetrievalError> {
    pipeline::run_pipeline(services, query, config, options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::{
        storage::InMemoryChunkStore,
        types::{ChunkMetadata, DocumentMeta, DocumentType, RetrieverChunk},
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubAnswerGenerator {
        called: AtomicBool,
    }

    impl StubAnswerGenerator {
        fn new() -> Self {
            Self {
                called: AtomicBool::new(false),
            }
        }

        fn was_called(&self) -> bool {
            self.called.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnswerGenerator for StubAnswerGenerator {
        async fn generate(
            &self,
            _system_prompt: &str,
            user_message: &str,
        ) -> Result<String, RetrievalError> {
            self.called.store(true, Ordering::SeqCst);
            assert!(user_message.contains("Контекст"), "context must be embedded");
            Ok("ответ модели".to_owned())
        }
    }

    fn catalog_chunk(index: usize, content: &str, variant: Option<&str>) -> RetrieverChunk {
        let mut chunk =
            RetrieverChunk::new("doc1", index, content, DocumentType::Catalog, "catalog.pdf");
        if let Some(variant) = variant {
            chunk.metadata = ChunkMetadata {
                variant_name: Some(variant.to_owned()),
                ..ChunkMetadata::default()
            };
        }
        chunk
    }

    fn services<'a>(
        store: &'a InMemoryChunkStore,
        cache: &'a SectionCache,
        generator: &'a StubAnswerGenerator,
    ) -> RetrievalServices<'a> {
        RetrievalServices {
            store,
            embedding_provider: None,
            reranker: None,
            section_cache: cache,
            answer_generator: generator,
        }
    }

    #[tokio::test]
    async fn unrelated_query_resolves_to_clarify_without_model_call() {
        let mut store = InMemoryChunkStore::new();
        store.add_document(DocumentMeta::new("doc1", "catalog.pdf", DocumentType::Catalog));
        store.add_chunk(
            catalog_chunk(0, "труба стабил 16x2 рабочее давление 10 бар", None)
                .with_embedding(vec![0.0; 8]),
        );
        store.add_chunk(
            catalog_chunk(1, "коллектор латунный с расходомерами", None)
                .with_embedding(vec![0.0; 8]),
        );

        let cache = SectionCache::new();
        let generator = StubAnswerGenerator::new();
        let response = retrieve(
            &services(&store, &cache, &generator),
            "погода в Париже",
            RagConfig::default(),
            RetrievalOptions::default(),
        )
        .await
        .expect("retrieval failed");

        assert_eq!(response.outcome, RetrievalOutcome::Clarify);
        assert!(response.sources.is_empty());
        assert!(!response.answer.is_empty());
        assert!(!generator.was_called(), "clarification must not invoke the model");
    }

    #[tokio::test]
    async fn variant_query_narrows_to_the_matching_chunk() {
        let mut store = InMemoryChunkStore::new();
        store.add_document(DocumentMeta::new("doc1", "catalog.pdf", DocumentType::Catalog));
        store.add_chunk(catalog_chunk(
            1,
            "труба стабил 16x2 рабочее давление 10 бар",
            Some("Стабил 16x2"),
        ));
        // Lexically strong competitor without the variant, far enough away
        // that adjacency expansion cannot pull it back in.
        store.add_chunk(catalog_chunk(5, "труба труба труба универсальная", None));

        let cache = SectionCache::new();
        let generator = StubAnswerGenerator::new();
        let response = retrieve(
            &services(&store, &cache, &generator),
            "труба Стабил 16x2",
            RagConfig::default(),
            RetrievalOptions::default(),
        )
        .await
        .expect("retrieval failed");

        assert_eq!(response.sources.len(), 1);
        assert_eq!(response.sources[0].chunk_index, 1);
        // Small, single-section, catalog-only, variant-filtered result set
        // skips the model entirely.
        assert_eq!(response.outcome, RetrievalOutcome::RawAnswer);
        assert!(response.answer.contains("стабил"));
        assert!(!generator.was_called());
    }

    #[tokio::test]
    async fn catalog_selection_stitches_section_neighbors() {
        let mut store = InMemoryChunkStore::new();
        store.add_document(DocumentMeta::new("doc1", "catalog.pdf", DocumentType::Catalog));
        // Neighbors score below the fallback threshold on their own and only
        // enter via section expansion.
        store.add_chunk(
            catalog_chunk(4, "строка таблицы размеров", Some("Стабил 16x2"))
                .with_section("2.1")
                .with_embedding(vec![0.0; 8]),
        );
        store.add_chunk(
            catalog_chunk(
                5,
                "труба стабил 16x2 рабочее давление 10 бар",
                Some("Стабил 16x2"),
            )
            .with_section("2.1"),
        );
        store.add_chunk(
            catalog_chunk(6, "строка таблицы допусков", Some("Стабил 16x2"))
                .with_section("2.1")
                .with_embedding(vec![0.0; 8]),
        );

        let cache = SectionCache::new();
        let generator = StubAnswerGenerator::new();
        let response = retrieve(
            &services(&store, &cache, &generator),
            "труба Стабил 16x2",
            RagConfig::default(),
            RetrievalOptions {
                include_diagnostics: true,
                ..RetrievalOptions::default()
            },
        )
        .await
        .expect("retrieval failed");

        let by_index = |index: usize| {
            response
                .sources
                .iter()
                .find(|source| source.chunk_index == index)
        };
        let source = by_index(5).expect("source chunk missing");
        let before = by_index(4).expect("preceding neighbor missing");
        let after = by_index(6).expect("following neighbor missing");

        assert!((before.relevance - source.relevance * 0.75).abs() < 1e-5);
        assert!((after.relevance - source.relevance * 0.75).abs() < 1e-5);

        // Three sources exceed the raw-answer shortcut, so the model runs.
        assert_eq!(response.outcome, RetrievalOutcome::Answer);
        assert_eq!(response.answer, "ответ модели");
        assert!(generator.was_called());

        let diagnostics = response.diagnostics.expect("diagnostics requested");
        assert!(!diagnostics.top_before_mmr.is_empty());
        assert!(diagnostics
            .boosts_by_chunk
            .values()
            .any(|codes| codes.iter().any(|code| code == "variant_match")));
        // Every reported source has its boost reasons on record, stitched
        // neighbors included.
        for reported in &response.sources {
            let codes = diagnostics
                .boosts_by_chunk
                .get(&reported.chunk_id)
                .expect("boost codes missing for a reported source");
            if reported.chunk_index != 5 {
                assert!(codes.iter().any(|code| code == "neighbor_chunk"));
            }
        }
        assert!(response.context.is_some());
    }

    #[tokio::test]
    async fn top_k_bounds_the_source_count() {
        let mut store = InMemoryChunkStore::new();
        store.add_document(DocumentMeta::new("doc1", "manual.pdf", DocumentType::Instruction));
        for index in 0..6 {
            store.add_chunk(RetrieverChunk::new(
                "doc1",
                index,
                format!("монтаж трубы шаг {index} крепление фитинг труба"),
                DocumentType::Instruction,
                "manual.pdf",
            ));
        }

        let cache = SectionCache::new();
        let generator = StubAnswerGenerator::new();
        let response = retrieve(
            &services(&store, &cache, &generator),
            "монтаж трубы",
            RagConfig::default(),
            RetrievalOptions {
                top_k: Some(2),
                ..RetrievalOptions::default()
            },
        )
        .await
        .expect("retrieval failed");

        assert_eq!(response.outcome, RetrievalOutcome::Answer);
        assert!(response.sources.len() <= 2);
    }

    #[tokio::test]
    async fn unavailable_store_fails_loudly() {
        struct BrokenStore;

        #[async_trait]
        impl common::storage::ChunkStore for BrokenStore {
            async fn candidate_pool(
                &self,
                _limit: usize,
            ) -> Result<Vec<RetrieverChunk>, RetrievalError> {
                Err(RetrievalError::StoreUnavailable("connection refused".into()))
            }

            async fn document_meta(&self) -> Result<Vec<DocumentMeta>, RetrievalError> {
                Err(RetrievalError::StoreUnavailable("connection refused".into()))
            }

            async fn section_chunks(
                &self,
                _document_id: &str,
                _section_path: &str,
            ) -> Result<Vec<RetrieverChunk>, RetrievalError> {
                Err(RetrievalError::StoreUnavailable("connection refused".into()))
            }

            async fn adjacent_chunks(
                &self,
                _document_id: &str,
                _chunk_index: usize,
                _radius: usize,
            ) -> Result<Vec<RetrieverChunk>, RetrievalError> {
                Err(RetrievalError::StoreUnavailable("connection refused".into()))
            }
        }

        let store = BrokenStore;
        let cache = SectionCache::new();
        let generator = StubAnswerGenerator::new();
        let services = RetrievalServices {
            store: &store,
            embedding_provider: None,
            reranker: None,
            section_cache: &cache,
            answer_generator: &generator,
        };

        let result = retrieve(
            &services,
            "монтаж трубы",
            RagConfig::default(),
            RetrievalOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(RetrievalError::StoreUnavailable(_))));
    }
}
