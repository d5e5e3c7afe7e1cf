use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    error::RetrievalError,
    types::{DocumentMeta, RetrieverChunk},
};

use super::store::ChunkStore;

/// Vector-backed `ChunkStore` for tests, available to embedders of the
/// library through the `test-utils` feature.
#[derive(Debug, Default)]
pub struct InMemoryChunkStore {
    documents: HashMap<String, DocumentMeta>,
    indexed: HashMap<String, bool>,
    chunks: Vec<RetrieverChunk>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_document(&mut self, meta: DocumentMeta) {
        self.indexed.insert(meta.id.clone(), true);
        self.documents.insert(meta.id.clone(), meta);
    }

    /// Registers a document that has not finished indexing; its chunks stay
    /// invisible to retrieval.
    pub fn add_pending_document(&mut self, meta: DocumentMeta) {
        self.indexed.insert(meta.id.clone(), false);
        self.documents.insert(meta.id.clone(), meta);
    }

    pub fn add_chunk(&mut self, chunk: RetrieverChunk) {
        self.chunks.push(chunk);
    }

    fn is_indexed(&self, document_id: &str) -> bool {
        self.indexed.get(document_id).copied().unwrap_or(false)
    }
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn candidate_pool(&self, limit: usize) -> Result<Vec<RetrieverChunk>, RetrievalError> {
        Ok(self
            .chunks
            .iter()
            .filter(|chunk| self.is_indexed(&chunk.document_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn document_meta(&self) -> Result<Vec<DocumentMeta>, RetrievalError> {
        Ok(self
            .documents
            .values()
            .filter(|meta| self.is_indexed(&meta.id))
            .cloned()
            .collect())
    }

    async fn section_chunks(
        &self,
        document_id: &str,
        section_path: &str,
    ) -> Result<Vec<RetrieverChunk>, RetrievalError> {
        let mut section: Vec<RetrieverChunk> = self
            .chunks
            .iter()
            .filter(|chunk| {
                chunk.document_id == document_id
                    && chunk.section_path.as_deref() == Some(section_path)
            })
            .cloned()
            .collect();
        section.sort_by_key(|chunk| chunk.chunk_index);
        Ok(section)
    }

    async fn adjacent_chunks(
        &self,
        document_id: &str,
        chunk_index: usize,
        radius: usize,
    ) -> Result<Vec<RetrieverChunk>, RetrievalError> {
        let low = chunk_index.saturating_sub(radius);
        let high = chunk_index.saturating_add(radius);
        let mut adjacent: Vec<RetrieverChunk> = self
            .chunks
            .iter()
            .filter(|chunk| {
                chunk.document_id == document_id
                    && chunk.chunk_index != chunk_index
                    && chunk.chunk_index >= low
                    && chunk.chunk_index <= high
            })
            .cloned()
            .collect();
        adjacent.sort_by_key(|chunk| chunk.chunk_index);
        Ok(adjacent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentType;

    fn store_with_three_chunks() -> InMemoryChunkStore {
        let mut store = InMemoryChunkStore::new();
        store.add_document(DocumentMeta::new("doc1", "catalog.pdf", DocumentType::Catalog));
        for i in 0..3 {
            store.add_chunk(
                RetrieverChunk::new("doc1", i, format!("chunk {i}"), DocumentType::Catalog, "catalog.pdf")
                    .with_section("2.1"),
            );
        }
        store
    }

    #[tokio::test]
    async fn pool_respects_limit_and_indexed_state() {
        let mut store = store_with_three_chunks();
        store.add_pending_document(DocumentMeta::new("doc2", "draft.pdf", DocumentType::General));
        store.add_chunk(RetrieverChunk::new(
            "doc2",
            0,
            "invisible",
            DocumentType::General,
            "draft.pdf",
        ));

        let pool = store.candidate_pool(2).await.expect("pool failed");
        assert_eq!(pool.len(), 2);
        assert!(pool.iter().all(|chunk| chunk.document_id == "doc1"));
    }

    #[tokio::test]
    async fn adjacency_excludes_source_index() {
        let store = store_with_three_chunks();
        let adjacent = store
            .adjacent_chunks("doc1", 1, 1)
            .await
            .expect("adjacency failed");
        let indices: Vec<usize> = adjacent.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 2]);
    }
}
