use async_trait::async_trait;

use crate::{
    error::RetrievalError,
    types::{DocumentMeta, RetrieverChunk},
};

/// Contract the ingestion subsystem fulfils for the retrieval core. Only
/// documents in an "indexed" state are visible through this trait.
///
/// A store that cannot reach its backend returns
/// [`RetrievalError::StoreUnavailable`]; that is the one fatal error class
/// in the retrieval path.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Candidate pool for one retrieval call, bounded by `limit`.
    async fn candidate_pool(&self, limit: usize) -> Result<Vec<RetrieverChunk>, RetrievalError>;

    /// One `DocumentMeta` per distinct indexed document.
    async fn document_meta(&self) -> Result<Vec<DocumentMeta>, RetrievalError>;

    /// All chunks of a document sharing the given section path, ordered by
    /// chunk index.
    async fn section_chunks(
        &self,
        document_id: &str,
        section_path: &str,
    ) -> Result<Vec<RetrieverChunk>, RetrievalError>;

    /// Chunks within `radius` positions of the given index in a document,
    /// the source position excluded.
    async fn adjacent_chunks(
        &self,
        document_id: &str,
        chunk_index: usize,
        radius: usize,
    ) -> Result<Vec<RetrieverChunk>, RetrievalError>;
}
