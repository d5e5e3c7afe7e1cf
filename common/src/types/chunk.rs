use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::document::DocumentType;

/// One row extracted from a tabular region of a source document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableRow {
    pub cells: Vec<String>,
}

/// Structured chunk metadata populated and validated at the ingestion
/// boundary. Absent facts stay `None` rather than living in an open-ended
/// dictionary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub heading: Option<String>,
    pub section_title: Option<String>,
    pub tags: Vec<String>,
    pub product_name: Option<String>,
    pub variant_name: Option<String>,
    pub table_rows: Vec<TableRow>,
}

/// An immutable unit of retrievable evidence. Created by the ingestion
/// collaborator; read-only to the retrieval core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieverChunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub content: String,
    /// Embedding with fixed dimensionality per corpus. `None` means the
    /// scorer substitutes a deterministic fallback vector.
    pub embedding: Option<Vec<f32>>,
    /// Term-frequency multiset built from normalized tokens.
    pub term_counts: HashMap<String, u32>,
    pub term_total: u32,
    pub page_number: Option<u32>,
    pub section_path: Option<String>,
    pub metadata: ChunkMetadata,
    pub document_type: DocumentType,
    pub filename: String,
}

impl RetrieverChunk {
    pub fn new(
        document_id: impl Into<String>,
        chunk_index: usize,
        content: impl Into<String>,
        document_type: DocumentType,
        filename: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let term_counts = crate::utils::text::term_counts(&content);
        let term_total = term_counts.values().sum();
        Self {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.into(),
            chunk_index,
            content,
            embedding: None,
            term_counts,
            term_total,
            page_number: None,
            section_path: None,
            metadata: ChunkMetadata::default(),
            document_type,
            filename: filename.into(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_section(mut self, section_path: impl Into<String>) -> Self {
        self.section_path = Some(section_path.into());
        self
    }

    pub fn with_metadata(mut self, metadata: ChunkMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Frequency of a single normalized term within this chunk.
    pub fn term_frequency(&self, term: &str) -> u32 {
        self.term_counts.get(term).copied().unwrap_or(0)
    }

    /// Normalized identity grouping chunks of the same product variant.
    /// Falls back to the section path when no variant metadata exists.
    pub fn variant_key(&self) -> Option<String> {
        self.metadata
            .variant_name
            .as_deref()
            .or(self.metadata.product_name.as_deref())
            .map(|name| name.trim().to_lowercase())
            .or_else(|| {
                self.section_path
                    .as_deref()
                    .map(|path| path.trim().to_lowercase())
            })
    }
}
