use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a source document, used for intent-based
/// filtering and boost alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Catalog,
    Instruction,
    #[default]
    General,
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DocumentType::Catalog => "catalog",
            DocumentType::Instruction => "instruction",
            DocumentType::General => "general",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for DocumentType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "catalog" => Ok(Self::Catalog),
            "instruction" => Ok(Self::Instruction),
            "general" => Ok(Self::General),
            other => Err(format!("unknown document type '{other}'")),
        }
    }
}

/// How the ingestion subsystem produced the document's chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingType {
    #[default]
    Text,
    Structured,
    Spreadsheet,
}

/// Per-document facts needed for boosting, derived once per retrieval call
/// from the corpus snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub id: String,
    pub filename: String,
    pub document_type: DocumentType,
    pub processing_type: ProcessingType,
    pub title: Option<String>,
    /// Product names known at the document level, matched against SKU-like
    /// query tokens.
    pub product_names: Vec<String>,
}

impl DocumentMeta {
    pub fn new(id: impl Into<String>, filename: impl Into<String>, doc_type: DocumentType) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            document_type: doc_type,
            processing_type: ProcessingType::default(),
            title: None,
            product_names: Vec::new(),
        }
    }
}
