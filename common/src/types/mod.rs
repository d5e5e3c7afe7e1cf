pub mod chunk;
pub mod document;

pub use chunk::{ChunkMetadata, RetrieverChunk, TableRow};
pub use document::{DocumentMeta, DocumentType, ProcessingType};
