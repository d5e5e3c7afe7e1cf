#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::InMemoryChunkStore;
pub use store::ChunkStore;
