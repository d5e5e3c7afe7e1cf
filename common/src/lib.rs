pub mod error;
pub mod storage;
pub mod types;
pub mod utils;
