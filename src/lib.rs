// evstore - Tiered sparse embedding storage
// Storage core for unbounded key→vector tables

#![warn(rust_2018_idioms)]

pub mod checkpoint;
pub mod config;
pub mod embedding;
pub mod metrics;
pub mod storage;
pub mod types;

// Re-exports for convenience
pub use checkpoint::{BundleReader, BundleWriter, CheckpointData, MemoryBundle};
pub use config::{EmbeddingConfig, EvConfig, StorageConfig};
pub use embedding::{EmbeddingVar, RayonPool, WorkerPool};
pub use storage::{
    Allocator, ContiguousSlot, HostAllocator, SingleTierStorage, SlotPtr, Storage, Tier,
    TieredStorage, ValueSlot,
};
pub use types::{DataType, Element, Key, Scalar};

/// evstore error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Not found: {0}")]
        NotFound(String),

        #[error("Already exists: {0}")]
        AlreadyExists(String),

        /// Operation is not meaningful for the current storage configuration
        #[error("Unsupported operation: {0}")]
        Unsupported(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Checkpoint error: {0}")]
        Checkpoint(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        #[error("Serialization error: {0}")]
        SerializationError(String),

        #[error("Configuration error: {0}")]
        Config(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        assert!(!VERSION.is_empty());
        assert_eq!(VERSION.split('.').count(), 3);
    }

    #[test]
    fn test_error_display() {
        let e = error::Error::Unsupported("insert on tiered storage".to_string());
        assert_eq!(
            e.to_string(),
            "Unsupported operation: insert on tiered storage"
        );
    }
}
