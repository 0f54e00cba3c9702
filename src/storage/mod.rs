//! Storage module - test data retrieval
//!
//! Bytes enter the judge only through a [`ContentSource`]. The
//! [`ArtifactStore`] sits in front of it and makes sure every content key is
//! fetched at most once and kept in a durable on-disk cache.

pub mod local;
pub mod s3;
pub mod store;

use anyhow::Result;
use async_trait::async_trait;

pub use local::LocalSource;
pub use s3::StorageClient;
pub use store::{ArtifactStore, StoreError, StoreStats};

/// Where the bytes of one piece of content live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Content carried in the request itself
    Inline(Vec<u8>),
    /// Opaque locator understood by the content source
    Url(String),
}

impl Locator {
    /// Short form for logs
    pub fn describe(&self) -> String {
        match self {
            Locator::Inline(bytes) => format!("<inline {} bytes>", bytes.len()),
            Locator::Url(url) => url.clone(),
        }
    }
}

/// Something that can produce the bytes behind a [`Locator`]
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch(&self, locator: &Locator) -> Result<Vec<u8>>;
}
