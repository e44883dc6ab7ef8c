//! Pluggable storage abstraction for backup artifacts.
//!
//! Storage providers persist opaque blobs; everything reaching them has
//! already been through the codec. The local-filesystem provider ships
//! in-core; cloud providers (S3, GCS, Azure) satisfy the same contract but
//! live outside the core.

pub mod local;

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Result;

/// A boxed async reader for streaming blob downloads.
pub type BoxAsyncRead = Pin<Box<dyn AsyncRead + Send>>;

/// Metadata for a stored blob.
#[derive(Debug, Clone)]
pub struct BlobStat {
    pub size: u64,
    pub etag: Option<String>,
}

/// Trait for pluggable storage providers.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Provider tag recorded in descriptors (e.g. "local", "s3").
    fn provider(&self) -> &str;

    /// Stream a blob into storage. `size_hint` lets providers preallocate
    /// or set content lengths; the returned value is the byte count
    /// actually written.
    async fn put(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size_hint: Option<u64>,
    ) -> Result<u64>;

    /// Open a blob for streaming reads.
    async fn get(&self, key: &str) -> Result<BoxAsyncRead>;

    /// Delete a blob. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys under a prefix, lexicographically sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn stat(&self, key: &str) -> Result<BlobStat>;

    async fn exists(&self, key: &str) -> Result<bool>;
}
