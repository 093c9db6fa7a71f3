use crate::error::{AppError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;

pub mod bucket;
pub mod local;

pub use bucket::BucketStorage;
pub use local::LocalStorage;

/// Byte stream handed to download callers; backend-agnostic.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Capability for writing, reading and deleting file bytes.
///
/// One implementation per placement variant; the variant in use is
/// recorded on the file record as the bucket discriminator and resolved
/// through [`StorageRouter`] at download time.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store a file's bytes, returning the location token to persist on
    /// the record.
    async fn save(&self, file_id: &str, data: &[u8]) -> Result<String>;

    /// The location token `save` would produce for this file id.
    /// Derivable before the write so a failed save can be rolled back.
    fn storage_key_for(&self, file_id: &str) -> String;

    /// Read a file's bytes fully into memory.
    async fn read(&self, storage_key: &str) -> Result<Vec<u8>>;

    /// Open a byte stream for downloading.
    async fn open_stream(&self, storage_key: &str) -> Result<ByteStream>;

    /// Delete a file's bytes. Deleting bytes that are already gone is not
    /// an error.
    async fn delete(&self, storage_key: &str) -> Result<()>;

    async fn exists(&self, storage_key: &str) -> Result<bool>;

    fn kind(&self) -> &'static str;
}

/// Maps a record's bucket discriminator to the owning backend.
pub struct StorageRouter {
    local: LocalStorage,
    buckets: HashMap<String, BucketStorage>,
}

impl StorageRouter {
    pub fn new(local: LocalStorage) -> Self {
        Self {
            local,
            buckets: HashMap::new(),
        }
    }

    pub fn with_bucket(mut self, name: impl Into<String>, backend: BucketStorage) -> Self {
        self.buckets.insert(name.into(), backend);
        self
    }

    /// Resolve the backend for a record; None means local filesystem.
    pub fn backend_for(&self, bucket: Option<&str>) -> Result<&dyn StorageBackend> {
        match bucket {
            None => Ok(&self.local),
            Some(name) => self
                .buckets
                .get(name)
                .map(|b| b as &dyn StorageBackend)
                .ok_or_else(|| {
                    AppError::ServerError(format!("Unknown storage bucket: {}", name))
                }),
        }
    }

    pub fn has_bucket(&self, name: &str) -> bool {
        self.buckets.contains_key(name)
    }
}
