use crate::error::{AppError, Result};
use crate::storage::{ByteStream, StorageBackend};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::io::ReaderStream;

/// Local filesystem backend.
#[derive(Clone)]
pub struct LocalStorage {
    storage_root: PathBuf,
}

impl LocalStorage {
    pub fn new(storage_root: impl AsRef<Path>) -> Self {
        Self {
            storage_root: storage_root.as_ref().join("files"),
        }
    }

    /// Initialize the storage directory structure
    pub async fn init(&self) -> Result<()> {
        if !self.storage_root.exists() {
            fs::create_dir_all(&self.storage_root).await.map_err(|e| {
                AppError::ServerError(format!("Failed to create storage directory: {}", e))
            })?;
            tracing::info!(
                "📁 Created storage directory: {}",
                self.storage_root.display()
            );
        }
        Ok(())
    }

    /// Relative path for a given file id.
    /// Uses a hierarchical structure: ab/cd/abcd1234...
    /// This distributes files across subdirectories to avoid filesystem
    /// performance issues with large flat directories.
    fn relative_path(file_id: &str) -> PathBuf {
        let level1 = &file_id[0..2.min(file_id.len())];
        let level2 = if file_id.len() >= 4 {
            &file_id[2..4]
        } else {
            "00"
        };

        Path::new(level1).join(level2).join(file_id)
    }

    fn generate_file_path(&self, file_id: &str) -> PathBuf {
        self.storage_root.join(Self::relative_path(file_id))
    }

    fn resolve(&self, storage_key: &str) -> PathBuf {
        self.storage_root.join(storage_key)
    }

    /// Clean up empty parent directories after file deletion
    fn cleanup_empty_dirs<'a>(
        &'a self,
        file_path: &'a Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if let Some(parent) = file_path.parent() {
                // Only clean up directories within our storage root
                if parent.starts_with(&self.storage_root) && parent != self.storage_root {
                    if let Ok(mut entries) = fs::read_dir(parent).await {
                        if entries.next_entry().await.unwrap_or(None).is_none() {
                            if fs::remove_dir(parent).await.is_ok() {
                                tracing::debug!(
                                    "🧹 Cleaned up empty directory: {}",
                                    parent.display()
                                );
                                Box::pin(self.cleanup_empty_dirs(parent)).await;
                            }
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn storage_key_for(&self, file_id: &str) -> String {
        Self::relative_path(file_id).to_string_lossy().to_string()
    }

    async fn save(&self, file_id: &str, data: &[u8]) -> Result<String> {
        let file_path = self.generate_file_path(file_id);

        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                AppError::BackendWriteFailure(format!("Failed to create directory: {}", e))
            })?;
        }

        fs::write(&file_path, data)
            .await
            .map_err(|e| AppError::BackendWriteFailure(format!("Failed to write file: {}", e)))?;

        let storage_key = file_path
            .strip_prefix(&self.storage_root)
            .map_err(|e| AppError::ServerError(format!("Failed to get relative path: {}", e)))?
            .to_string_lossy()
            .to_string();

        tracing::debug!("💾 Stored file: {} -> {}", file_id, storage_key);
        Ok(storage_key)
    }

    async fn read(&self, storage_key: &str) -> Result<Vec<u8>> {
        let file_path = self.resolve(storage_key);

        let data = fs::read(&file_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AppError::FileNotFound,
            _ => AppError::ServerError(format!("Failed to read file: {}", e)),
        })?;

        tracing::debug!("📖 Retrieved file: {} ({} bytes)", storage_key, data.len());
        Ok(data)
    }

    async fn open_stream(&self, storage_key: &str) -> Result<ByteStream> {
        let file_path = self.resolve(storage_key);

        let file = fs::File::open(&file_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => AppError::FileNotFound,
                _ => AppError::ServerError(format!("Failed to open file: {}", e)),
            })?;

        Ok(ReaderStream::new(file).boxed())
    }

    async fn delete(&self, storage_key: &str) -> Result<()> {
        let file_path = self.resolve(storage_key);

        match fs::remove_file(&file_path).await {
            Ok(_) => {
                tracing::debug!("🗑️  Deleted file: {}", storage_key);
                self.cleanup_empty_dirs(&file_path).await;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::ServerError(format!(
                "Failed to delete file: {}",
                e
            ))),
        }
    }

    async fn exists(&self, storage_key: &str) -> Result<bool> {
        Ok(self.resolve(storage_key).exists())
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_storage_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());
        storage.init().await.unwrap();

        let test_data = b"Hello, World!";

        let key = storage.save("abcd1234file", test_data).await.unwrap();
        assert!(!key.is_empty());
        assert!(storage.exists(&key).await.unwrap());

        let retrieved = storage.read(&key).await.unwrap();
        assert_eq!(test_data, &retrieved[..]);

        storage.delete(&key).await.unwrap();
        assert!(!storage.exists(&key).await.unwrap());
        assert!(matches!(
            storage.read(&key).await,
            Err(AppError::FileNotFound)
        ));

        // Deleting absent bytes is not an error
        storage.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_storage_stream() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());
        storage.init().await.unwrap();

        let key = storage.save("streamfile01", b"streamed bytes").await.unwrap();

        let stream = storage.open_stream(&key).await.unwrap();
        let chunks: Vec<bytes::Bytes> = stream.try_collect().await.unwrap();
        let collected: Vec<u8> = chunks.concat();
        assert_eq!(collected, b"streamed bytes");

        assert!(matches!(
            storage.open_stream("aa/bb/missing").await,
            Err(AppError::FileNotFound)
        ));
    }

    #[tokio::test]
    async fn test_path_fan_out() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());
        storage.init().await.unwrap();

        let key = storage.save("abcd1234", b"x").await.unwrap();

        // Should create structure: ab/cd/abcd1234
        let expected = Path::new("ab").join("cd").join("abcd1234");
        assert_eq!(Path::new(&key), expected);
    }
}
