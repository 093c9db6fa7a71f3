use crate::assembler::{ChunkAssembler, StagedUpload};
use crate::auth;
use crate::database::file_ops::{self, CreateFileParams};
use crate::error::{AppError, Result};
use crate::status::StatusBoard;
use crate::storage::StorageRouter;
use beppu_encrypt::{FileCipher, FileKey};
use beppu_types::{EncryptionMode, UploadPhase};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sea_orm::DatabaseConnection;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

const HOTLINK_ID_LEN: usize = 10;
const READ_BUF_SIZE: usize = 64 * 1024;

/// Everything the caller decides at finalize time.
#[derive(Debug, Clone, Default)]
pub struct FinalizeOptions {
    pub password: Option<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub max_downloads: Option<i32>,
    pub encryption: EncryptionMode,
    /// Target bucket; None places the file on local storage.
    pub bucket: Option<String>,
    pub with_hotlink: bool,
    pub user_id: i64,
    /// Size the client declared at completion, cross-checked against the
    /// assembled bytes.
    pub declared_size: Option<i64>,
}

/// Orchestrates assembly, optional encryption, backend placement and the
/// metadata write for one upload session. The only component that creates
/// file records or writes to backends during upload.
pub struct UploadProcessor {
    db: DatabaseConnection,
    assembler: Arc<ChunkAssembler>,
    storage: Arc<StorageRouter>,
    status: Arc<StatusBoard>,
}

impl UploadProcessor {
    pub fn new(
        db: DatabaseConnection,
        assembler: Arc<ChunkAssembler>,
        storage: Arc<StorageRouter>,
        status: Arc<StatusBoard>,
    ) -> Self {
        Self {
            db,
            assembler,
            storage,
            status,
        }
    }

    fn emit(&self, session_id: &str, phase: UploadPhase, file_id: Option<&str>, error: Option<&str>) {
        self.status
            .publish(StatusBoard::event(session_id, phase, file_id, error));
    }

    /// Transition a completed chunk set into a durable file record plus
    /// stored bytes. Emits exactly one status event per phase; on failure
    /// the staging data is retained for one retry attempt and a Failed
    /// event carries the reason.
    pub async fn finalize(
        &self,
        session_id: &str,
        name: &str,
        content_type: Option<String>,
        options: FinalizeOptions,
    ) -> Result<beppu_entity::file::Model> {
        // Claim the session first: a losing racer must not disturb the
        // winner's handoff or its status feed on the way out
        let staged = match self.assembler.take_for_processing(session_id).await {
            Ok(staged) => staged,
            Err(e) => {
                if !matches!(e, AppError::FinalizeInProgress) {
                    self.emit(session_id, UploadPhase::Failed, None, Some(&e.to_string()));
                }
                return Err(e);
            }
        };
        self.emit(session_id, UploadPhase::Queued, None, None);

        match self.process(&staged, name, content_type, options).await {
            Ok(record) => {
                if let Err(e) = self.assembler.discard(session_id).await {
                    tracing::warn!("Failed to discard staging for {}: {}", session_id, e);
                }
                self.emit(
                    session_id,
                    UploadPhase::Finished,
                    Some(&record.file_id),
                    None,
                );
                tracing::info!(
                    "✅ Finalized upload session {} -> {} ({} bytes)",
                    session_id,
                    record.file_id,
                    record.size_bytes
                );
                Ok(record)
            }
            Err(e) => {
                // Staging stays behind for one retry attempt
                self.assembler.release_for_retry(session_id).await;
                self.emit(session_id, UploadPhase::Failed, None, Some(&e.to_string()));
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        staged: &StagedUpload,
        name: &str,
        content_type: Option<String>,
        options: FinalizeOptions,
    ) -> Result<beppu_entity::file::Model> {
        let session_id = staged.session_id.as_str();

        if let Some(declared) = options.declared_size {
            if declared != staged.total_size {
                return Err(AppError::IntegrityMismatch(format!(
                    "Declared size {} does not match assembled size {}",
                    declared, staged.total_size
                )));
            }
        }

        self.emit(session_id, UploadPhase::Assembling, None, None);
        let (plaintext, sha256) = self.read_staged(staged).await?;

        // Server-managed mode seals the bytes here; end-to-end bytes are
        // already ciphertext and pass through untouched, keyless.
        let (payload, is_encrypted, decryption_key, nonce) = match options.encryption {
            EncryptionMode::None => (plaintext, false, None, None),
            EncryptionMode::EndToEnd => (plaintext, true, None, None),
            EncryptionMode::ServerManaged => {
                self.emit(session_id, UploadPhase::Encrypting, None, None);
                let key = FileKey::generate();
                let sealed = FileCipher::seal(&plaintext, &key)?;
                (
                    sealed.ciphertext,
                    true,
                    Some(key.as_bytes().to_vec()),
                    Some(sealed.nonce),
                )
            }
        };

        self.emit(session_id, UploadPhase::Writing, None, None);
        let backend = self
            .storage
            .backend_for(options.bucket.as_deref())
            .map_err(|e| AppError::BackendWriteFailure(e.to_string()))?;

        let file_id = Uuid::new_v4().simple().to_string();

        // A transient backend error gets one automatic retry before the
        // failure is surfaced
        let storage_key = match backend.save(&file_id, &payload).await {
            Ok(key) => key,
            Err(first) => {
                tracing::warn!(
                    "Backend write for session {} failed, retrying once: {}",
                    session_id,
                    first
                );
                match backend.save(&file_id, &payload).await {
                    Ok(key) => key,
                    Err(second) => {
                        // Best-effort removal of whatever was partially written
                        let partial_key = backend.storage_key_for(&file_id);
                        if let Err(cleanup) = backend.delete(&partial_key).await {
                            tracing::warn!(
                                "Failed to clean up partial backend write {}: {}",
                                partial_key,
                                cleanup
                            );
                        }
                        return Err(AppError::BackendWriteFailure(second.to_string()));
                    }
                }
            }
        };

        let password_hash = match &options.password {
            Some(password) if !password.is_empty() => Some(auth::hash_password(password)?),
            _ => None,
        };

        let hotlink_id = options.with_hotlink.then(generate_hotlink_id);

        let record = file_ops::create_file_record(
            &self.db,
            CreateFileParams {
                file_id: file_id.clone(),
                name: name.to_string(),
                content_type,
                size_bytes: staged.total_size,
                sha256,
                expires_at: options.expires_at,
                downloads_remaining: options.max_downloads,
                password_hash,
                hotlink_id,
                is_encrypted,
                decryption_key,
                nonce,
                bucket: options.bucket.clone(),
                storage_key: storage_key.clone(),
                user_id: options.user_id,
            },
        )
        .await;

        match record {
            Ok(record) => Ok(record),
            Err(e) => {
                // No orphaned bytes without metadata; cleanup failure is
                // logged, the caller already sees the original failure
                if let Err(cleanup) = backend.delete(&storage_key).await {
                    tracing::warn!(
                        "Failed to clean up backend bytes {} after metadata failure: {}",
                        storage_key,
                        cleanup
                    );
                }
                Err(AppError::MetadataWriteFailure(e.to_string()))
            }
        }
    }

    /// Stream the staging file, computing the digest incrementally.
    async fn read_staged(&self, staged: &StagedUpload) -> Result<(Vec<u8>, String)> {
        let mut file = tokio::fs::File::open(&staged.staging_path).await?;
        let mut hasher = Sha256::new();
        let mut content = Vec::with_capacity(staged.total_size as usize);
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            content.extend_from_slice(&buf[..n]);
        }

        if content.len() as i64 != staged.total_size {
            return Err(AppError::IntegrityMismatch(format!(
                "Staged file holds {} bytes, session declared {}",
                content.len(),
                staged.total_size
            )));
        }

        Ok((content, hex::encode(hasher.finalize())))
    }
}

fn generate_hotlink_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(HOTLINK_ID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalStorage, StorageBackend, StorageRouter};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        db: DatabaseConnection,
        assembler: Arc<ChunkAssembler>,
        storage: Arc<StorageRouter>,
        status: Arc<StatusBoard>,
        processor: UploadProcessor,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let db = crate::database::setup_test_database().await;
        let local = LocalStorage::new(dir.path());
        local.init().await.unwrap();
        let assembler = Arc::new(ChunkAssembler::new(dir.path(), 1024 * 1024));
        assembler.init().await.unwrap();
        let storage = Arc::new(StorageRouter::new(local));
        let status = Arc::new(StatusBoard::new());
        let processor = UploadProcessor::new(
            db.clone(),
            assembler.clone(),
            storage.clone(),
            status.clone(),
        );
        Harness {
            _dir: dir,
            db,
            assembler,
            storage,
            status,
            processor,
        }
    }

    #[tokio::test]
    async fn test_finalize_reports_ordered_status_and_persists_record() {
        let h = harness().await;

        let payload = vec![0x42u8; 50];
        h.assembler
            .submit_chunk("abc123", 0, 50, &payload)
            .await
            .unwrap();

        // Subscribe before finalizing; the feed must end with Finished
        let mut rx = h.status.subscribe("abc123");

        let record = h
            .processor
            .finalize(
                "abc123",
                "fileupload.jpg",
                Some("image/jpeg".to_string()),
                FinalizeOptions {
                    declared_size: Some(50),
                    user_id: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = rx.recv().await {
            phases.push(event.upload_status);
            if event.upload_status.is_terminal() {
                assert!(!event.file_id.is_empty());
                assert_eq!(event.file_id, record.file_id);
            }
        }
        assert_eq!(
            phases,
            vec![
                UploadPhase::Queued,
                UploadPhase::Assembling,
                UploadPhase::Writing,
                UploadPhase::Finished
            ]
        );

        let stored = file_ops::get_file_by_id(&h.db, &record.file_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.size_bytes, 50);
        assert_eq!(stored.name, "fileupload.jpg");
        assert!(!stored.is_encrypted);
        assert!(stored.bucket.is_none());

        // Staging is gone after success
        assert_eq!(h.assembler.session_count(), 0);

        // Bytes are where the record says
        let backend = h.storage.backend_for(None).unwrap();
        assert_eq!(backend.read(&stored.storage_key).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_server_managed_encryption_round_trip() {
        let h = harness().await;

        let plaintext = b"the secret file body".to_vec();
        h.assembler
            .submit_chunk("enc-session", 0, plaintext.len() as i64, &plaintext)
            .await
            .unwrap();

        let record = h
            .processor
            .finalize(
                "enc-session",
                "secret.txt",
                None,
                FinalizeOptions {
                    encryption: EncryptionMode::ServerManaged,
                    user_id: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(record.is_encrypted);
        let key_bytes = record.decryption_key.clone().unwrap();
        let nonce = record.nonce.clone().unwrap();

        // Stored bytes are ciphertext; opening with the stored key and
        // nonce reproduces the plaintext byte for byte
        let backend = h.storage.backend_for(None).unwrap();
        let ciphertext = backend.read(&record.storage_key).await.unwrap();
        assert_ne!(ciphertext, plaintext);

        let key = FileKey::from_bytes(&key_bytes).unwrap();
        let opened = FileCipher::open(
            &beppu_encrypt::SealedBytes { ciphertext, nonce },
            &key,
        )
        .unwrap();
        assert_eq!(opened, plaintext);

        // Digest covers the plaintext for server-managed mode
        let mut hasher = Sha256::new();
        hasher.update(&plaintext);
        assert_eq!(record.sha256, hex::encode(hasher.finalize()));
    }

    #[tokio::test]
    async fn test_end_to_end_mode_stores_no_key() {
        let h = harness().await;

        let ciphertext = b"opaque client ciphertext".to_vec();
        h.assembler
            .submit_chunk("e2e-session", 0, ciphertext.len() as i64, &ciphertext)
            .await
            .unwrap();

        let record = h
            .processor
            .finalize(
                "e2e-session",
                "vault.bin",
                None,
                FinalizeOptions {
                    encryption: EncryptionMode::EndToEnd,
                    user_id: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(record.is_encrypted);
        assert!(record.decryption_key.is_none());
        assert!(record.nonce.is_none());
        assert!(record.is_end_to_end_encrypted());

        // The server stores the ciphertext exactly as received
        let backend = h.storage.backend_for(None).unwrap();
        assert_eq!(backend.read(&record.storage_key).await.unwrap(), ciphertext);
    }

    #[tokio::test]
    async fn test_failed_finalize_retains_staging_for_retry() {
        let h = harness().await;

        h.assembler
            .submit_chunk("retry-me", 0, 4, b"data")
            .await
            .unwrap();

        let mut rx = h.status.subscribe("retry-me");

        // An unknown bucket makes the backend unreachable
        let err = h
            .processor
            .finalize(
                "retry-me",
                "file.bin",
                None,
                FinalizeOptions {
                    bucket: Some("no-such-bucket".to_string()),
                    user_id: 1,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(err, Err(AppError::BackendWriteFailure(_))));

        // The feed ends with Failed carrying the reason
        let mut last = None;
        while let Ok(event) = rx.recv().await {
            last = Some(event);
        }
        let last = last.unwrap();
        assert_eq!(last.upload_status, UploadPhase::Failed);
        assert!(!last.error_message.is_empty());

        // Staging survived for one retry: finalizing locally now works
        let record = h
            .processor
            .finalize(
                "retry-me",
                "file.bin",
                None,
                FinalizeOptions {
                    user_id: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(record.size_bytes, 4);
    }

    #[tokio::test]
    async fn test_declared_size_mismatch_is_integrity_error() {
        let h = harness().await;

        h.assembler
            .submit_chunk("mismatch", 0, 4, b"data")
            .await
            .unwrap();

        let err = h
            .processor
            .finalize(
                "mismatch",
                "file.bin",
                None,
                FinalizeOptions {
                    declared_size: Some(5),
                    user_id: 1,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(err, Err(AppError::IntegrityMismatch(_))));
    }

    #[tokio::test]
    async fn test_hotlink_and_password_options() {
        let h = harness().await;

        h.assembler
            .submit_chunk("opts", 0, 4, b"data")
            .await
            .unwrap();

        let record = h
            .processor
            .finalize(
                "opts",
                "file.bin",
                None,
                FinalizeOptions {
                    password: Some("hunter2".to_string()),
                    with_hotlink: true,
                    max_downloads: Some(3),
                    user_id: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(record.is_password_protected());
        assert!(auth::verify_password(
            "hunter2",
            record.password_hash.as_deref().unwrap()
        ));
        let hotlink = record.hotlink_id.clone().unwrap();
        assert_eq!(hotlink.len(), HOTLINK_ID_LEN);
        assert_eq!(record.downloads_remaining, Some(3));

        let by_hotlink = file_ops::get_file_by_hotlink(&h.db, &hotlink)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_hotlink.file_id, record.file_id);
    }
}
