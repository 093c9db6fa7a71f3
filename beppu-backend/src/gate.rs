use crate::auth::{self, AccessScope, ApiKeyRegistry, Credentials, SessionRegistry};
use crate::database::file_ops;
use crate::error::{AppError, Result};
use crate::storage::{ByteStream, StorageRouter};
use beppu_encrypt::{FileCipher, FileKey, SealedBytes};
use beppu_entity::file;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// How the caller names the file.
#[derive(Debug, Clone, Copy)]
pub enum FileRef<'a> {
    Id(&'a str),
    Hotlink(&'a str),
}

/// The byte source handed back on a granted download. Callers never see
/// which backend produced it.
pub enum DownloadBody {
    Streamed(ByteStream),
    Buffered(Vec<u8>),
}

pub struct GrantedDownload {
    pub record: file::Model,
    pub body: DownloadBody,
    /// Proof value for the per-file password cookie, present when a fresh
    /// correct password submission should be remembered.
    pub password_cookie: Option<String>,
}

/// Decides whether a download may proceed and routes the byte stream to
/// the record's backend. The checks run as an ordered decision table;
/// the first decisive match wins.
pub struct DownloadGate {
    db: DatabaseConnection,
    storage: Arc<StorageRouter>,
    sessions: Arc<SessionRegistry>,
    api_keys: Arc<ApiKeyRegistry>,
    grace: chrono::Duration,
}

impl DownloadGate {
    pub fn new(
        db: DatabaseConnection,
        storage: Arc<StorageRouter>,
        sessions: Arc<SessionRegistry>,
        api_keys: Arc<ApiKeyRegistry>,
        grace: chrono::Duration,
    ) -> Self {
        Self {
            db,
            storage,
            sessions,
            api_keys,
            grace,
        }
    }

    pub async fn authorize(
        &self,
        file_ref: FileRef<'_>,
        scope: AccessScope,
        credentials: &Credentials,
    ) -> Result<GrantedDownload> {
        // 1. Resolve the record; pending-deletion reads as absent
        let record = match file_ref {
            FileRef::Id(id) => file_ops::get_file_by_id(&self.db, id).await?,
            FileRef::Hotlink(id) => file_ops::get_file_by_hotlink(&self.db, id).await?,
        }
        .ok_or(AppError::FileNotFound)?;

        if record.is_pending_deletion() {
            return Err(AppError::FileNotFound);
        }

        // 2. Expiry, distinct from absence; schedule deletion on the way out
        if record.is_expired() {
            let when = chrono::Utc::now() + self.grace;
            if let Err(e) = file_ops::mark_pending_deletion(&self.db, &record.file_id, when).await {
                tracing::warn!(
                    "Failed to mark expired file {} pending deletion: {}",
                    record.file_id,
                    e
                );
            }
            return Err(AppError::FileExpired);
        }

        // 3. Password, when the record carries one. A fresh submission is
        // judged against the hash; a cookie is judged against the proof
        // for this exact file. A stale cookie re-prompts rather than
        // accusing: only live submissions earn IncorrectPassword. On web
        // routes an authenticated session stands in for the password, so
        // a logged-in owner is never prompted for their own files.
        let mut password_cookie = None;
        if let Some(password_hash) = &record.password_hash {
            let session_satisfies = matches!(scope, AccessScope::Web)
                && credentials
                    .session_token
                    .as_deref()
                    .and_then(|token| self.sessions.verify(token))
                    .is_some();

            if !session_satisfies {
                if let Some(submitted) = &credentials.password {
                    if !auth::verify_password(submitted, password_hash) {
                        return Err(AppError::IncorrectPassword);
                    }
                    password_cookie = Some(auth::password_proof(password_hash, &record.file_id));
                } else if let Some(cookie) = &credentials.password_cookie {
                    if *cookie != auth::password_proof(password_hash, &record.file_id) {
                        return Err(AppError::PasswordRequired);
                    }
                } else {
                    return Err(AppError::PasswordRequired);
                }
            }
        }

        // 4. Scope. API requests stand or fall with the key; a session
        // cookie never satisfies them. Web requests ride on the
        // unguessable link plus the checks above; hotlinks bypass
        // session and key entirely.
        match scope {
            AccessScope::Api => {
                let key = credentials.api_key.as_deref().unwrap_or_default();
                if self.api_keys.verify(key, |caps| caps.download).is_none() {
                    return Err(AppError::Unauthorized);
                }
            }
            AccessScope::Web | AccessScope::Hotlink => {}
        }

        // 5. Open the byte source before touching the counter so a benign
        // bytes-absent race costs the caller nothing
        let body = self.open_body(&record).await?;

        if record.downloads_remaining.is_some() {
            let remaining = file_ops::decrement_downloads(&self.db, &record.file_id).await?;
            if remaining == 0 {
                let when = chrono::Utc::now() + self.grace;
                if let Err(e) =
                    file_ops::mark_pending_deletion(&self.db, &record.file_id, when).await
                {
                    tracing::warn!(
                        "Failed to mark exhausted file {} pending deletion: {}",
                        record.file_id,
                        e
                    );
                }
            }
        }
        file_ops::increment_download_count(&self.db, &record.file_id).await?;

        tracing::info!(
            "📥 Granted download of {} via {:?} (download #{})",
            record.file_id,
            scope,
            record.download_count + 1
        );

        Ok(GrantedDownload {
            record,
            body,
            password_cookie,
        })
    }

    /// Route to the record's backend. Server-managed encryption is opened
    /// here with the stored key; end-to-end ciphertext streams through
    /// untouched.
    async fn open_body(&self, record: &file::Model) -> Result<DownloadBody> {
        let backend = self
            .storage
            .backend_for(record.bucket.as_deref())
            .map_err(|_| AppError::FileNotFound)?;

        match (&record.decryption_key, &record.nonce) {
            (Some(key_bytes), Some(nonce)) => {
                let ciphertext = backend.read(&record.storage_key).await?;
                let key = FileKey::from_bytes(key_bytes)?;
                let plaintext = FileCipher::open(
                    &SealedBytes {
                        ciphertext,
                        nonce: nonce.clone(),
                    },
                    &key,
                )?;
                Ok(DownloadBody::Buffered(plaintext))
            }
            _ => Ok(DownloadBody::Streamed(
                backend.open_stream(&record.storage_key).await?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ApiKeyCapabilities;
    use crate::database::file_ops::CreateFileParams;
    use crate::storage::{LocalStorage, StorageBackend};
    use futures::TryStreamExt;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        db: DatabaseConnection,
        storage: Arc<StorageRouter>,
        sessions: Arc<SessionRegistry>,
        api_keys: Arc<ApiKeyRegistry>,
        gate: DownloadGate,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let db = crate::database::setup_test_database().await;
        let local = LocalStorage::new(dir.path());
        local.init().await.unwrap();
        let storage = Arc::new(StorageRouter::new(local));
        let sessions = Arc::new(SessionRegistry::new());
        let api_keys = Arc::new(ApiKeyRegistry::new());
        let gate = DownloadGate::new(
            db.clone(),
            storage.clone(),
            sessions.clone(),
            api_keys.clone(),
            chrono::Duration::seconds(60),
        );
        Harness {
            _dir: dir,
            db,
            storage,
            sessions,
            api_keys,
            gate,
        }
    }

    async fn seed_file(h: &Harness, file_id: &str, mutate: impl FnOnce(&mut CreateFileParams)) {
        let backend = h.storage.backend_for(None).unwrap();
        let storage_key = backend.save(file_id, b"file body bytes").await.unwrap();

        let mut params = CreateFileParams {
            file_id: file_id.to_string(),
            name: "shared.bin".to_string(),
            content_type: Some("application/octet-stream".to_string()),
            size_bytes: 15,
            sha256: "cd".repeat(32),
            expires_at: None,
            downloads_remaining: None,
            password_hash: None,
            hotlink_id: None,
            is_encrypted: false,
            decryption_key: None,
            nonce: None,
            bucket: None,
            storage_key,
            user_id: 1,
        };
        mutate(&mut params);
        file_ops::create_file_record(&h.db, params).await.unwrap();
    }

    async fn body_bytes(body: DownloadBody) -> Vec<u8> {
        match body {
            DownloadBody::Buffered(bytes) => bytes,
            DownloadBody::Streamed(stream) => {
                let chunks: Vec<bytes::Bytes> = stream.try_collect().await.unwrap();
                chunks.concat()
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_file_is_not_found() {
        let h = harness().await;
        let err = h
            .gate
            .authorize(FileRef::Id("missing"), AccessScope::Web, &Credentials::default())
            .await;
        assert!(matches!(err, Err(AppError::FileNotFound)));
    }

    #[tokio::test]
    async fn test_public_file_downloads_by_link_alone() {
        let h = harness().await;
        seed_file(&h, "public01", |_| {}).await;

        let granted = h
            .gate
            .authorize(
                FileRef::Id("public01"),
                AccessScope::Web,
                &Credentials::default(),
            )
            .await
            .unwrap();
        assert_eq!(body_bytes(granted.body).await, b"file body bytes");

        let record = file_ops::get_file_by_id(&h.db, "public01")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.download_count, 1);
    }

    #[tokio::test]
    async fn test_expired_file_distinct_from_not_found() {
        let h = harness().await;
        seed_file(&h, "expired1", |p| {
            p.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(5));
            p.hotlink_id = Some("hotexp".to_string());
        })
        .await;

        // Hotlink to an expired file says expired, not absent
        let err = h
            .gate
            .authorize(
                FileRef::Hotlink("hotexp"),
                AccessScope::Hotlink,
                &Credentials::default(),
            )
            .await;
        assert!(matches!(err, Err(AppError::FileExpired)));

        // The expiry opportunistically marked it pending deletion, so the
        // record now reads as absent
        let record = file_ops::get_file_by_id(&h.db, "expired1")
            .await
            .unwrap()
            .unwrap();
        assert!(record.is_pending_deletion());

        let err = h
            .gate
            .authorize(
                FileRef::Hotlink("hotexp"),
                AccessScope::Hotlink,
                &Credentials::default(),
            )
            .await;
        assert!(matches!(err, Err(AppError::FileNotFound)));
    }

    #[tokio::test]
    async fn test_download_limit_exhaustion() {
        let h = harness().await;
        seed_file(&h, "lastone1", |p| {
            p.downloads_remaining = Some(1);
        })
        .await;

        let granted = h
            .gate
            .authorize(
                FileRef::Id("lastone1"),
                AccessScope::Web,
                &Credentials::default(),
            )
            .await
            .unwrap();
        assert_eq!(body_bytes(granted.body).await, b"file body bytes");

        // Exhaustion marked the record pending deletion; the second
        // request finds nothing to download
        let err = h
            .gate
            .authorize(
                FileRef::Id("lastone1"),
                AccessScope::Web,
                &Credentials::default(),
            )
            .await;
        assert!(matches!(
            err,
            Err(AppError::FileNotFound) | Err(AppError::FileExpired)
        ));

        let record = file_ops::get_file_by_id(&h.db, "lastone1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.downloads_remaining, Some(0));
        assert!(record.is_pending_deletion());
    }

    #[tokio::test]
    async fn test_password_precedence() {
        let h = harness().await;
        let hash = auth::hash_password("123").unwrap();
        let stored_hash = hash.clone();
        seed_file(&h, "locked01", move |p| {
            p.password_hash = Some(stored_hash);
        })
        .await;

        // No credential at all: prompt
        let err = h
            .gate
            .authorize(
                FileRef::Id("locked01"),
                AccessScope::Web,
                &Credentials::default(),
            )
            .await;
        assert!(matches!(err, Err(AppError::PasswordRequired)));

        // Fresh but wrong submission: incorrect
        let err = h
            .gate
            .authorize(
                FileRef::Id("locked01"),
                AccessScope::Web,
                &Credentials {
                    password: Some("wrong".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(err, Err(AppError::IncorrectPassword)));

        // Stale cookie value: prompt again, not an accusation
        let err = h
            .gate
            .authorize(
                FileRef::Id("locked01"),
                AccessScope::Web,
                &Credentials {
                    password_cookie: Some("invalid".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(err, Err(AppError::PasswordRequired)));

        // Correct submission grants and issues the cookie proof
        let granted = h
            .gate
            .authorize(
                FileRef::Id("locked01"),
                AccessScope::Web,
                &Credentials {
                    password: Some("123".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let proof = granted.password_cookie.clone().unwrap();
        assert_eq!(proof, auth::password_proof(&hash, "locked01"));

        // The cookie alone now grants without re-prompting
        let granted = h
            .gate
            .authorize(
                FileRef::Id("locked01"),
                AccessScope::Web,
                &Credentials {
                    password_cookie: Some(proof),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(granted.password_cookie.is_none());
    }

    #[tokio::test]
    async fn test_session_stands_in_for_password_on_web_routes() {
        let h = harness().await;
        let hash = auth::hash_password("ownerpw").unwrap();
        let stored_hash = hash.clone();
        seed_file(&h, "ownfile1", move |p| {
            p.password_hash = Some(stored_hash);
            p.hotlink_id = Some("ownhot".to_string());
        })
        .await;
        h.sessions.insert("ownersession", 1);

        // Logged-in web request skips the prompt
        let granted = h
            .gate
            .authorize(
                FileRef::Id("ownfile1"),
                AccessScope::Web,
                &Credentials {
                    session_token: Some("ownersession".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(granted.password_cookie.is_none());

        // An invalid session does not
        let err = h
            .gate
            .authorize(
                FileRef::Id("ownfile1"),
                AccessScope::Web,
                &Credentials {
                    session_token: Some("forged".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(err, Err(AppError::PasswordRequired)));

        // Hotlink scope never consults the session
        let err = h
            .gate
            .authorize(
                FileRef::Hotlink("ownhot"),
                AccessScope::Hotlink,
                &Credentials {
                    session_token: Some("ownersession".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(err, Err(AppError::PasswordRequired)));
    }

    #[tokio::test]
    async fn test_api_scope_requires_api_key() {
        let h = harness().await;
        seed_file(&h, "apifile1", |_| {}).await;
        h.sessions.insert("validsession", 1);
        h.api_keys.insert("validkey", 1, ApiKeyCapabilities::full());
        h.api_keys.insert(
            "uploadonly",
            2,
            ApiKeyCapabilities {
                upload: true,
                list: false,
                download: false,
            },
        );

        // A valid session cookie never satisfies an API-scoped request
        let err = h
            .gate
            .authorize(
                FileRef::Id("apifile1"),
                AccessScope::Api,
                &Credentials {
                    session_token: Some("validsession".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(err, Err(AppError::Unauthorized)));

        // A key without the download capability is refused
        let err = h
            .gate
            .authorize(
                FileRef::Id("apifile1"),
                AccessScope::Api,
                &Credentials {
                    api_key: Some("uploadonly".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(err, Err(AppError::Unauthorized)));

        // A capable key is granted
        let granted = h
            .gate
            .authorize(
                FileRef::Id("apifile1"),
                AccessScope::Api,
                &Credentials {
                    api_key: Some("validkey".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(body_bytes(granted.body).await, b"file body bytes");
    }

    #[tokio::test]
    async fn test_hotlink_bypasses_key_but_not_password() {
        let h = harness().await;
        let hash = auth::hash_password("embed").unwrap();
        seed_file(&h, "hotfile1", move |p| {
            p.hotlink_id = Some("shorty".to_string());
            p.password_hash = Some(hash);
        })
        .await;

        // No session or key needed, but the password still gates
        let err = h
            .gate
            .authorize(
                FileRef::Hotlink("shorty"),
                AccessScope::Hotlink,
                &Credentials::default(),
            )
            .await;
        assert!(matches!(err, Err(AppError::PasswordRequired)));

        let granted = h
            .gate
            .authorize(
                FileRef::Hotlink("shorty"),
                AccessScope::Hotlink,
                &Credentials {
                    password: Some("embed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(body_bytes(granted.body).await, b"file body bytes");
    }

    #[tokio::test]
    async fn test_missing_bytes_resolve_as_not_found() {
        let h = harness().await;
        seed_file(&h, "ghostly1", |p| {
            // Metadata points at bytes the sweeper already removed
            p.storage_key = "aa/bb/nothing-here".to_string();
        })
        .await;

        let err = h
            .gate
            .authorize(
                FileRef::Id("ghostly1"),
                AccessScope::Web,
                &Credentials::default(),
            )
            .await;
        assert!(matches!(err, Err(AppError::FileNotFound)));

        // The benign race costs the caller no download
        let record = file_ops::get_file_by_id(&h.db, "ghostly1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.download_count, 0);
    }

    #[tokio::test]
    async fn test_server_managed_file_streams_plaintext() {
        let h = harness().await;

        let key = FileKey::generate();
        let sealed = FileCipher::seal(b"decrypt me on the way out", &key).unwrap();
        let backend = h.storage.backend_for(None).unwrap();
        let storage_key = backend.save("sealed01", &sealed.ciphertext).await.unwrap();

        let key_bytes = key.as_bytes().to_vec();
        let nonce = sealed.nonce.clone();
        file_ops::create_file_record(
            &h.db,
            CreateFileParams {
                file_id: "sealed01".to_string(),
                name: "sealed.bin".to_string(),
                content_type: None,
                size_bytes: 25,
                sha256: "ef".repeat(32),
                expires_at: None,
                downloads_remaining: None,
                password_hash: None,
                hotlink_id: None,
                is_encrypted: true,
                decryption_key: Some(key_bytes),
                nonce: Some(nonce),
                bucket: None,
                storage_key,
                user_id: 1,
            },
        )
        .await
        .unwrap();

        let granted = h
            .gate
            .authorize(
                FileRef::Id("sealed01"),
                AccessScope::Web,
                &Credentials::default(),
            )
            .await
            .unwrap();
        assert_eq!(body_bytes(granted.body).await, b"decrypt me on the way out");
    }
}
