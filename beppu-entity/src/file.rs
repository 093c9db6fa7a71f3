use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "files")]
pub struct Model {
    #[sea_orm(primary_key)]
    #[serde(skip_deserializing)]
    pub id: i32,

    /// Unique identifier for the file (used in URLs)
    #[sea_orm(unique)]
    pub file_id: String,

    /// Original filename as declared at finalize
    pub name: String,

    /// Declared content type, if any
    pub content_type: Option<String>,

    /// File size in bytes
    pub size_bytes: i64,

    /// Hex SHA-256 digest of the stored content (plaintext for unencrypted
    /// and server-managed files, ciphertext for end-to-end uploads)
    pub sha256: String,

    /// When the file expires; None means unlimited time
    pub expires_at: Option<ChronoDateTimeUtc>,

    /// Downloads left before the file expires; None means unlimited
    pub downloads_remaining: Option<i32>,

    /// Argon2 hash of the download password; None means no password
    pub password_hash: Option<String>,

    /// Short URL-safe hotlink id, unique across all records
    #[sea_orm(unique)]
    pub hotlink_id: Option<String>,

    /// Whether the stored bytes are ciphertext
    pub is_encrypted: bool,

    /// At-rest decryption key; only present for server-managed encryption
    pub decryption_key: Option<Vec<u8>>,

    /// Nonce paired with the decryption key
    pub nonce: Option<Vec<u8>>,

    /// Bucket identifier; None means local filesystem storage
    pub bucket: Option<String>,

    /// Location token the owning backend uses to fetch the bytes
    pub storage_key: String,

    /// Owning user
    pub user_id: i64,

    /// When the file was uploaded
    pub created_at: ChronoDateTimeUtc,

    /// Completed downloads, monotonically increasing
    #[sea_orm(default_value = 0)]
    pub download_count: i32,

    /// When physical deletion is due; None means not pending deletion
    pub pending_deletion_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        Self {
            created_at: Set(chrono::Utc::now()),
            ..ActiveModelTrait::default()
        }
    }
}

impl Model {
    /// Check if the file's absolute expiry time has passed
    pub fn is_time_expired(&self) -> bool {
        if let Some(expires_at) = self.expires_at {
            chrono::Utc::now() > expires_at
        } else {
            false
        }
    }

    /// Check if the download counter has been exhausted
    pub fn is_download_exhausted(&self) -> bool {
        matches!(self.downloads_remaining, Some(remaining) if remaining <= 0)
    }

    /// Check if either expiry condition has been met
    pub fn is_expired(&self) -> bool {
        self.is_time_expired() || self.is_download_exhausted()
    }

    pub fn is_pending_deletion(&self) -> bool {
        self.pending_deletion_at.is_some()
    }

    pub fn is_local_storage(&self) -> bool {
        self.bucket.is_none()
    }

    /// End-to-end uploads are encrypted but the server holds no key
    pub fn is_end_to_end_encrypted(&self) -> bool {
        self.is_encrypted && self.decryption_key.is_none()
    }

    pub fn is_password_protected(&self) -> bool {
        self.password_hash.is_some()
    }
}
