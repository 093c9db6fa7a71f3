use serde::{Deserialize, Serialize};

/// Phase codes published on the upload status feed.
///
/// The numeric values are part of the wire contract: clients watch the SSE
/// feed and switch on `upload_status`.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(into = "u8", try_from = "u8")]
pub enum UploadPhase {
    Queued,
    Assembling,
    Encrypting,
    Writing,
    Finished,
    Failed,
}

impl UploadPhase {
    /// True once no further events will follow for this session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadPhase::Finished | UploadPhase::Failed)
    }

    pub fn as_code(&self) -> u8 {
        match self {
            UploadPhase::Queued => 0,
            UploadPhase::Assembling => 1,
            UploadPhase::Encrypting => 2,
            UploadPhase::Writing => 3,
            UploadPhase::Finished => 4,
            UploadPhase::Failed => 5,
        }
    }
}

impl From<UploadPhase> for u8 {
    fn from(phase: UploadPhase) -> u8 {
        phase.as_code()
    }
}

impl TryFrom<u8> for UploadPhase {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(UploadPhase::Queued),
            1 => Ok(UploadPhase::Assembling),
            2 => Ok(UploadPhase::Encrypting),
            3 => Ok(UploadPhase::Writing),
            4 => Ok(UploadPhase::Finished),
            5 => Ok(UploadPhase::Failed),
            other => Err(format!("unknown upload phase code {}", other)),
        }
    }
}

/// One message on the per-session status feed.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UploadStatusEvent {
    pub event: String,
    pub chunk_id: String,
    pub file_id: String,
    pub error_message: String,
    pub upload_status: UploadPhase,
}

/// How the file is encrypted at rest, chosen at finalize time.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    #[default]
    None,
    /// Server generates key and nonce at finalize and keeps both.
    ServerManaged,
    /// Client already encrypted the bytes; the server never sees a key.
    EndToEnd,
}

// Request types

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CompleteUploadRequest {
    pub session_id: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub file_size: i64,
    pub expires_in_hours: Option<i64>,
    pub max_downloads: Option<i32>,
    pub password: Option<String>,
    #[serde(default)]
    pub encryption: EncryptionMode,
    /// Target bucket identifier; empty or absent means local storage.
    pub bucket: Option<String>,
    #[serde(default)]
    pub with_hotlink: bool,
    /// When set, the request returns immediately and processing is
    /// observable on the status feed only.
    #[serde(default)]
    pub nonblocking: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PasswordSubmission {
    pub password: String,
}

// Response types

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChunkUploadResponse {
    pub result: String,
    pub received_bytes: i64,
    pub total_size: i64,
    pub complete: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CompleteUploadResponse {
    pub result: String,
    pub file: Option<FileApiOutput>,
}

/// File metadata as exposed to API consumers.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct FileApiOutput {
    pub id: String,
    pub name: String,
    pub size: String,
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub sha256: String,
    pub expire_at: Option<chrono::DateTime<chrono::Utc>>,
    pub expire_at_string: String,
    pub downloads_remaining: i32,
    pub unlimited_downloads: bool,
    pub unlimited_time: bool,
    pub download_count: i32,
    pub is_password_protected: bool,
    pub is_encrypted: bool,
    pub is_end_to_end_encrypted: bool,
    pub is_local_storage: bool,
    pub is_pending_deletion: bool,
    pub user_id: i64,
    pub hotlink_id: Option<String>,
    pub url_download: String,
    pub url_hotlink: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileListResponse {
    pub result: String,
    pub files: Vec<FileApiOutput>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ApiErrorResponse {
    pub result: String,
    pub error_message: String,
}

/// Render a byte count the way it is shown to users ("1.5 MiB").
///
/// Derived on output only; the byte count stays authoritative.
pub fn human_size(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
