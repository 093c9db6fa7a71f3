use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sea_orm::DbErr),

    #[error("File not found")]
    FileNotFound,

    #[error("File expired")]
    FileExpired,

    #[error("Password required")]
    PasswordRequired,

    #[error("Incorrect password")]
    IncorrectPassword,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Upload session not found")]
    SessionNotFound,

    #[error("Duplicate chunk")]
    DuplicateChunk,

    #[error("Finalize already in progress")]
    FinalizeInProgress,

    #[error("Size mismatch: {0}")]
    SizeMismatch(String),

    #[error("Staging storage full")]
    StorageFull,

    #[error("Integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("Encryption failure: {0}")]
    EncryptionFailure(#[from] beppu_encrypt::CipherError),

    #[error("Backend write failure: {0}")]
    BackendWriteFailure(String),

    #[error("Metadata write failure: {0}")]
    MetadataWriteFailure(String),

    #[error("File too large")]
    FileTooLarge,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::FileNotFound => (StatusCode::NOT_FOUND, "File not found"),
            AppError::FileExpired => (StatusCode::GONE, "File has expired"),
            AppError::PasswordRequired => (StatusCode::UNAUTHORIZED, "Password required"),
            AppError::IncorrectPassword => (StatusCode::UNAUTHORIZED, "Incorrect password"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            AppError::SessionNotFound => (StatusCode::NOT_FOUND, "Upload session not found"),
            AppError::DuplicateChunk => (StatusCode::CONFLICT, "Chunk already received"),
            AppError::FinalizeInProgress => {
                (StatusCode::CONFLICT, "Finalize already in progress")
            }
            AppError::SizeMismatch(_) => (StatusCode::BAD_REQUEST, "Size mismatch"),
            AppError::StorageFull => (StatusCode::INSUFFICIENT_STORAGE, "Staging storage full"),
            AppError::FileTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "File too large"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad request"),
            AppError::IntegrityMismatch(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "Integrity mismatch")
            }
            AppError::EncryptionFailure(_) => {
                tracing::error!("Encryption failure: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "Encryption failure")
            }
            AppError::BackendWriteFailure(_) => {
                tracing::error!("Backend write failure: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "Backend write failure")
            }
            AppError::MetadataWriteFailure(_) => {
                tracing::error!("Metadata write failure: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "Metadata write failure")
            }
            AppError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Configuration error"),
            AppError::DatabaseError(_) => {
                tracing::error!("Database error: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error")
            }
            AppError::IoError(_) => {
                tracing::error!("IO error: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "IO error")
            }
            AppError::ServerError(_) => {
                tracing::error!("Server error: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "Server error")
            }
        };

        let body = Json(json!({
            "result": "error",
            "error_message": error_message,
            "detail": self.to_string()
        }));

        (status, body).into_response()
    }
}
