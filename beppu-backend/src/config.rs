use crate::error::{AppError, Result};
use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub server_address: String,
    pub storage_dir: String,
    pub base_url: String,
    pub max_file_size: usize,
    /// Total bytes the chunk staging area may hold across all sessions
    pub staging_capacity: i64,
    /// Seconds of inactivity before an unfinished upload session is reaped
    pub session_idle_secs: u64,
    /// Seconds between expiry sweeper runs
    pub sweep_interval_secs: u64,
    /// Grace window between logical expiry and physical deletion
    pub deletion_grace_secs: i64,
    /// API keys granted full capability, comma separated
    pub api_keys: Vec<String>,
    /// Bucket for remote storage, if configured
    pub bucket_name: Option<String>,
    pub bucket_region: String,
    pub bucket_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://beppu.db".to_string()),

            server_address: env::var("SERVER_ADDRESS")
                .unwrap_or_else(|_| "127.0.0.1:3000".to_string()),

            storage_dir: env::var("STORAGE_DIR").unwrap_or_else(|_| "./storage".to_string()),

            base_url: env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string()),

            max_file_size: env::var("MAX_FILE_SIZE")
                .unwrap_or_else(|_| "5000".to_string()) // Default 5GB
                .parse::<usize>()
                .map_err(|_| AppError::ConfigError("Invalid MAX_FILE_SIZE".to_string()))?
                * 1024
                * 1024, // Convert MB to bytes

            staging_capacity: env::var("STAGING_CAPACITY_MB")
                .unwrap_or_else(|_| "10000".to_string())
                .parse::<i64>()
                .map_err(|_| AppError::ConfigError("Invalid STAGING_CAPACITY_MB".to_string()))?
                * 1024
                * 1024,

            session_idle_secs: env::var("SESSION_IDLE_SECONDS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .map_err(|_| AppError::ConfigError("Invalid SESSION_IDLE_SECONDS".to_string()))?,

            sweep_interval_secs: env::var("SWEEP_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|_| AppError::ConfigError("Invalid SWEEP_INTERVAL_SECONDS".to_string()))?,

            deletion_grace_secs: env::var("DELETION_GRACE_SECONDS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .map_err(|_| AppError::ConfigError("Invalid DELETION_GRACE_SECONDS".to_string()))?,

            api_keys: env::var("API_KEYS")
                .map(|keys| {
                    keys.split(',')
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or_default(),

            bucket_name: env::var("BUCKET_NAME").ok().filter(|b| !b.is_empty()),

            bucket_region: env::var("BUCKET_REGION").unwrap_or_else(|_| "us-east-1".to_string()),

            bucket_endpoint: env::var("BUCKET_ENDPOINT").ok().filter(|e| !e.is_empty()),
        })
    }
}
