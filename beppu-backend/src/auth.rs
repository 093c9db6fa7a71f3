use crate::error::{AppError, Result};
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;

pub const SESSION_COOKIE: &str = "session_token";
pub const API_KEY_HEADER: &str = "apikey";

/// How the caller entered the system; drives the credential precedence in
/// the download gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessScope {
    /// Browser-facing routes (`/d`, `/dh`)
    Web,
    /// `/api` routes; only an API key satisfies these
    Api,
    /// Hotlink routes; bypass session and API key entirely
    Hotlink,
}

/// Everything a request presented that could authorize it.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub session_token: Option<String>,
    pub api_key: Option<String>,
    /// Freshly submitted file password
    pub password: Option<String>,
    /// Value of the per-file password cookie, if present
    pub password_cookie: Option<String>,
}

impl Credentials {
    /// Pull session token, API key and the per-file password cookie out of
    /// the request headers. `file_id` selects which `p<id>` cookie applies.
    pub fn from_headers(headers: &HeaderMap, file_id: Option<&str>) -> Self {
        let api_key = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let session_token = cookie_value(headers, SESSION_COOKIE);
        let password_cookie =
            file_id.and_then(|id| cookie_value(headers, &format!("p{}", id)));

        Self {
            session_token,
            api_key,
            password: None,
            password_cookie,
        }
    }
}

/// Extract one value from the Cookie header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiKeyCapabilities {
    pub upload: bool,
    pub list: bool,
    pub download: bool,
}

impl ApiKeyCapabilities {
    pub fn full() -> Self {
        Self {
            upload: true,
            list: true,
            download: true,
        }
    }
}

struct ApiKeyEntry {
    user_id: i64,
    capabilities: ApiKeyCapabilities,
}

/// Registry of issued API keys. Key generation and distribution live
/// outside this subsystem; the gate only needs verification.
pub struct ApiKeyRegistry {
    keys: RwLock<HashMap<String, ApiKeyEntry>>,
}

impl Default for ApiKeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiKeyRegistry {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: impl Into<String>, user_id: i64, capabilities: ApiKeyCapabilities) {
        self.keys
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.into(), ApiKeyEntry {
                user_id,
                capabilities,
            });
    }

    /// Verify a key and return its owning user if it grants `wants`.
    pub fn verify(
        &self,
        key: &str,
        wants: impl Fn(&ApiKeyCapabilities) -> bool,
    ) -> Option<i64> {
        let keys = self
            .keys
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        keys.get(key)
            .filter(|entry| wants(&entry.capabilities))
            .map(|entry| entry.user_id)
    }
}

/// Registry of live login sessions. Issuing and renewing sessions is the
/// login layer's business; requests here only present the token.
pub struct SessionRegistry {
    tokens: RwLock<HashMap<String, i64>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, token: impl Into<String>, user_id: i64) {
        self.tokens
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(token.into(), user_id);
    }

    pub fn verify(&self, token: &str) -> Option<i64> {
        self.tokens
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(token)
            .copied()
    }

    pub fn revoke(&self, token: &str) {
        self.tokens
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(token);
    }
}

/// Hash a file password for storage.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::ServerError(format!("Failed to hash password: {}", e)))?;
    Ok(hash.to_string())
}

/// Verify a submitted password against the stored hash.
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(password_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Server-held proof that a correct password was submitted for this exact
/// file. Stored in the `p<file_id>` cookie; bound to the file id so a
/// cookie for one file proves nothing about another.
pub fn password_proof(password_hash: &str, file_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password_hash.as_bytes());
    hasher.update(b":");
    hasher.update(file_id.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_password_hash_round_trip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        assert!(!verify_password("hunter2", "not-a-phc-string"));
    }

    #[test]
    fn test_password_proof_is_file_bound() {
        let hash = hash_password("secret").unwrap();
        let proof_a = password_proof(&hash, "fileA");
        let proof_b = password_proof(&hash, "fileB");
        assert_ne!(proof_a, proof_b);
        assert_eq!(proof_a, password_proof(&hash, "fileA"));
    }

    #[test]
    fn test_api_key_capabilities() {
        let registry = ApiKeyRegistry::new();
        registry.insert("fullkey", 1, ApiKeyCapabilities::full());
        registry.insert(
            "listonly",
            2,
            ApiKeyCapabilities {
                upload: false,
                list: true,
                download: false,
            },
        );

        assert_eq!(registry.verify("fullkey", |c| c.upload), Some(1));
        assert_eq!(registry.verify("listonly", |c| c.list), Some(2));
        assert_eq!(registry.verify("listonly", |c| c.download), None);
        assert_eq!(registry.verify("unknown", |c| c.list), None);
    }

    #[test]
    fn test_session_registry() {
        let sessions = SessionRegistry::new();
        sessions.insert("validsession", 7);

        assert_eq!(sessions.verify("validsession"), Some(7));
        assert_eq!(sessions.verify("invalid"), None);

        sessions.revoke("validsession");
        assert_eq!(sessions.verify("validsession"), None);
    }

    #[test]
    fn test_credentials_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("validkey"));
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("session_token=abc; pfile1=proofvalue"),
        );

        let creds = Credentials::from_headers(&headers, Some("file1"));
        assert_eq!(creds.api_key.as_deref(), Some("validkey"));
        assert_eq!(creds.session_token.as_deref(), Some("abc"));
        assert_eq!(creds.password_cookie.as_deref(), Some("proofvalue"));

        let other = Credentials::from_headers(&headers, Some("file2"));
        assert_eq!(other.password_cookie, None);
    }
}
