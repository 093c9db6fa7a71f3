use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

pub const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key format")]
    InvalidKeyFormat,
    #[error("Invalid nonce length")]
    InvalidNonceLength,
    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),
}

/// A 256-bit at-rest key that zeroes itself when dropped.
///
/// For server-managed encryption the raw bytes are persisted alongside the
/// file record; end-to-end uploads never construct one of these on the
/// server.
#[derive(Clone, ZeroizeOnDrop, Debug)]
pub struct FileKey {
    key: [u8; 32],
}

impl FileKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Reconstruct a key from the bytes stored on a file record
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() != 32 {
            return Err(CipherError::InvalidKeyFormat);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Create a key from a URL-safe base64 string
    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let decoded = general_purpose::URL_SAFE_NO_PAD.decode(encoded)?;
        Self::from_bytes(&decoded)
    }

    /// Encode the key for URL anchors
    pub fn to_base64(&self) -> String {
        general_purpose::URL_SAFE_NO_PAD.encode(self.key)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// Ciphertext with the nonce it was sealed under
#[derive(Serialize, Deserialize, Clone)]
pub struct SealedBytes {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// AES-256-GCM seal/open for stored file content
pub struct FileCipher;

impl FileCipher {
    /// Encrypt file content under a fresh random nonce
    pub fn seal(plaintext: &[u8], key: &FileKey) -> Result<SealedBytes, CipherError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CipherError::EncryptionFailed)?;

        Ok(SealedBytes {
            ciphertext,
            nonce: nonce.to_vec(),
        })
    }

    /// Decrypt file content with the key and nonce stored on the record
    pub fn open(sealed: &SealedBytes, key: &FileKey) -> Result<Vec<u8>, CipherError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

        if sealed.nonce.len() != NONCE_LEN {
            return Err(CipherError::InvalidNonceLength);
        }
        let nonce = Nonce::from_slice(&sealed.nonce);

        cipher
            .decrypt(nonce, sealed.ciphertext.as_ref())
            .map_err(|_| CipherError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation_and_conversion() {
        let key = FileKey::generate();
        let encoded = key.to_base64();
        let restored = FileKey::from_base64(&encoded).unwrap();

        assert_eq!(key.as_bytes(), restored.as_bytes());
    }

    #[test]
    fn test_key_from_stored_bytes() {
        let key = FileKey::generate();
        let restored = FileKey::from_bytes(key.as_bytes()).unwrap();
        assert_eq!(key.as_bytes(), restored.as_bytes());

        assert!(FileKey::from_bytes(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_seal_open_round_trip() {
        let key = FileKey::generate();
        let plaintext = b"Hello, World! This is file content.";

        let sealed = FileCipher::seal(plaintext, &key).unwrap();
        let opened = FileCipher::open(&sealed, &key).unwrap();

        assert_eq!(plaintext, &opened[..]);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = FileKey::generate();
        let key2 = FileKey::generate();

        let sealed = FileCipher::seal(b"secret bytes", &key1).unwrap();
        assert!(FileCipher::open(&sealed, &key2).is_err());
    }

    #[test]
    fn test_nonce_uniqueness() {
        let key = FileKey::generate();
        let data = b"same data";

        let first = FileCipher::seal(data, &key).unwrap();
        let second = FileCipher::seal(data, &key).unwrap();

        assert_ne!(first.nonce, second.nonce);
        assert_eq!(FileCipher::open(&first, &key).unwrap(), data);
        assert_eq!(FileCipher::open(&second, &key).unwrap(), data);
    }

    #[test]
    fn test_bad_nonce_length_rejected() {
        let key = FileKey::generate();
        let mut sealed = FileCipher::seal(b"data", &key).unwrap();
        sealed.nonce.truncate(4);
        assert!(matches!(
            FileCipher::open(&sealed, &key),
            Err(CipherError::InvalidNonceLength)
        ));
    }
}
