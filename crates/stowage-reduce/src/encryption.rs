//! AES-256-GCM and ChaCha20-Poly1305 AEAD sealing with HKDF key derivation
//!
//! The repository master key is derived from the password, salted with the
//! repository's unique id. Chunks are sealed under per-chunk keys derived
//! from the master key and the chunk hash; repository documents (manifests,
//! index deltas, maintenance parameters) under a single document key.

use crate::error::ReduceError;
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

const MASTER_KEY_INFO: &[u8] = b"stowage-master-key";
const CHUNK_KEY_INFO: &[u8] = b"stowage-chunk-key";

/// 256-bit (32-byte) encryption key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// 96-bit (12-byte) nonce for AEAD ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce(pub [u8; 12]);

/// AEAD cipher selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM, the repository default
    #[default]
    AesGcm256,
    /// ChaCha20-Poly1305 for hosts without AES acceleration
    ChaCha20Poly1305,
}

/// Sealed payload: ciphertext (with 16-byte auth tag), nonce, algorithm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedChunk {
    /// Ciphertext with 16-byte AEAD authentication tag appended
    pub ciphertext: Vec<u8>,
    /// Nonce used for this encryption operation
    pub nonce: Nonce,
    /// Algorithm (needed for decryption)
    pub algo: EncryptionAlgorithm,
}

fn hkdf_expand(ikm: &[u8], salt: Option<&[u8]>, info: &[&[u8]]) -> Result<EncryptionKey, ReduceError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; 32];
    hk.expand_multi_info(info, &mut okm)
        .map_err(|e| ReduceError::EncryptionFailed(format!("HKDF expand failed: {e}")))?;
    Ok(EncryptionKey(okm))
}

/// Derive the repository master key from the password and the repository's unique id
pub fn derive_master_key(password: &[u8], repo_id: &[u8]) -> Result<EncryptionKey, ReduceError> {
    hkdf_expand(password, Some(repo_id), &[MASTER_KEY_INFO])
}

/// Derive a sub-key of the master key for a named purpose
pub fn derive_purpose_key(master_key: &EncryptionKey, purpose: &str) -> Result<EncryptionKey, ReduceError> {
    hkdf_expand(&master_key.0, None, &[b"stowage-purpose:", purpose.as_bytes()])
}

/// Derive a per-chunk key from master key + chunk hash using HKDF-SHA256
pub fn derive_chunk_key(master_key: &EncryptionKey, chunk_hash: &[u8; 32]) -> Result<EncryptionKey, ReduceError> {
    hkdf_expand(&master_key.0, None, &[CHUNK_KEY_INFO, chunk_hash])
}

/// Generate a cryptographically random 12-byte nonce
pub fn random_nonce() -> Nonce {
    use rand::RngCore;
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    Nonce(bytes)
}

/// Encrypt plaintext. A random nonce is generated and stored in the result.
pub fn encrypt(
    plaintext: &[u8],
    key: &EncryptionKey,
    algo: EncryptionAlgorithm,
) -> Result<EncryptedChunk, ReduceError> {
    let nonce = random_nonce();
    let ciphertext = match algo {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            let n = aes_gcm::Nonce::from_slice(&nonce.0);
            cipher
                .encrypt(n, plaintext)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            let n = chacha20poly1305::Nonce::from_slice(&nonce.0);
            cipher
                .encrypt(n, plaintext)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?
        }
    };
    Ok(EncryptedChunk {
        ciphertext,
        nonce,
        algo,
    })
}

/// Decrypt an EncryptedChunk. Returns DecryptionAuthFailed if tampered/corrupted.
pub fn decrypt(chunk: &EncryptedChunk, key: &EncryptionKey) -> Result<Vec<u8>, ReduceError> {
    match chunk.algo {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            let n = aes_gcm::Nonce::from_slice(&chunk.nonce.0);
            cipher
                .decrypt(n, chunk.ciphertext.as_ref())
                .map_err(|_| ReduceError::DecryptionAuthFailed)
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            let n = chacha20poly1305::Nonce::from_slice(&chunk.nonce.0);
            cipher
                .decrypt(n, chunk.ciphertext.as_ref())
                .map_err(|_| ReduceError::DecryptionAuthFailed)
        }
    }
}

/// Serialize a document as JSON and seal it; the result is bincode bytes.
pub fn seal_document<T: Serialize>(
    value: &T,
    key: &EncryptionKey,
    algo: EncryptionAlgorithm,
) -> Result<Vec<u8>, ReduceError> {
    let json = serde_json::to_vec(value)?;
    let sealed = encrypt(&json, key, algo)?;
    Ok(bincode::serialize(&sealed)?)
}

/// Reverse of [`seal_document`].
pub fn open_document<T: DeserializeOwned>(bytes: &[u8], key: &EncryptionKey) -> Result<T, ReduceError> {
    let sealed: EncryptedChunk = bincode::deserialize(bytes)?;
    let json = decrypt(&sealed, key)?;
    Ok(serde_json::from_slice(&json)?)
}
