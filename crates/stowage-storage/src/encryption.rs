//! Stream encryptors: AES-CFB with an HKDF-SHA256 derived key
//!
//! Ciphertext layout is a 16-byte random IV followed by the CFB keystream
//! applied to the plaintext, so the overhead per object is exactly the IV.

use std::io;
use std::sync::Arc;

use aes::{Aes128, Aes192, Aes256};
use async_trait::async_trait;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

/// Length of the IV prepended to every ciphertext.
pub const IV_LEN: usize = 16;

/// Algorithm used when none is named.
pub const DEFAULT_ALGORITHM: &str = "AES-256-CFB";

const BUFFER_SIZE: usize = 128 * 1024;
const DERIVED_KEY_LEN: usize = 32;
const KEY_PURPOSE: &[u8] = b"encryption";

/// Errors from stream encryption.
#[derive(Debug, Error)]
pub enum EncryptionError {
    /// No encryptor is registered under that name.
    #[error("unknown encryption algorithm {0:?}")]
    UnknownAlgorithm(String),

    /// An empty passphrase was supplied.
    #[error("encryption passphrase must not be empty")]
    EmptyPassphrase,

    /// HKDF expansion failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// The cipher rejected the key or IV.
    #[error("cipher initialisation failed: {0}")]
    Cipher(String),

    /// The ciphertext ended before a full IV was read.
    #[error("ciphertext truncated: missing initialisation vector")]
    MissingIv,

    /// Reading the input stream failed.
    #[error("reading {what} failed: {source}")]
    Read {
        /// Which stream was being read.
        what: &'static str,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Writing the output stream failed.
    #[error("writing {what} failed: {source}")]
    Write {
        /// Which stream was being written.
        what: &'static str,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Encrypts and decrypts whole byte streams.
#[async_trait]
pub trait StreamEncryptor: Send + Sync + 'static {
    /// Reads plaintext until EOF and writes ciphertext.
    async fn encrypt_stream(
        &self,
        plain: &mut (dyn AsyncRead + Send + Unpin),
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), EncryptionError>;

    /// Reads ciphertext until EOF and writes plaintext.
    async fn decrypt_stream(
        &self,
        cipher: &mut (dyn AsyncRead + Send + Unpin),
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), EncryptionError>;

    /// Bytes added to each object by encryption.
    fn overhead(&self) -> u64;

    /// Canonical algorithm name.
    fn algorithm(&self) -> &'static str;
}

/// AES key sizes supported by the CFB encryptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesKeySize {
    /// 16-byte key.
    Aes128,
    /// 24-byte key.
    Aes192,
    /// 32-byte key.
    Aes256,
}

impl AesKeySize {
    /// Key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    fn algorithm(self) -> &'static str {
        match self {
            Self::Aes128 => "AES-128-CFB",
            Self::Aes192 => "AES-192-CFB",
            Self::Aes256 => "AES-256-CFB",
        }
    }
}

enum CfbEncrypt {
    Aes128(BufEncryptor<Aes128>),
    Aes192(BufEncryptor<Aes192>),
    Aes256(BufEncryptor<Aes256>),
}

enum CfbDecrypt {
    Aes128(BufDecryptor<Aes128>),
    Aes192(BufDecryptor<Aes192>),
    Aes256(BufDecryptor<Aes256>),
}

fn cipher_err(err: impl std::fmt::Display) -> EncryptionError {
    EncryptionError::Cipher(err.to_string())
}

impl CfbEncrypt {
    fn new(size: AesKeySize, key: &[u8], iv: &[u8]) -> Result<Self, EncryptionError> {
        Ok(match size {
            AesKeySize::Aes128 => Self::Aes128(BufEncryptor::new_from_slices(key, iv).map_err(cipher_err)?),
            AesKeySize::Aes192 => Self::Aes192(BufEncryptor::new_from_slices(key, iv).map_err(cipher_err)?),
            AesKeySize::Aes256 => Self::Aes256(BufEncryptor::new_from_slices(key, iv).map_err(cipher_err)?),
        })
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Self::Aes128(c) => c.encrypt(buf),
            Self::Aes192(c) => c.encrypt(buf),
            Self::Aes256(c) => c.encrypt(buf),
        }
    }
}

impl CfbDecrypt {
    fn new(size: AesKeySize, key: &[u8], iv: &[u8]) -> Result<Self, EncryptionError> {
        Ok(match size {
            AesKeySize::Aes128 => Self::Aes128(BufDecryptor::new_from_slices(key, iv).map_err(cipher_err)?),
            AesKeySize::Aes192 => Self::Aes192(BufDecryptor::new_from_slices(key, iv).map_err(cipher_err)?),
            AesKeySize::Aes256 => Self::Aes256(BufDecryptor::new_from_slices(key, iv).map_err(cipher_err)?),
        })
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Self::Aes128(c) => c.decrypt(buf),
            Self::Aes192(c) => c.decrypt(buf),
            Self::Aes256(c) => c.decrypt(buf),
        }
    }
}

/// Derives `len` bytes of key material from a passphrase with HKDF-SHA256.
pub fn derive_key(passphrase: &[u8], purpose: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>, EncryptionError> {
    let hk = Hkdf::<Sha256>::new(Some(purpose), passphrase);
    let mut okm = Zeroizing::new(vec![0u8; len]);
    hk.expand(&[], &mut okm)
        .map_err(|e| EncryptionError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

/// AES in CFB mode over a whole stream.
pub struct AesCfbEncryptor {
    size: AesKeySize,
    key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for AesCfbEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCfbEncryptor")
            .field("algorithm", &self.size.algorithm())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl AesCfbEncryptor {
    /// Derives the key from `passphrase`.
    pub fn new(size: AesKeySize, passphrase: &[u8]) -> Result<Self, EncryptionError> {
        if passphrase.is_empty() {
            return Err(EncryptionError::EmptyPassphrase);
        }
        let mut key = derive_key(passphrase, KEY_PURPOSE, DERIVED_KEY_LEN)?;
        key.truncate(size.key_len());
        Ok(Self { size, key })
    }

    /// The key size in use.
    pub fn key_size(&self) -> AesKeySize {
        self.size
    }
}

async fn transform_stream(
    input: &mut (dyn AsyncRead + Send + Unpin),
    input_name: &'static str,
    out: &mut (dyn AsyncWrite + Send + Unpin),
    output_name: &'static str,
    mut apply: impl FnMut(&mut [u8]) + Send,
) -> Result<(), EncryptionError> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = input.read(&mut buf).await.map_err(|source| EncryptionError::Read {
            what: input_name,
            source,
        })?;
        if n == 0 {
            break;
        }
        apply(&mut buf[..n]);
        out.write_all(&buf[..n])
            .await
            .map_err(|source| EncryptionError::Write {
                what: output_name,
                source,
            })?;
    }
    out.flush().await.map_err(|source| EncryptionError::Write {
        what: output_name,
        source,
    })
}

#[async_trait]
impl StreamEncryptor for AesCfbEncryptor {
    async fn encrypt_stream(
        &self,
        plain: &mut (dyn AsyncRead + Send + Unpin),
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), EncryptionError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let mut cipher = CfbEncrypt::new(self.size, &self.key, &iv)?;
        out.write_all(&iv)
            .await
            .map_err(|source| EncryptionError::Write {
                what: "ciphertext",
                source,
            })?;
        transform_stream(plain, "plaintext", out, "ciphertext", |buf| cipher.apply(buf)).await
    }

    async fn decrypt_stream(
        &self,
        cipher: &mut (dyn AsyncRead + Send + Unpin),
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), EncryptionError> {
        let mut iv = [0u8; IV_LEN];
        cipher.read_exact(&mut iv).await.map_err(|source| {
            if source.kind() == io::ErrorKind::UnexpectedEof {
                EncryptionError::MissingIv
            } else {
                EncryptionError::Read {
                    what: "ciphertext",
                    source,
                }
            }
        })?;
        let mut state = CfbDecrypt::new(self.size, &self.key, &iv)?;
        transform_stream(cipher, "ciphertext", out, "plaintext", |buf| state.apply(buf)).await
    }

    fn overhead(&self) -> u64 {
        IV_LEN as u64
    }

    fn algorithm(&self) -> &'static str {
        self.size.algorithm()
    }
}

/// Names accepted by [`create_encryptor`].
pub fn supported_algorithms() -> Vec<&'static str> {
    vec!["AES-128-CFB", "AES-192-CFB", "AES-256-CFB"]
}

/// Looks up an encryptor by name (case-insensitive, dashes and underscores
/// optional) and keys it with `passphrase`.
pub fn create_encryptor(
    algorithm: &str,
    passphrase: &[u8],
) -> Result<Arc<dyn StreamEncryptor>, EncryptionError> {
    let canonical: String = algorithm
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .collect::<String>()
        .to_ascii_uppercase();
    let size = match canonical.as_str() {
        "AES128CFB" => AesKeySize::Aes128,
        "AES192CFB" => AesKeySize::Aes192,
        "AES256CFB" => AesKeySize::Aes256,
        _ => return Err(EncryptionError::UnknownAlgorithm(algorithm.to_string())),
    };
    Ok(Arc::new(AesCfbEncryptor::new(size, passphrase)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    async fn encrypt(enc: &dyn StreamEncryptor, plain: &[u8]) -> Vec<u8> {
        let mut input = plain;
        let mut out = Vec::new();
        enc.encrypt_stream(&mut input, &mut out).await.unwrap();
        out
    }

    async fn decrypt(enc: &dyn StreamEncryptor, cipher: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let mut input = cipher;
        let mut out = Vec::new();
        enc.decrypt_stream(&mut input, &mut out).await?;
        Ok(out)
    }

    #[test]
    fn test_registry_names() {
        for name in ["AES-256-CFB", "aes256cfb", "Aes_192_Cfb", "aes-128-cfb"] {
            assert!(create_encryptor(name, b"pw").is_ok(), "{name}");
        }
        assert_eq!(create_encryptor("aes256cfb", b"pw").unwrap().algorithm(), "AES-256-CFB");
        assert!(matches!(
            create_encryptor("rot13", b"pw"),
            Err(EncryptionError::UnknownAlgorithm(_))
        ));
        assert!(matches!(
            create_encryptor(DEFAULT_ALGORITHM, b""),
            Err(EncryptionError::EmptyPassphrase)
        ));
        assert_eq!(supported_algorithms().len(), 3);
    }

    #[test]
    fn test_key_lengths() {
        for size in [AesKeySize::Aes128, AesKeySize::Aes192, AesKeySize::Aes256] {
            let enc = AesCfbEncryptor::new(size, b"passphrase").unwrap();
            assert_eq!(enc.key.len(), size.key_len());
        }
    }

    #[test]
    fn test_derive_key_is_deterministic_prefix() {
        let a = derive_key(b"pw", KEY_PURPOSE, 32).unwrap();
        let b = derive_key(b"pw", KEY_PURPOSE, 16).unwrap();
        assert_eq!(&a[..16], &b[..]);
        let c = derive_key(b"other", KEY_PURPOSE, 32).unwrap();
        assert_ne!(&a[..], &c[..]);
    }

    #[tokio::test]
    async fn test_round_trip_all_sizes() {
        let plain: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        for name in supported_algorithms() {
            let enc = create_encryptor(name, b"secret").unwrap();
            let cipher = encrypt(enc.as_ref(), &plain).await;
            assert_eq!(cipher.len() as u64, plain.len() as u64 + enc.overhead());
            assert_ne!(&cipher[IV_LEN..IV_LEN + 64], &plain[..64]);
            assert_eq!(decrypt(enc.as_ref(), &cipher).await.unwrap(), plain);
        }
    }

    #[tokio::test]
    async fn test_fresh_iv_each_time() {
        let enc = create_encryptor(DEFAULT_ALGORITHM, b"k").unwrap();
        let a = encrypt(enc.as_ref(), b"same payload").await;
        let b = encrypt(enc.as_ref(), b"same payload").await;
        assert_ne!(a, b);
        assert_ne!(a[..IV_LEN], b[..IV_LEN]);
    }

    #[tokio::test]
    async fn test_wrong_passphrase_garbles() {
        let right = create_encryptor(DEFAULT_ALGORITHM, b"right").unwrap();
        let wrong = create_encryptor(DEFAULT_ALGORITHM, b"wrong").unwrap();
        let cipher = encrypt(right.as_ref(), b"confidential data").await;
        assert_ne!(decrypt(wrong.as_ref(), &cipher).await.unwrap(), b"confidential data");
    }

    #[tokio::test]
    async fn test_truncated_iv() {
        let enc = create_encryptor(DEFAULT_ALGORITHM, b"k").unwrap();
        assert!(matches!(
            decrypt(enc.as_ref(), &[1, 2, 3]).await,
            Err(EncryptionError::MissingIv)
        ));
    }

    #[tokio::test]
    async fn test_empty_plaintext() {
        let enc = create_encryptor(DEFAULT_ALGORITHM, b"k").unwrap();
        let cipher = encrypt(enc.as_ref(), b"").await;
        assert_eq!(cipher.len(), IV_LEN);
        assert!(decrypt(enc.as_ref(), &cipher).await.unwrap().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn prop_round_trip(plain in proptest::collection::vec(any::<u8>(), 0..4096), pass in "[ -~]{1,24}") {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let enc = create_encryptor(DEFAULT_ALGORITHM, pass.as_bytes()).unwrap();
                let cipher = encrypt(enc.as_ref(), &plain).await;
                prop_assert_eq!(decrypt(enc.as_ref(), &cipher).await.unwrap(), plain.clone());
                Ok(())
            })?;
        }
    }
}
