//! Reversible obfuscation for secret-bearing backend parameters.
//!
//! This keeps credentials from sitting in configuration in plain text. It is
//! not encryption: the key is fixed and public.

use aes::Aes256;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::{Decryptor, Encryptor};
use rand::RngCore;
use thiserror::Error;

const IV_LEN: usize = 16;

const OBSCURE_KEY: [u8; 32] = [
    0x9c, 0x93, 0x5b, 0x48, 0x73, 0x0a, 0x55, 0x4d, 0x6b, 0xfd, 0x7c, 0x63, 0xc8, 0x86, 0xa9, 0x2b,
    0xd3, 0x90, 0x19, 0x8e, 0xb8, 0x12, 0x8a, 0xfb, 0xf4, 0xde, 0x16, 0x2b, 0x8b, 0x95, 0xf6, 0x38,
];

/// Errors from revealing an obscured value.
#[derive(Debug, Error)]
pub enum ObscureError {
    /// Not valid base64.
    #[error("obscured value is not base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// Too short to contain an IV.
    #[error("obscured value too short")]
    TooShort,

    /// Revealed bytes are not UTF-8.
    #[error("revealed value is not UTF-8")]
    NotUtf8,
}

/// Obscures `plain` as `base64(iv || AES-256-CFB(plain))`.
pub fn obscure(plain: &str) -> String {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let mut buf = plain.as_bytes().to_vec();
    Encryptor::<Aes256>::new(&OBSCURE_KEY.into(), &iv.into()).encrypt(&mut buf);
    let mut out = Vec::with_capacity(IV_LEN + buf.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&buf);
    URL_SAFE_NO_PAD.encode(out)
}

/// Reverses [`obscure`].
pub fn reveal(obscured: &str) -> Result<String, ObscureError> {
    let raw = URL_SAFE_NO_PAD.decode(obscured)?;
    if raw.len() < IV_LEN {
        return Err(ObscureError::TooShort);
    }
    let (iv, cipher) = raw.split_at(IV_LEN);
    let mut buf = cipher.to_vec();
    let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| ObscureError::TooShort)?;
    Decryptor::<Aes256>::new(&OBSCURE_KEY.into(), &iv.into()).decrypt(&mut buf);
    String::from_utf8(buf).map_err(|_| ObscureError::NotUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obscure_reveal() {
        let secret = "s3cr3t/with+chars";
        let hidden = obscure(secret);
        assert_ne!(hidden, secret);
        assert_eq!(reveal(&hidden).unwrap(), secret);
    }

    #[test]
    fn test_obscure_is_randomised() {
        assert_ne!(obscure("same"), obscure("same"));
    }

    #[test]
    fn test_reveal_rejects_garbage() {
        assert!(matches!(reveal("!!"), Err(ObscureError::Encoding(_))));
        assert!(matches!(reveal("AAAA"), Err(ObscureError::TooShort)));
    }

    #[test]
    fn test_empty_value() {
        assert_eq!(reveal(&obscure("")).unwrap(), "");
    }
}
