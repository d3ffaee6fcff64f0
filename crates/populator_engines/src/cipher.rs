#![forbid(unsafe_code)]

use aes::{Aes128, Aes192, Aes256};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;

// Full 128-bit big-endian counter: the IV is the counter's initial value.
type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

pub const IV_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncryptionError {
    #[error("data key must be 16, 24, or 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("initialisation vector must be {IV_LEN} bytes, got {0}")]
    InvalidIvLength(usize),
    #[error("base64 decode failed: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// IV and ciphertext, both base64, ready to embed in an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub initialisation_vector: String,
    pub ciphertext: String,
}

/// AES-CTR record encryption. Holds no key state; every call draws a new IV.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordEncryptor;

impl RecordEncryptor {
    pub fn new() -> Self {
        Self
    }

    pub fn encrypt(
        &self,
        key: &[u8],
        plaintext: &[u8],
    ) -> Result<EncryptedPayload, EncryptionError> {
        check_key(key)?;
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        self.encrypt_with_iv(key, &iv, plaintext)
    }

    /// Encrypts under a caller-chosen IV. The caller owns IV uniqueness.
    pub fn encrypt_with_iv(
        &self,
        key: &[u8],
        iv: &[u8; IV_LEN],
        plaintext: &[u8],
    ) -> Result<EncryptedPayload, EncryptionError> {
        let mut buf = plaintext.to_vec();
        apply_keystream(key, iv, &mut buf)?;
        Ok(EncryptedPayload {
            initialisation_vector: BASE64.encode(iv),
            ciphertext: BASE64.encode(buf),
        })
    }

    /// Reverses `encrypt`. Used to verify written rows, never on the write path.
    pub fn decrypt(
        &self,
        key: &[u8],
        initialisation_vector_b64: &str,
        ciphertext_b64: &str,
    ) -> Result<Vec<u8>, EncryptionError> {
        let iv_raw = BASE64.decode(initialisation_vector_b64.as_bytes())?;
        let iv: [u8; IV_LEN] = iv_raw
            .as_slice()
            .try_into()
            .map_err(|_| EncryptionError::InvalidIvLength(iv_raw.len()))?;
        let mut buf = BASE64.decode(ciphertext_b64.as_bytes())?;
        apply_keystream(key, &iv, &mut buf)?;
        Ok(buf)
    }
}

fn check_key(key: &[u8]) -> Result<(), EncryptionError> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        other => Err(EncryptionError::InvalidKeyLength(other)),
    }
}

fn apply_keystream(key: &[u8], iv: &[u8; IV_LEN], buf: &mut [u8]) -> Result<(), EncryptionError> {
    let bad_key = |_| EncryptionError::InvalidKeyLength(key.len());
    match key.len() {
        16 => Aes128Ctr::new_from_slices(key, iv)
            .map_err(bad_key)?
            .apply_keystream(buf),
        24 => Aes192Ctr::new_from_slices(key, iv)
            .map_err(bad_key)?
            .apply_keystream(buf),
        32 => Aes256Ctr::new_from_slices(key, iv)
            .map_err(bad_key)?
            .apply_keystream(buf),
        other => return Err(EncryptionError::InvalidKeyLength(other)),
    }
    Ok(())
}
