#![forbid(unsafe_code)]

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::common::validate_token;
use crate::{ContractViolation, Validate};

pub const AES_KEY_LENGTHS: [usize; 3] = [16, 24, 32];

/// Data-encryption key triple issued once per run.
///
/// The plaintext key arrives base64-encoded and is decoded here, once; every
/// consumer sees raw key bytes. The wrapped key and the key-encryption-key id
/// are opaque to this pipeline and are copied verbatim into envelopes.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    plaintext_key: Vec<u8>,
    wrapped_key: String,
    key_encryption_key_id: String,
}

impl KeyMaterial {
    pub fn v1(
        plaintext_key_b64: &str,
        wrapped_key: String,
        key_encryption_key_id: String,
    ) -> Result<Self, ContractViolation> {
        let plaintext_key = BASE64
            .decode(plaintext_key_b64.trim().as_bytes())
            .map_err(|_| ContractViolation::InvalidValue {
                field: "key_material.plaintext_key",
                reason: "must be valid base64",
            })?;
        let material = Self {
            plaintext_key,
            wrapped_key,
            key_encryption_key_id,
        };
        material.validate()?;
        Ok(material)
    }

    pub fn plaintext_key(&self) -> &[u8] {
        &self.plaintext_key
    }

    pub fn wrapped_key(&self) -> &str {
        &self.wrapped_key
    }

    pub fn key_encryption_key_id(&self) -> &str {
        &self.key_encryption_key_id
    }
}

impl Validate for KeyMaterial {
    fn validate(&self) -> Result<(), ContractViolation> {
        if !AES_KEY_LENGTHS.contains(&self.plaintext_key.len()) {
            return Err(ContractViolation::InvalidValue {
                field: "key_material.plaintext_key",
                reason: "must decode to 16, 24, or 32 bytes",
            });
        }
        validate_token("key_material.wrapped_key", &self.wrapped_key, 4096)?;
        validate_token(
            "key_material.key_encryption_key_id",
            &self.key_encryption_key_id,
            2048,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("plaintext_key", &"[REDACTED]")
            .field("wrapped_key", &self.wrapped_key)
            .field("key_encryption_key_id", &self.key_encryption_key_id)
            .finish()
    }
}
