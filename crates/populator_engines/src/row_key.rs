#![forbid(unsafe_code)]

use populator_contracts::row::{AddressingMode, LogicalId, RowKey, CHECKSUM_PREFIX_LEN};
use populator_contracts::ContractViolation;
use rand::{Rng, RngCore};

/// CRC32 (IEEE, seed 0) of the id's canonical JSON form.
pub fn logical_id_checksum(id: &LogicalId) -> u32 {
    crc32fast::hash(id.canonical_json().as_bytes())
}

pub fn derive_row_key(id: &LogicalId, mode: AddressingMode) -> Result<RowKey, ContractViolation> {
    derive_row_key_with_rng(id, mode, &mut rand::thread_rng())
}

pub fn derive_row_key_with_rng<R: RngCore + ?Sized>(
    id: &LogicalId,
    mode: AddressingMode,
    rng: &mut R,
) -> Result<RowKey, ContractViolation> {
    let bytes = match mode {
        AddressingMode::Checksum => {
            let canonical = id.canonical_json();
            let mut out = Vec::with_capacity(CHECKSUM_PREFIX_LEN + canonical.len());
            out.extend_from_slice(&crc32fast::hash(canonical.as_bytes()).to_be_bytes());
            out.extend_from_slice(canonical.as_bytes());
            out
        }
        AddressingMode::Salt => {
            let natural = id.natural_form();
            let mut out = Vec::with_capacity(1 + natural.len());
            out.push(rng.gen::<u8>());
            out.extend_from_slice(natural.as_bytes());
            out
        }
        AddressingMode::Identity => id.natural_form().into_bytes(),
    };
    RowKey::from_bytes(bytes)
}

/// Length of the addressing prefix in front of the logical id bytes.
pub fn prefix_len(mode: AddressingMode) -> usize {
    match mode {
        AddressingMode::Checksum => CHECKSUM_PREFIX_LEN,
        AddressingMode::Salt => 1,
        AddressingMode::Identity => 0,
    }
}
