//! 24-byte tagged account addresses derived from public keys.

use crate::crypto::PublicKey;
use crate::types::hash::{Hash, HASH_LEN};
use std::fmt;
use thiserror::Error;

/// Fixed address length in bytes: a 1-byte type tag plus 23 digest bytes.
pub const ADDRESS_LEN: usize = 24;

const USER_PREFIX: u8 = 0x57;
const CONTRACT_PREFIX: u8 = 0x58;

/// Distinguishes externally controlled accounts from deployed contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    User,
    Contract,
}

/// Errors produced when parsing address bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid address length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("unknown address type tag: {0:#04x}")]
    UnknownTypeTag(u8),
}

/// Fixed-size account identifier.
///
/// The first byte is a type tag (user or contract), the remaining 23 bytes
/// are the tail of a SHA3-256 digest. This type is `Copy` for efficient
/// passing in validation and lookup operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    /// Derives a user address from a public key.
    ///
    /// The digest covers the uncompressed SEC1 encoding of the key; the
    /// address keeps the trailing 23 bytes behind the user tag.
    pub fn from_public_key(key: &PublicKey) -> Address {
        let digest = Hash::sha3().chain(&key.to_bytes()).finalize();
        Self::from_digest(USER_PREFIX, digest)
    }

    /// Derives a contract address from the deployer and its nonce.
    ///
    /// Digest layout: `sha3_256(from_bytes || nonce_big_endian)`.
    pub fn for_contract(from: &Address, nonce: u64) -> Address {
        let mut h = Hash::sha3();
        h.update(from.as_slice());
        h.update(&nonce.to_be_bytes());
        Self::from_digest(CONTRACT_PREFIX, h.finalize())
    }

    /// The all-zero user address, used as the genesis coinbase.
    pub const fn zero_user() -> Address {
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes[0] = USER_PREFIX;
        Address(bytes)
    }

    fn from_digest(tag: u8, digest: Hash) -> Address {
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes[0] = tag;
        bytes[1..].copy_from_slice(&digest.as_slice()[HASH_LEN - (ADDRESS_LEN - 1)..]);
        Address(bytes)
    }

    /// Parses an address from raw bytes, validating length and type tag.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Address, AddressError> {
        if bytes.len() != ADDRESS_LEN {
            return Err(AddressError::InvalidLength {
                expected: ADDRESS_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != USER_PREFIX && bytes[0] != CONTRACT_PREFIX {
            return Err(AddressError::UnknownTypeTag(bytes[0]));
        }

        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(bytes);
        Ok(Address(out))
    }

    /// Returns the type encoded in the tag byte.
    pub fn address_type(&self) -> Result<AddressType, AddressError> {
        match self.0[0] {
            USER_PREFIX => Ok(AddressType::User),
            CONTRACT_PREFIX => Ok(AddressType::Contract),
            other => Err(AddressError::UnknownTypeTag(other)),
        }
    }

    /// Returns the address as a byte slice.
    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Copies the address into a new byte vector.
    pub fn to_vec(self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
