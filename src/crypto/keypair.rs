//! Recoverable ECDSA key pairs on secp256k1.
//!
//! Signatures carry a recovery id so the signer's public key (and from it the
//! signer's address) can be reconstructed from `(hash, signature)` alone.

use crate::core::address::Address;
use crate::types::hash::Hash;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;
use thiserror::Error;

/// Byte length of a recoverable signature: `r || s || recovery_id`.
pub const SIGNATURE_LEN: usize = 65;

/// Signature algorithm identifier carried in the wire `alg` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Algorithm {
    Secp256k1 = 1,
}

impl TryFrom<u32> for Algorithm {
    type Error = CryptoError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Algorithm::Secp256k1),
            other => Err(CryptoError::UnsupportedAlgorithm(other)),
        }
    }
}

/// Errors produced by signing and recovery.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid private key bytes")]
    InvalidPrivateKey,

    #[error("malformed signature")]
    InvalidSignature,

    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(u32),

    #[error("signer recovery failed")]
    RecoverFailed,
}

/// Private key for signing transactions and blocks.
///
/// Generated using cryptographically secure randomness from the OS.
/// Never serialized or transmitted over the network.
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

impl PrivateKey {
    /// Generates a new random private key using OS-provided entropy.
    pub fn new() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    /// Creates a private key from raw bytes.
    ///
    /// Returns `None` if the bytes do not represent a valid scalar for secp256k1.
    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        SigningKey::from_bytes(bytes.into())
            .ok()
            .map(|key| Self { key })
    }

    /// Derives the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: *self.key.verifying_key(),
        }
    }

    /// Signs a 32-byte prehash, producing a 65-byte recoverable signature.
    pub fn sign_hash(&self, hash: &Hash) -> Result<Vec<u8>, CryptoError> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|_| CryptoError::InvalidSignature)?;

        let mut out = Vec::with_capacity(SIGNATURE_LEN);
        out.extend_from_slice(&signature.to_bytes());
        out.push(recovery_id.to_byte());
        Ok(out)
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

/// Public key used for address derivation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    key: VerifyingKey,
}

impl PublicKey {
    /// Returns the uncompressed SEC1 encoding of the key (65 bytes).
    pub fn to_bytes(&self) -> Vec<u8> {
        self.key.to_encoded_point(false).as_bytes().to_vec()
    }

    /// Derives the user address for this key.
    pub fn address(&self) -> Address {
        Address::from_public_key(self)
    }
}

/// Recovers the signer's address from `(alg, hash, sign)`.
///
/// The signature must be the 65-byte `r || s || recovery_id` layout produced
/// by [`PrivateKey::sign_hash`].
pub fn recover_signer(alg: u32, hash: &Hash, sign: &[u8]) -> Result<Address, CryptoError> {
    Algorithm::try_from(alg)?;

    if sign.len() != SIGNATURE_LEN {
        return Err(CryptoError::InvalidSignature);
    }

    let signature =
        Signature::from_slice(&sign[..SIGNATURE_LEN - 1]).map_err(|_| CryptoError::InvalidSignature)?;
    let recovery_id = RecoveryId::from_byte(sign[SIGNATURE_LEN - 1])
        .ok_or(CryptoError::InvalidSignature)?;

    let key = VerifyingKey::recover_from_prehash(hash.as_slice(), &signature, recovery_id)
        .map_err(|_| CryptoError::RecoverFailed)?;

    Ok(PublicKey { key }.address())
}
