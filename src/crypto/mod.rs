//! Cryptographic key handling and signature recovery.

pub mod keypair;

pub use keypair::{recover_signer, Algorithm, CryptoError, PrivateKey, PublicKey};
