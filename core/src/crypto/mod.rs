// Cryptography module — block cipher layers, cipher chains and key derivation

pub mod chain;
pub mod cipher;
pub mod kdf;

pub use chain::CipherChain;
pub use cipher::{create, Cipher, CipherAlgorithm, CipherError, CipherLayer};
pub use kdf::{derive_key, fingerprint, group_id};

use rand::RngCore;

/// Fill a fresh buffer from the OS random source.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}
