// Key derivation — passphrase to layer key, and group fingerprints

use super::cipher::{CipherError, KEY_SIZES};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Default PBKDF2 iteration count
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Derive a cipher key of `key_size` bytes with PBKDF2-HMAC-SHA256.
pub fn derive_key(
    passphrase: &str,
    salt: &[u8],
    iterations: u32,
    key_size: usize,
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    if !KEY_SIZES.contains(&key_size) {
        return Err(CipherError::InvalidKeySize(key_size));
    }

    let mut key = Zeroizing::new(vec![0u8; key_size]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations.max(1), &mut key);
    Ok(key)
}

/// Hex SHA-256 fingerprint of arbitrary bytes.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Group id shared by every client configured with the same group passphrase.
///
/// Routers only ever see this fingerprint, never the passphrase or key.
pub fn group_id(passphrase: &str, salt: &[u8], iterations: u32) -> Result<String, CipherError> {
    let key = derive_key(passphrase, salt, iterations, 32)?;
    Ok(fingerprint(&key))
}
