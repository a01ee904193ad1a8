// Block cipher layer — one reversible CBC transform with its own key and IV
//
// Five interchangeable 128-bit block ciphers share one capability
// (`CipherLayer`). Without a pinned IV every encryption draws a fresh
// random IV and prepends it to the ciphertext:
//
//   [16 bytes IV][N * 16 bytes CBC/PKCS#7 ciphertext]

use aes::{Aes128, Aes192, Aes256};
use camellia::{Camellia128, Camellia192, Camellia256};
use cast6::Cast6;
use cbc::cipher::{
    block_padding::Pkcs7, BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit,
};
use rand::RngCore;
use serpent::Serpent;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use twofish::Twofish;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Block size shared by every supported algorithm (bytes)
pub const BLOCK_SIZE: usize = 16;

/// Key sizes accepted by `Cipher::set_key`
pub const KEY_SIZES: [usize; 3] = [16, 24, 32];

/// Default key size (256-bit)
pub const DEFAULT_KEY_SIZE: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Invalid key size: {0} bytes (expected 16, 24 or 32)")]
    InvalidKeySize(usize),
    #[error("Invalid IV size: {0} bytes (expected {BLOCK_SIZE})")]
    InvalidIvSize(usize),
    #[error("Unknown cipher algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("Decryption failed")]
    Decrypt,
    #[error("Cipher chain has no layer at index {0}")]
    NoSuchLayer(usize),
    #[error("Cipher chain must have at least one layer")]
    EmptyChain,
}

/// Supported block cipher algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    Aes,
    Serpent,
    Twofish,
    Camellia,
    Cast6,
}

impl CipherAlgorithm {
    pub const ALL: [CipherAlgorithm; 5] = [
        CipherAlgorithm::Aes,
        CipherAlgorithm::Serpent,
        CipherAlgorithm::Twofish,
        CipherAlgorithm::Camellia,
        CipherAlgorithm::Cast6,
    ];

    /// Resolve a case-insensitive algorithm name.
    ///
    /// Unknown names are an error; there is no silent fallback.
    pub fn from_name(name: &str) -> Result<Self, CipherError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "aes" => Ok(CipherAlgorithm::Aes),
            "serpent" => Ok(CipherAlgorithm::Serpent),
            "twofish" => Ok(CipherAlgorithm::Twofish),
            "camellia" => Ok(CipherAlgorithm::Camellia),
            "cast6" | "cast-256" | "cast256" => Ok(CipherAlgorithm::Cast6),
            _ => Err(CipherError::UnknownAlgorithm(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes => "aes",
            CipherAlgorithm::Serpent => "serpent",
            CipherAlgorithm::Twofish => "twofish",
            CipherAlgorithm::Camellia => "camellia",
            CipherAlgorithm::Cast6 => "cast6",
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

/// Capability shared by every cipher layer in a chain
pub trait CipherLayer: Send + Sync {
    /// Algorithm backing this layer
    fn algorithm(&self) -> CipherAlgorithm;

    /// Encrypt an arbitrary-length byte string
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Decrypt bytes produced by `encrypt`
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Replace the key (explicit re-keying)
    fn set_key(&mut self, key: &[u8]) -> Result<(), CipherError>;
}

/// A single keyed block cipher in CBC mode
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Cipher {
    #[zeroize(skip)]
    algorithm: CipherAlgorithm,
    key: Vec<u8>,
    iv: Option<Vec<u8>>,
}

impl Cipher {
    /// Create a cipher with the given key.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8]) -> Result<Self, CipherError> {
        check_key_size(key.len())?;
        Ok(Self {
            algorithm,
            key: key.to_vec(),
            iv: None,
        })
    }

    /// Create a cipher with a freshly generated random key.
    pub fn generate(algorithm: CipherAlgorithm, key_size: usize) -> Result<Self, CipherError> {
        check_key_size(key_size)?;
        let mut key = super::random_bytes(key_size);
        let cipher = Self::new(algorithm, &key);
        key.zeroize();
        cipher
    }

    /// Pin a fixed IV. Ciphertexts then carry no IV prefix.
    pub fn set_iv(&mut self, iv: &[u8]) -> Result<(), CipherError> {
        if iv.len() != BLOCK_SIZE {
            return Err(CipherError::InvalidIvSize(iv.len()));
        }
        self.iv = Some(iv.to_vec());
        Ok(())
    }

    /// Return to random per-message IVs.
    pub fn clear_iv(&mut self) {
        if let Some(mut iv) = self.iv.take() {
            iv.zeroize();
        }
    }

    pub fn has_iv(&self) -> bool {
        self.iv.is_some()
    }

    pub fn key_size(&self) -> usize {
        self.key.len()
    }

    fn encrypt_with_iv(&self, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let key = self.key.as_slice();
        match (self.algorithm, key.len()) {
            (CipherAlgorithm::Aes, 16) => cbc_encrypt::<Aes128>(key, iv, plaintext),
            (CipherAlgorithm::Aes, 24) => cbc_encrypt::<Aes192>(key, iv, plaintext),
            (CipherAlgorithm::Aes, _) => cbc_encrypt::<Aes256>(key, iv, plaintext),
            (CipherAlgorithm::Camellia, 16) => cbc_encrypt::<Camellia128>(key, iv, plaintext),
            (CipherAlgorithm::Camellia, 24) => cbc_encrypt::<Camellia192>(key, iv, plaintext),
            (CipherAlgorithm::Camellia, _) => cbc_encrypt::<Camellia256>(key, iv, plaintext),
            (CipherAlgorithm::Serpent, _) => cbc_encrypt::<Serpent>(key, iv, plaintext),
            (CipherAlgorithm::Twofish, _) => cbc_encrypt::<Twofish>(key, iv, plaintext),
            (CipherAlgorithm::Cast6, _) => cbc_encrypt::<Cast6>(key, iv, plaintext),
        }
    }

    fn decrypt_with_iv(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(CipherError::Decrypt);
        }

        let key = self.key.as_slice();
        match (self.algorithm, key.len()) {
            (CipherAlgorithm::Aes, 16) => cbc_decrypt::<Aes128>(key, iv, ciphertext),
            (CipherAlgorithm::Aes, 24) => cbc_decrypt::<Aes192>(key, iv, ciphertext),
            (CipherAlgorithm::Aes, _) => cbc_decrypt::<Aes256>(key, iv, ciphertext),
            (CipherAlgorithm::Camellia, 16) => cbc_decrypt::<Camellia128>(key, iv, ciphertext),
            (CipherAlgorithm::Camellia, 24) => cbc_decrypt::<Camellia192>(key, iv, ciphertext),
            (CipherAlgorithm::Camellia, _) => cbc_decrypt::<Camellia256>(key, iv, ciphertext),
            (CipherAlgorithm::Serpent, _) => cbc_decrypt::<Serpent>(key, iv, ciphertext),
            (CipherAlgorithm::Twofish, _) => cbc_decrypt::<Twofish>(key, iv, ciphertext),
            (CipherAlgorithm::Cast6, _) => cbc_decrypt::<Cast6>(key, iv, ciphertext),
        }
    }
}

impl CipherLayer for Cipher {
    fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if let Some(iv) = &self.iv {
            return self.encrypt_with_iv(iv, plaintext);
        }

        let mut iv = [0u8; BLOCK_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let body = self.encrypt_with_iv(&iv, plaintext)?;
        let mut output = Vec::with_capacity(BLOCK_SIZE + body.len());
        output.extend_from_slice(&iv);
        output.extend_from_slice(&body);
        Ok(output)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if let Some(iv) = &self.iv {
            return self.decrypt_with_iv(iv, ciphertext);
        }

        if ciphertext.len() <= BLOCK_SIZE {
            return Err(CipherError::Decrypt);
        }
        let (iv, body) = ciphertext.split_at(BLOCK_SIZE);
        self.decrypt_with_iv(iv, body)
    }

    fn set_key(&mut self, key: &[u8]) -> Result<(), CipherError> {
        check_key_size(key.len())?;
        self.key.zeroize();
        self.key = key.to_vec();
        Ok(())
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher")
            .field("algorithm", &self.algorithm)
            .field("key_size", &self.key.len())
            .field("fixed_iv", &self.iv.is_some())
            .finish()
    }
}

/// Build a cipher layer from a configured algorithm name.
pub fn create(name: &str, key: &[u8]) -> Result<Box<dyn CipherLayer>, CipherError> {
    let algorithm = CipherAlgorithm::from_name(name)?;
    Ok(Box::new(Cipher::new(algorithm, key)?))
}

fn check_key_size(size: usize) -> Result<(), CipherError> {
    if KEY_SIZES.contains(&size) {
        Ok(())
    } else {
        Err(CipherError::InvalidKeySize(size))
    }
}

fn cbc_encrypt<C>(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError>
where
    C: BlockEncryptMut + BlockCipher + KeyInit,
{
    let encryptor = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| CipherError::InvalidKeySize(key.len()))?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>
where
    C: BlockDecryptMut + BlockCipher + KeyInit,
{
    let decryptor = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| CipherError::InvalidKeySize(key.len()))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CipherError::Decrypt)
}
