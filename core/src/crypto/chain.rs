// Cipher chain — ordered cipher layers applied as one transform
//
// Encryption runs layers front-to-back, decryption back-to-front, so
// `decrypt(encrypt(x)) == x` for any non-empty chain. A single mutex
// guards the whole pass: concurrent users of one chain never interleave
// mid-transform, while distinct chains stay independent.

use super::cipher::{create, CipherAlgorithm, CipherError, CipherLayer};
use super::kdf;
use crate::config::SecurityConfig;
use parking_lot::Mutex;
use std::fmt;
use tracing::debug;

pub struct CipherChain {
    layers: Mutex<Vec<Box<dyn CipherLayer>>>,
}

impl CipherChain {
    /// Build a chain from at least one layer.
    pub fn new(layers: Vec<Box<dyn CipherLayer>>) -> Result<Self, CipherError> {
        if layers.is_empty() {
            return Err(CipherError::EmptyChain);
        }
        Ok(Self {
            layers: Mutex::new(layers),
        })
    }

    /// A chain with no layers: the identity transform.
    ///
    /// Only reachable explicitly; configuration with zero layers is rejected.
    pub fn identity() -> Self {
        debug!("Creating identity cipher chain (no encryption layers)");
        Self {
            layers: Mutex::new(Vec::new()),
        }
    }

    /// Derive every configured layer's key from its passphrase.
    pub fn from_config(config: &SecurityConfig) -> Result<Self, CipherError> {
        let salt = config.salt.as_bytes();
        let mut layers = Vec::with_capacity(config.layers.len());

        for layer in &config.layers {
            let key = kdf::derive_key(&layer.passphrase, salt, config.iterations, layer.key_size)?;
            layers.push(create(&layer.cipher, &key)?);
        }

        let chain = Self::new(layers)?;
        debug!("Built cipher chain: {:?}", chain.algorithms());
        Ok(chain)
    }

    /// Append a layer. It becomes the outermost encryption layer.
    pub fn push(&self, layer: Box<dyn CipherLayer>) {
        self.layers.lock().push(layer);
    }

    /// Replace the key of one layer.
    pub fn rekey(&self, index: usize, key: &[u8]) -> Result<(), CipherError> {
        let mut layers = self.layers.lock();
        let layer = layers.get_mut(index).ok_or(CipherError::NoSuchLayer(index))?;
        layer.set_key(key)?;
        debug!("Re-keyed cipher layer {} ({})", index, layer.algorithm());
        Ok(())
    }

    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        let layers = self.layers.lock();
        let mut output = data.to_vec();
        for layer in layers.iter() {
            output = layer.encrypt(&output)?;
        }
        Ok(output)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        let layers = self.layers.lock();
        let mut output = data.to_vec();
        for layer in layers.iter().rev() {
            output = layer.decrypt(&output)?;
        }
        Ok(output)
    }

    pub fn len(&self) -> usize {
        self.layers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.lock().is_empty()
    }

    pub fn algorithms(&self) -> Vec<CipherAlgorithm> {
        self.layers.lock().iter().map(|layer| layer.algorithm()).collect()
    }
}

impl fmt::Debug for CipherChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherChain")
            .field("layers", &self.algorithms())
            .finish()
    }
}
