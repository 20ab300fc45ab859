//! Block-cipher abstraction for handshake payloads.
//!
//! # Responsibilities
//! - Produce fixed-key ECB block ciphers by key size
//! - Let an embedding application substitute its own implementation
//!
//! # Design Decisions
//! - The override is a [`CipherProvider`] held by [`CipherFactory`], injected
//!   through `ConnectionOptions`; there is no process-wide hook
//! - Cipher instances own their key schedule and wipe it when dropped

mod aes;

pub use self::aes::{AesCipher, AesCipherProvider};

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

/// Error type for cipher construction and use.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Caller-provided input and output buffers differ in length.
    #[error("input is {input} bytes but output is {output} bytes")]
    SizeMismatch { input: usize, output: usize },

    #[error("key is {actual} bytes, expected {expected}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("unsupported key size: {0} bits")]
    UnsupportedKeySize(usize),

    /// ECB input must be a whole number of blocks.
    #[error("{0} bytes is not a whole number of blocks")]
    InvalidBlockLength(usize),
}

/// A keyed block cipher in ECB mode.
pub trait BlockCipher: Send + Sync {
    fn block_size(&self) -> usize;

    /// Encrypt `input` into `output`. Both must have the same length, a
    /// multiple of [`Self::block_size`].
    fn encrypt_block(&self, input: &[u8], output: &mut [u8]) -> Result<(), CryptoError>;

    fn decrypt_block(&self, input: &[u8], output: &mut [u8]) -> Result<(), CryptoError>;

    /// Zero-pad `input` to a whole number of blocks and encrypt it.
    fn encrypt_padded(&self, input: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let block = self.block_size();
        let padded_len = input.len().div_ceil(block).max(1) * block;
        let mut padded = Zeroizing::new(vec![0u8; padded_len]);
        padded[..input.len()].copy_from_slice(input);

        let mut output = vec![0u8; padded_len];
        self.encrypt_block(&padded, &mut output)?;
        Ok(output)
    }
}

/// Source of cipher instances.
pub trait CipherProvider: Send + Sync {
    /// Build a cipher for a `key_size_bits` key. `Ok(None)` declines, letting
    /// the next provider answer.
    fn create_cipher(
        &self,
        key_size_bits: usize,
        key: &[u8],
    ) -> Result<Option<Box<dyn BlockCipher>>, CryptoError>;
}

/// Creates ciphers from an optional override, falling back to AES.
#[derive(Clone, Default)]
pub struct CipherFactory {
    provider: Option<Arc<dyn CipherProvider>>,
}

impl CipherFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try `provider` first for every cipher this factory creates.
    pub fn with_override(provider: Arc<dyn CipherProvider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    pub fn has_override(&self) -> bool {
        self.provider.is_some()
    }

    pub fn create_cipher(
        &self,
        key_size_bits: usize,
        key: &[u8],
    ) -> Result<Box<dyn BlockCipher>, CryptoError> {
        if let Some(provider) = &self.provider {
            if let Some(cipher) = provider.create_cipher(key_size_bits, key)? {
                return Ok(cipher);
            }
            tracing::trace!(key_size_bits, "Cipher override declined, using AES");
        }
        Ok(Box::new(AesCipher::new(key_size_bits, key)?))
    }
}

impl fmt::Debug for CipherFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherFactory")
            .field("has_override", &self.has_override())
            .finish()
    }
}
