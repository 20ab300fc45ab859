//! Default AES provider.

use ::aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use ::aes::{Aes128, Aes192, Aes256, Block};

use super::{BlockCipher, CipherProvider, CryptoError};

const BLOCK_SIZE: usize = 16;

/// AES in ECB mode. The key schedule is wiped on drop.
pub enum AesCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AesCipher {
    pub fn new(key_size_bits: usize, key: &[u8]) -> Result<Self, CryptoError> {
        let expected = match key_size_bits {
            128 | 192 | 256 => key_size_bits / 8,
            other => return Err(CryptoError::UnsupportedKeySize(other)),
        };
        if key.len() != expected {
            return Err(CryptoError::InvalidKeyLength {
                expected,
                actual: key.len(),
            });
        }
        let invalid = |_| CryptoError::InvalidKeyLength {
            expected,
            actual: key.len(),
        };
        Ok(match key_size_bits {
            128 => AesCipher::Aes128(Aes128::new_from_slice(key).map_err(invalid)?),
            192 => AesCipher::Aes192(Aes192::new_from_slice(key).map_err(invalid)?),
            _ => AesCipher::Aes256(Aes256::new_from_slice(key).map_err(invalid)?),
        })
    }

    pub fn key_size_bits(&self) -> usize {
        match self {
            AesCipher::Aes128(_) => 128,
            AesCipher::Aes192(_) => 192,
            AesCipher::Aes256(_) => 256,
        }
    }

    fn encrypt_one(&self, input: &Block, output: &mut Block) {
        match self {
            AesCipher::Aes128(c) => c.encrypt_block_b2b(input, output),
            AesCipher::Aes192(c) => c.encrypt_block_b2b(input, output),
            AesCipher::Aes256(c) => c.encrypt_block_b2b(input, output),
        }
    }

    fn decrypt_one(&self, input: &Block, output: &mut Block) {
        match self {
            AesCipher::Aes128(c) => c.decrypt_block_b2b(input, output),
            AesCipher::Aes192(c) => c.decrypt_block_b2b(input, output),
            AesCipher::Aes256(c) => c.decrypt_block_b2b(input, output),
        }
    }
}

fn check_lengths(input: &[u8], output: &[u8]) -> Result<(), CryptoError> {
    if input.len() != output.len() {
        return Err(CryptoError::SizeMismatch {
            input: input.len(),
            output: output.len(),
        });
    }
    if input.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidBlockLength(input.len()));
    }
    Ok(())
}

impl BlockCipher for AesCipher {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn encrypt_block(&self, input: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        check_lengths(input, output)?;
        for (src, dst) in input
            .chunks_exact(BLOCK_SIZE)
            .zip(output.chunks_exact_mut(BLOCK_SIZE))
        {
            self.encrypt_one(Block::from_slice(src), Block::from_mut_slice(dst));
        }
        Ok(())
    }

    fn decrypt_block(&self, input: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        check_lengths(input, output)?;
        for (src, dst) in input
            .chunks_exact(BLOCK_SIZE)
            .zip(output.chunks_exact_mut(BLOCK_SIZE))
        {
            self.decrypt_one(Block::from_slice(src), Block::from_mut_slice(dst));
        }
        Ok(())
    }
}

/// Provider that always answers with [`AesCipher`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AesCipherProvider;

impl CipherProvider for AesCipherProvider {
    fn create_cipher(
        &self,
        key_size_bits: usize,
        key: &[u8],
    ) -> Result<Option<Box<dyn BlockCipher>>, CryptoError> {
        Ok(Some(Box::new(AesCipher::new(key_size_bits, key)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn fips_197_aes128_vector() {
        let cipher = AesCipher::new(128, &hex("000102030405060708090a0b0c0d0e0f")).unwrap();
        let plaintext = hex("00112233445566778899aabbccddeeff");
        let mut ciphertext = [0u8; 16];
        cipher.encrypt_block(&plaintext, &mut ciphertext).unwrap();
        assert_eq!(ciphertext.to_vec(), hex("69c4e0d86a7b0430d8cdb78070b4c55a"));

        let mut decrypted = [0u8; 16];
        cipher.decrypt_block(&ciphertext, &mut decrypted).unwrap();
        assert_eq!(decrypted.to_vec(), plaintext);
    }

    #[test]
    fn fips_197_aes256_vector() {
        let key = hex("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f");
        let cipher = AesCipher::new(256, &key).unwrap();
        let mut ciphertext = [0u8; 16];
        cipher
            .encrypt_block(&hex("00112233445566778899aabbccddeeff"), &mut ciphertext)
            .unwrap();
        assert_eq!(ciphertext.to_vec(), hex("8ea2b7ca516745bfeafc49904b496089"));
    }

    #[test]
    fn multi_block_round_trip() {
        let cipher = AesCipher::new(192, &[3u8; 24]).unwrap();
        let plaintext: Vec<u8> = (0..48).collect();
        let mut ciphertext = vec![0u8; 48];
        cipher.encrypt_block(&plaintext, &mut ciphertext).unwrap();
        // ECB: distinct plaintext blocks give distinct ciphertext blocks.
        assert_ne!(ciphertext[..16], ciphertext[16..32]);

        let mut decrypted = vec![0u8; 48];
        cipher.decrypt_block(&ciphertext, &mut decrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        let cipher = AesCipher::new(128, &[0u8; 16]).unwrap();
        for (input, output) in [(16, 32), (32, 16), (0, 16), (16, 0)] {
            let err = cipher
                .encrypt_block(&vec![0u8; input], &mut vec![0u8; output])
                .unwrap_err();
            assert_eq!(err, CryptoError::SizeMismatch { input, output });
        }
        let err = cipher.encrypt_block(&[0u8; 10], &mut [0u8; 10]).unwrap_err();
        assert_eq!(err, CryptoError::InvalidBlockLength(10));
    }

    #[test]
    fn key_validation() {
        assert_eq!(
            AesCipher::new(64, &[0u8; 8]).err(),
            Some(CryptoError::UnsupportedKeySize(64))
        );
        assert_eq!(
            AesCipher::new(256, &[0u8; 16]).err(),
            Some(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        );
        assert_eq!(AesCipher::new(192, &[0u8; 24]).unwrap().key_size_bits(), 192);
    }
}
