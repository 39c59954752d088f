//! Optional payload encryption layered on top of the TLS channel

use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::errors::{HaError, HaResult};

/// Payload encryption applied before chunked transfer
pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> HaResult<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8]) -> HaResult<Vec<u8>>;
}

/// Identity cipher; confidentiality comes from TLS alone
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainPayload;

impl PayloadCipher for PlainPayload {
    fn encrypt(&self, plaintext: &[u8]) -> HaResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> HaResult<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// RSA-OAEP (SHA-256) with the target's public key.
///
/// OAEP accepts at most `k - 2*32 - 2` bytes for a `k`-byte modulus; larger
/// payloads are rejected, never truncated.
pub struct RsaOaepCipher {
    public_key: RsaPublicKey,
    private_key: Option<RsaPrivateKey>,
}

impl RsaOaepCipher {
    pub fn new(public_key: RsaPublicKey) -> Self {
        Self {
            public_key,
            private_key: None,
        }
    }

    /// Cipher able to decrypt as well (receiving side)
    pub fn with_private_key(private_key: RsaPrivateKey) -> Self {
        Self {
            public_key: RsaPublicKey::from(&private_key),
            private_key: Some(private_key),
        }
    }

    pub fn from_public_pem(pem: &str) -> HaResult<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| HaError::Encryption(format!("invalid public key: {}", e)))?;
        Ok(Self::new(key))
    }

    /// Largest plaintext accepted
    pub fn max_plaintext(&self) -> usize {
        self.public_key.size().saturating_sub(2 * 32 + 2)
    }
}

impl PayloadCipher for RsaOaepCipher {
    fn encrypt(&self, plaintext: &[u8]) -> HaResult<Vec<u8>> {
        let limit = self.max_plaintext();
        if plaintext.len() > limit {
            return Err(HaError::PayloadTooLarge {
                size: plaintext.len(),
                limit,
            });
        }
        let mut rng = rand::thread_rng();
        self.public_key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| HaError::Encryption(e.to_string()))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> HaResult<Vec<u8>> {
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| HaError::Encryption("no private key loaded".into()))?;
        key.decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| HaError::Encryption(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> RsaOaepCipher {
        let mut rng = rand::thread_rng();
        RsaOaepCipher::with_private_key(RsaPrivateKey::new(&mut rng, 1024).unwrap())
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let cipher = cipher();
        assert_eq!(cipher.max_plaintext(), 128 - 66);
        let err = cipher.encrypt(&[0u8; 100]).unwrap_err();
        assert!(matches!(err, HaError::PayloadTooLarge { size: 100, limit: 62 }));
    }

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = cipher();
        let plaintext = b"sub-block payload";
        let ciphertext = cipher.encrypt(plaintext).unwrap();
        assert_ne!(ciphertext.as_slice(), plaintext.as_slice());
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), plaintext.to_vec());
    }

    #[test]
    fn test_public_only_cannot_decrypt() {
        let full = cipher();
        let public_only = RsaOaepCipher::new(full.public_key.clone());
        let ciphertext = public_only.encrypt(b"x").unwrap();
        assert!(matches!(public_only.decrypt(&ciphertext), Err(HaError::Encryption(_))));
        assert_eq!(full.decrypt(&ciphertext).unwrap(), b"x".to_vec());
    }
}
