//! At-rest protection for queued face images.
//!
//! Sealed payloads are `nonce (12 bytes) || AES-256-GCM ciphertext`, keyed by
//! SHA-256 of the configured secret. Every payload, sealed or not, is stored
//! with the SHA-256 digest of its plaintext, checked on read.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum SealError {
    #[error("payload is sealed but no payload secret is configured")]
    MissingKey,
    #[error("payload could not be opened")]
    Decrypt,
    #[error("sealed payload truncated ({0} bytes)")]
    Truncated(usize),
    #[error("payload digest mismatch")]
    DigestMismatch,
    #[error("payload could not be sealed")]
    Encrypt,
}

/// Bytes ready to persist.
pub struct SealedPayload {
    pub bytes: Vec<u8>,
    /// Hex SHA-256 of the plaintext.
    pub digest: String,
    pub sealed: bool,
}

pub struct PayloadSealer {
    cipher: Option<Aes256Gcm>,
}

impl PayloadSealer {
    /// Store payloads in the clear (digest only).
    pub fn plain() -> Self {
        Self { cipher: None }
    }

    pub fn with_secret(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        Self {
            cipher: Some(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key))),
        }
    }

    pub fn from_secret(secret: Option<&str>) -> Self {
        match secret {
            Some(s) if !s.is_empty() => Self::with_secret(s),
            _ => Self::plain(),
        }
    }

    pub fn is_sealing(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn seal(&self, plain: &[u8]) -> Result<SealedPayload, SealError> {
        let digest = digest(plain);
        let Some(cipher) = &self.cipher else {
            return Ok(SealedPayload {
                bytes: plain.to_vec(),
                digest,
                sealed: false,
            });
        };

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| SealError::Encrypt)?;

        let mut bytes = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        bytes.extend_from_slice(&nonce);
        bytes.extend_from_slice(&ciphertext);
        Ok(SealedPayload {
            bytes,
            digest,
            sealed: true,
        })
    }

    /// Recover the plaintext and check it against `expected_digest`.
    pub fn open(&self, bytes: &[u8], sealed: bool, expected_digest: &str) -> Result<Vec<u8>, SealError> {
        let plain = if sealed {
            let cipher = self.cipher.as_ref().ok_or(SealError::MissingKey)?;
            if bytes.len() <= NONCE_LEN {
                return Err(SealError::Truncated(bytes.len()));
            }
            let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
            cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| SealError::Decrypt)?
        } else {
            bytes.to_vec()
        };

        if digest(&plain) != expected_digest {
            return Err(SealError::DigestMismatch);
        }
        Ok(plain)
    }
}

/// Hex SHA-256 of `bytes`.
pub fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE: &[u8] = b"\xFF\xD8 pretend jpeg \xFF\xD9";

    #[test]
    fn test_sealed_payload_hides_plaintext() {
        let sealer = PayloadSealer::with_secret("gate-secret");
        let sealed = sealer.seal(IMAGE).unwrap();
        assert!(sealed.sealed);
        assert_ne!(&sealed.bytes[NONCE_LEN..], IMAGE);
        assert_eq!(sealer.open(&sealed.bytes, true, &sealed.digest).unwrap(), IMAGE);
    }

    #[test]
    fn test_nonce_differs_per_seal() {
        let sealer = PayloadSealer::with_secret("gate-secret");
        let a = sealer.seal(IMAGE).unwrap();
        let b = sealer.seal(IMAGE).unwrap();
        assert_ne!(a.bytes, b.bytes);
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let sealer = PayloadSealer::with_secret("gate-secret");
        let mut sealed = sealer.seal(IMAGE).unwrap();
        let last = sealed.bytes.len() - 1;
        sealed.bytes[last] ^= 0x01;
        assert!(matches!(
            sealer.open(&sealed.bytes, true, &sealed.digest),
            Err(SealError::Decrypt)
        ));
    }

    #[test]
    fn test_wrong_secret_fails() {
        let sealed = PayloadSealer::with_secret("one").seal(IMAGE).unwrap();
        let other = PayloadSealer::with_secret("two");
        assert!(other.open(&sealed.bytes, true, &sealed.digest).is_err());
    }

    #[test]
    fn test_plain_digest_mismatch() {
        let sealer = PayloadSealer::plain();
        let stored = sealer.seal(IMAGE).unwrap();
        assert!(!stored.sealed);
        let mut bytes = stored.bytes.clone();
        bytes[3] = b'X';
        assert!(matches!(
            sealer.open(&bytes, false, &stored.digest),
            Err(SealError::DigestMismatch)
        ));
    }

    #[test]
    fn test_sealed_without_key() {
        let sealed = PayloadSealer::with_secret("k").seal(IMAGE).unwrap();
        assert!(matches!(
            PayloadSealer::plain().open(&sealed.bytes, true, &sealed.digest),
            Err(SealError::MissingKey)
        ));
    }

    #[test]
    fn test_empty_secret_means_plain() {
        assert!(!PayloadSealer::from_secret(Some("")).is_sealing());
        assert!(PayloadSealer::from_secret(Some("x")).is_sealing());
    }
}
