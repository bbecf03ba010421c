//! Passphrase encryption at rest
//!
//! Certificate passphrases are sealed with AES-256-GCM under a key derived
//! from an application secret (SHA-256 of the secret). Every seal uses a
//! fresh random 96-bit nonce, stored next to the ciphertext.

use ring::aead::{AES_256_GCM, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Length of the GCM nonce in bytes
pub const NONCE_LEN: usize = 12;

/// A sealed passphrase: ciphertext with appended tag, plus its nonce
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedPassphrase {
    /// Ciphertext followed by the 16-byte authentication tag
    pub ciphertext: Vec<u8>,
    /// Nonce used for this seal
    pub nonce: [u8; NONCE_LEN],
}

/// AES-256-GCM cipher keyed from an application secret
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PassphraseCipher {
    key: [u8; 32],
}

impl PassphraseCipher {
    /// Derive the key from an application secret
    pub fn from_secret(secret: &SecretString) -> Result<Self> {
        if secret.expose_secret().is_empty() {
            return Err(Error::Crypto("application secret must not be empty".into()));
        }
        let key: [u8; 32] = Sha256::digest(secret.expose_secret().as_bytes()).into();
        Ok(Self { key })
    }

    fn less_safe_key(&self) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|_| Error::Crypto("failed to create AES-256-GCM key".into()))?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Encrypt a passphrase under a fresh random nonce
    pub fn seal(&self, passphrase: &SecretString) -> Result<SealedPassphrase> {
        let key = self.less_safe_key()?;

        let mut nonce = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce)
            .map_err(|_| Error::Crypto("failed to generate random nonce".into()))?;

        let mut in_out = passphrase.expose_secret().as_bytes().to_vec();
        key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| Error::Crypto("AES-256-GCM encryption failed".into()))?;

        Ok(SealedPassphrase {
            ciphertext: in_out,
            nonce,
        })
    }

    /// Decrypt a sealed passphrase
    ///
    /// Fails when the secret differs from the one used to seal or the data
    /// was tampered with.
    pub fn open(&self, sealed: &SealedPassphrase) -> Result<SecretString> {
        let key = self.less_safe_key()?;

        let mut in_out = sealed.ciphertext.clone();
        let plaintext = key
            .open_in_place(
                Nonce::assume_unique_for_key(sealed.nonce),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| {
                Error::Crypto("passphrase decryption failed: wrong secret or corrupted data".into())
            })?;

        let result = std::str::from_utf8(plaintext)
            .map(|s| SecretString::from(s.to_string()))
            .map_err(|_| Error::Crypto("decrypted passphrase is not UTF-8".into()));
        in_out.zeroize();
        result
    }
}

impl std::fmt::Debug for PassphraseCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PassphraseCipher([REDACTED])")
    }
}
