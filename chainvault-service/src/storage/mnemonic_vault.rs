//! Encryption of seed phrases at rest
//!
//! Phrases are sealed with AES-256-GCM under a random 96-bit nonce and bound
//! to the owning user id as associated data, so a ciphertext copied onto
//! another user's wallet does not decrypt. The stored form is
//! `base64(nonce || ciphertext)`.

use std::fmt;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use zeroize::Zeroizing;

use chainvault_core::crypto::SecretMnemonic;

use crate::error::{Result, ServiceError};

const NONCE_LEN: usize = 12;

/// Seals and opens wallet mnemonics
pub struct MnemonicVault {
    cipher: Aes256Gcm,
}

impl MnemonicVault {
    pub fn new(key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, user_id: &str, mnemonic: &SecretMnemonic) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: mnemonic.expose().as_bytes(),
                    aad: user_id.as_bytes(),
                },
            )
            .map_err(|_| ServiceError::EncryptionError("Failed to encrypt mnemonic".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        Ok(general_purpose::STANDARD.encode(sealed))
    }

    pub fn decrypt(&self, user_id: &str, sealed: &str) -> Result<SecretMnemonic> {
        let sealed = general_purpose::STANDARD
            .decode(sealed)
            .map_err(|e| ServiceError::EncryptionError(format!("Invalid sealed mnemonic: {}", e)))?;

        if sealed.len() <= NONCE_LEN {
            return Err(ServiceError::EncryptionError("Sealed mnemonic is truncated".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad: user_id.as_bytes(),
                    },
                )
                .map_err(|_| ServiceError::EncryptionError("Failed to decrypt mnemonic".to_string()))?,
        );

        let phrase = std::str::from_utf8(&plaintext)
            .map_err(|_| ServiceError::EncryptionError("Decrypted mnemonic is not UTF-8".to_string()))?;

        Ok(SecretMnemonic::new(phrase.to_string()))
    }
}

impl fmt::Debug for MnemonicVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MnemonicVault([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn vault(byte: u8) -> MnemonicVault {
        MnemonicVault::new(&[byte; 32])
    }

    #[test]
    fn test_seal_and_open() {
        let mnemonic = SecretMnemonic::parse(PHRASE).unwrap();
        let sealed = vault(7).encrypt("user-1", &mnemonic).unwrap();

        assert!(!sealed.contains("abandon"));
        assert_eq!(vault(7).decrypt("user-1", &sealed).unwrap(), mnemonic);
    }

    #[test]
    fn test_nonce_is_fresh() {
        let mnemonic = SecretMnemonic::parse(PHRASE).unwrap();
        let first = vault(7).encrypt("user-1", &mnemonic).unwrap();
        let second = vault(7).encrypt("user-1", &mnemonic).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_wrong_key_or_user_fails() {
        let mnemonic = SecretMnemonic::parse(PHRASE).unwrap();
        let sealed = vault(7).encrypt("user-1", &mnemonic).unwrap();

        assert!(matches!(vault(8).decrypt("user-1", &sealed), Err(ServiceError::EncryptionError(_))));
        assert!(vault(7).decrypt("user-2", &sealed).is_err());
        assert!(vault(7).decrypt("user-1", "AAAA").is_err());
        assert!(vault(7).decrypt("user-1", "not base64!").is_err());
    }
}
