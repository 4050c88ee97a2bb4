//! Mnemonic phrase generation and handling

use std::fmt;

use bip39::Mnemonic;
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};

/// Supported mnemonic strengths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MnemonicStrength {
    /// 12 words (128 bits)
    #[default]
    Words12,
    /// 24 words (256 bits)
    Words24,
}

impl MnemonicStrength {
    /// Get entropy length in bytes
    fn entropy_bytes(&self) -> usize {
        match self {
            Self::Words12 => 16,
            Self::Words24 => 32,
        }
    }
}

/// A seed phrase held in memory that is wiped on drop.
///
/// `Debug` and `Display` never print the words. The phrase is only reachable
/// through [`SecretMnemonic::expose`], which keeps every read explicit at the
/// call site.
#[derive(Clone)]
pub struct SecretMnemonic(Zeroizing<String>);

impl SecretMnemonic {
    /// Wrap an already validated phrase
    pub fn new(phrase: String) -> Self {
        Self(Zeroizing::new(phrase))
    }

    /// Parse and normalize a user supplied phrase
    pub fn parse(phrase: &str) -> Result<Self> {
        let mnemonic = Mnemonic::parse_normalized(phrase)
            .map_err(|e| Error::InvalidMnemonic(e.to_string()))?;
        Ok(Self::new(mnemonic.to_string()))
    }

    /// Read the phrase
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn word_count(&self) -> usize {
        self.0.split_whitespace().count()
    }
}

impl fmt::Debug for SecretMnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretMnemonic([REDACTED; {} words])", self.word_count())
    }
}

impl PartialEq for SecretMnemonic {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

/// Generate a new random mnemonic phrase with the specified strength
pub fn generate_mnemonic(strength: MnemonicStrength) -> Result<SecretMnemonic> {
    let mut entropy = vec![0u8; strength.entropy_bytes()];
    OsRng.fill_bytes(&mut entropy);

    let mnemonic = Mnemonic::from_entropy(&entropy)
        .map_err(|e| Error::InvalidMnemonic(e.to_string()));
    entropy.zeroize();

    Ok(SecretMnemonic::new(mnemonic?.to_string()))
}

/// Validate a mnemonic phrase
pub fn validate_mnemonic(phrase: &str) -> Result<()> {
    Mnemonic::parse_normalized(phrase)
        .map(|_| ())
        .map_err(|e| Error::InvalidMnemonic(e.to_string()))
}

/// Generate a seed from a mnemonic phrase and optional passphrase
pub fn mnemonic_to_seed(phrase: &str, passphrase: Option<&str>) -> Result<Zeroizing<Vec<u8>>> {
    let mnemonic = Mnemonic::parse_normalized(phrase)
        .map_err(|e| Error::InvalidMnemonic(e.to_string()))?;

    let seed = mnemonic.to_seed(passphrase.unwrap_or(""));
    Ok(Zeroizing::new(seed.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_generate_mnemonic() {
        let mnemonic = generate_mnemonic(MnemonicStrength::Words12).unwrap();
        assert!(validate_mnemonic(mnemonic.expose()).is_ok());
        assert_eq!(mnemonic.word_count(), 12);

        let long = generate_mnemonic(MnemonicStrength::Words24).unwrap();
        assert_eq!(long.word_count(), 24);
    }

    #[test]
    fn test_validate_mnemonic() {
        let invalid = "invalid mnemonic phrase test test test test test test test test test";

        assert!(validate_mnemonic(ABANDON).is_ok());
        assert!(matches!(validate_mnemonic(invalid), Err(Error::InvalidMnemonic(_))));
    }

    #[test]
    fn test_bad_checksum_is_rejected() {
        // valid words, wrong checksum word
        let phrase = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon";
        assert!(SecretMnemonic::parse(phrase).is_err());
    }

    #[test]
    fn test_mnemonic_to_seed() {
        let seed = mnemonic_to_seed(ABANDON, None).unwrap();
        assert_eq!(seed.len(), 64);
        assert_eq!(
            hex::encode(&seed[..8]),
            "5eb00bbddcf06908"
        );
    }

    #[test]
    fn test_debug_is_redacted() {
        let mnemonic = SecretMnemonic::parse(ABANDON).unwrap();
        let printed = format!("{:?}", mnemonic);
        assert!(!printed.contains("abandon"));
        assert!(printed.contains("12 words"));
    }
}
