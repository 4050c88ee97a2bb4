//! Common key derivation functionality

use std::fmt;
use std::str::FromStr;

use zeroize::Zeroize;

use crate::chain::ChainFamily;
use crate::error::{Error, Result};

/// Offset applied to hardened child indexes
pub const HARDENED_OFFSET: u32 = 0x8000_0000;

/// Standard account path for EVM chains (BIP-44 coin type 60)
pub const EVM_DERIVATION_PATH: &str = "m/44'/60'/0'/0/0";

/// Standard account path for Solana (BIP-44 coin type 501, all hardened)
pub const SOLANA_DERIVATION_PATH: &str = "m/44'/501'/0'/0'";

/// A parsed BIP-32 derivation path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationPath(Vec<u32>);

impl DerivationPath {
    /// Child indexes, hardened ones carrying [`HARDENED_OFFSET`]
    pub fn components(&self) -> &[u32] {
        &self.0
    }

    pub fn is_fully_hardened(&self) -> bool {
        self.0.iter().all(|index| *index >= HARDENED_OFFSET)
    }

    /// The standard path for a chain family
    pub fn for_family(family: ChainFamily) -> Self {
        let path = match family {
            ChainFamily::Evm => EVM_DERIVATION_PATH,
            ChainFamily::Solana => SOLANA_DERIVATION_PATH,
        };
        // constant paths always parse
        path.parse().unwrap_or(Self(Vec::new()))
    }
}

impl FromStr for DerivationPath {
    type Err = Error;

    fn from_str(path: &str) -> Result<Self> {
        if !path.starts_with("m/") {
            return Err(Error::KeyDerivation(format!("Invalid derivation path: {}", path)));
        }

        let mut result = Vec::new();

        for component in path.trim_start_matches("m/").split('/') {
            if component.is_empty() {
                continue;
            }

            let hardened = component.ends_with('\'');
            let index = component
                .trim_end_matches('\'')
                .parse::<u32>()
                .ok()
                .filter(|index| *index < HARDENED_OFFSET)
                .ok_or_else(|| {
                    Error::KeyDerivation(format!("Invalid derivation path component: {}", component))
                })?;

            result.push(if hardened { HARDENED_OFFSET + index } else { index });
        }

        Ok(Self(result))
    }
}

/// A private key for a specific chain family
#[derive(Clone)]
pub struct PrivateKey {
    bytes: Vec<u8>,
    family: ChainFamily,
}

impl PrivateKey {
    pub fn new(bytes: Vec<u8>, family: ChainFamily) -> Self {
        Self { bytes, family }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn family(&self) -> ChainFamily {
        self.family
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("family", &self.family)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// A public key for a specific chain family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    bytes: Vec<u8>,
    family: ChainFamily,
}

impl PublicKey {
    pub fn new(bytes: Vec<u8>, family: ChainFamily) -> Self {
        Self { bytes, family }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn family(&self) -> ChainFamily {
        self.family
    }
}

/// A key pair for a specific chain family
#[derive(Debug, Clone)]
pub struct KeyPair {
    private_key: PrivateKey,
    public_key: PublicKey,
}

impl KeyPair {
    pub fn new(private_key: PrivateKey, public_key: PublicKey) -> Result<Self> {
        if private_key.family() != public_key.family() {
            return Err(Error::KeyDerivation("Key type mismatch".to_string()));
        }
        Ok(Self { private_key, public_key })
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn family(&self) -> ChainFamily {
        self.private_key.family()
    }

    /// The on-chain address for this key pair
    pub fn address(&self) -> Result<String> {
        match self.family() {
            ChainFamily::Evm => super::ethereum::public_key_to_address(&self.public_key),
            ChainFamily::Solana => super::solana::public_key_to_address(&self.public_key),
        }
    }
}

/// Derive a key pair from a seed for a specific chain family
pub fn derive_key_pair(seed: &[u8], family: ChainFamily, path: &DerivationPath) -> Result<KeyPair> {
    match family {
        ChainFamily::Evm => super::ethereum::derive_ethereum_key_pair(seed, path),
        ChainFamily::Solana => super::solana::derive_solana_key_pair(seed, path),
    }
}
