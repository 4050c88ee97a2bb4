//! Wallet address derivation

use std::collections::BTreeMap;

use tracing::debug;

use crate::chain::{Chain, ChainFamily};
use crate::crypto::keys::{derive_key_pair, DerivationPath};
use crate::crypto::mnemonic::{generate_mnemonic, mnemonic_to_seed, MnemonicStrength, SecretMnemonic};
use crate::error::Result;

/// Deposit address per chain
pub type AddressSet = BTreeMap<Chain, String>;

/// Turns a seed phrase into one address per supported chain.
///
/// Every EVM chain shares the address of the `m/44'/60'/0'/0/0` key; Solana
/// gets the `m/44'/501'/0'/0'` key. Derivation is a pure function of the
/// phrase.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyDerivationService {
    strength: MnemonicStrength,
}

impl KeyDerivationService {
    pub fn new(strength: MnemonicStrength) -> Self {
        Self { strength }
    }

    pub fn strength(&self) -> MnemonicStrength {
        self.strength
    }

    /// Create a fresh phrase and its addresses
    pub fn generate(&self) -> Result<(SecretMnemonic, AddressSet)> {
        let mnemonic = generate_mnemonic(self.strength)?;
        let addresses = self.derive(mnemonic.expose())?;
        Ok((mnemonic, addresses))
    }

    /// Addresses for an existing phrase. Fails with `InvalidMnemonic` when the
    /// phrase does not pass wordlist and checksum validation.
    pub fn derive(&self, phrase: &str) -> Result<AddressSet> {
        let seed = mnemonic_to_seed(phrase, None)?;

        let mut addresses = AddressSet::new();
        for family in [ChainFamily::Evm, ChainFamily::Solana] {
            let path = DerivationPath::for_family(family);
            let address = derive_key_pair(&seed, family, &path)?.address()?;

            for chain in Chain::in_family(family) {
                addresses.insert(chain, address.clone());
            }
        }

        debug!(chains = addresses.len(), "derived wallet addresses");
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_covers_every_chain() {
        let service = KeyDerivationService::default();
        let (mnemonic, addresses) = service.generate().unwrap();

        assert_eq!(mnemonic.word_count(), 12);
        assert_eq!(addresses.len(), Chain::ALL.len());
        assert_eq!(service.derive(mnemonic.expose()).unwrap(), addresses);
    }

    #[test]
    fn test_evm_chains_share_an_address() {
        let (_, addresses) = KeyDerivationService::default().generate().unwrap();

        let ethereum = &addresses[&Chain::Ethereum];
        for chain in Chain::in_family(ChainFamily::Evm) {
            assert_eq!(&addresses[&chain], ethereum);
        }
        assert_ne!(&addresses[&Chain::Solana], ethereum);
    }

    #[test]
    fn test_long_phrases() {
        let service = KeyDerivationService::new(MnemonicStrength::Words24);
        let (mnemonic, _) = service.generate().unwrap();
        assert_eq!(mnemonic.word_count(), 24);
    }
}
