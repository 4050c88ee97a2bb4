//! Chain identifiers and deposit detection
//!
//! This module defines the supported chains, the normalized deposit types the
//! scanners exchange, and the [`ChainClient`] adapters that poll each chain
//! family for incoming transfers.

pub mod types;
pub mod provider;
pub mod evm;
pub mod solana;

pub use types::*;
pub use provider::*;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{ethereum, solana as solana_keys};
use crate::error::{Error, Result};

/// Confirmation count reported for a finalized Solana transaction
pub const SOLANA_FINALIZED_CONFIRMATIONS: u64 = 32;

/// Key and address families. Every chain in a family shares one derived
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    /// Ethereum and EVM compatible chains (secp256k1)
    Evm,
    /// Solana (ed25519)
    Solana,
}

/// Supported chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Bsc,
    Arbitrum,
    Base,
    Polygon,
    Solana,
}

impl Chain {
    pub const ALL: [Chain; 6] = [
        Chain::Ethereum,
        Chain::Bsc,
        Chain::Arbitrum,
        Chain::Base,
        Chain::Polygon,
        Chain::Solana,
    ];

    pub fn family(self) -> ChainFamily {
        match self {
            Chain::Solana => ChainFamily::Solana,
            _ => ChainFamily::Evm,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Bsc => "bsc",
            Chain::Arbitrum => "arbitrum",
            Chain::Base => "base",
            Chain::Polygon => "polygon",
            Chain::Solana => "solana",
        }
    }

    /// Symbol of the chain's native coin
    pub fn native_symbol(self) -> &'static str {
        match self {
            Chain::Ethereum | Chain::Arbitrum | Chain::Base => "ETH",
            Chain::Bsc => "BNB",
            Chain::Polygon => "MATIC",
            Chain::Solana => "SOL",
        }
    }

    pub fn native_decimals(self) -> u32 {
        match self.family() {
            ChainFamily::Evm => 18,
            ChainFamily::Solana => 9,
        }
    }

    /// Confirmations required before a deposit is credited, unless configured
    pub fn default_required_confirmations(self) -> u64 {
        match self {
            Chain::Ethereum => 12,
            Chain::Bsc => 15,
            Chain::Arbitrum => 12,
            Chain::Base => 12,
            Chain::Polygon => 64,
            Chain::Solana => SOLANA_FINALIZED_CONFIRMATIONS,
        }
    }

    /// Poll cadence, unless configured. Solana finalizes quickly and is
    /// polled more often than the EVM chains.
    pub fn default_poll_interval_secs(self) -> u64 {
        match self {
            Chain::Solana => 5,
            Chain::Ethereum => 15,
            _ => 10,
        }
    }

    /// Canonical form of an address on this chain
    pub fn normalize_address(self, address: &str) -> Result<String> {
        match self.family() {
            ChainFamily::Evm => ethereum::normalize_address(address),
            ChainFamily::Solana => solana_keys::normalize_address(address),
        }
    }

    /// Chains in a family, in declaration order
    pub fn in_family(family: ChainFamily) -> impl Iterator<Item = Chain> {
        Self::ALL.into_iter().filter(move |chain| chain.family() == family)
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ethereum" | "eth" => Ok(Chain::Ethereum),
            "bsc" | "bnb" => Ok(Chain::Bsc),
            "arbitrum" => Ok(Chain::Arbitrum),
            "base" => Ok(Chain::Base),
            "polygon" | "matic" => Ok(Chain::Polygon),
            "solana" | "sol" => Ok(Chain::Solana),
            _ => Err(Error::UnknownChain(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_round_trip_names() {
        for chain in Chain::ALL {
            assert_eq!(chain.as_str().parse::<Chain>().unwrap(), chain);
        }
        assert!("dogecoin".parse::<Chain>().is_err());
    }

    #[test]
    fn test_families() {
        let evm: Vec<_> = Chain::in_family(ChainFamily::Evm).collect();
        assert_eq!(evm.len(), 5);
        assert_eq!(Chain::Solana.family(), ChainFamily::Solana);
        assert_eq!(Chain::Bsc.native_symbol(), "BNB");
    }

    #[test]
    fn test_solana_polls_faster_than_evm() {
        for chain in Chain::in_family(ChainFamily::Evm) {
            assert!(Chain::Solana.default_poll_interval_secs() < chain.default_poll_interval_secs());
        }
    }
}
