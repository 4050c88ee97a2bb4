//! Error types for the chainvault-core library

use thiserror::Error;

/// Custom error type for chainvault-core operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The phrase failed wordlist or checksum validation
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// Transient RPC failure or malformed response. The caller must not
    /// advance its checkpoint.
    #[error("Chain {chain} unavailable: {reason}")]
    ChainUnavailable { chain: String, reason: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    pub fn chain_unavailable(chain: impl ToString, reason: impl ToString) -> Self {
        Self::ChainUnavailable {
            chain: chain.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure is transient and the operation should be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ChainUnavailable { .. })
    }
}

/// Result type for chainvault-core operations
pub type Result<T> = std::result::Result<T, Error>;
