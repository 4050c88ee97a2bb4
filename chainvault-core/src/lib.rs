//! ChainVault Core - multi-chain custody and deposit detection
//!
//! This library derives per-user deposit addresses for EVM chains and Solana
//! from a single seed phrase, and polls those chains for incoming transfers
//! through the [`chain::ChainClient`] adapters.

pub mod error;
pub mod crypto;
pub mod account;
pub mod chain;

// Re-export commonly used types for convenience
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
