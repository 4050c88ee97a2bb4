//! Account address derivation
//!
//! This module turns seed phrases into the per-chain deposit addresses
//! assigned to a user's wallet.

mod wallet;

pub use wallet::*;
