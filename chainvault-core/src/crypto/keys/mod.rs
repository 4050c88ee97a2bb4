//! Key derivation and management
//!
//! This module provides functionality for deriving and managing keys for
//! the supported chain families.

pub mod ethereum;
pub mod solana;
mod derivation;

pub use derivation::*;
