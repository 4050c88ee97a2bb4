//! Storage modules for the deposit service

pub mod mnemonic_vault;

pub use mnemonic_vault::MnemonicVault;
