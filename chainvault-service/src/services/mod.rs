//! Custody and deposit services

pub mod ledger;
pub mod scanner;
pub mod wallet_store;

pub use ledger::Ledger;
pub use scanner::{ChainStatus, CycleReport, DepositScanner, ScanState, ScannerSettings};
pub use wallet_store::{NewWallet, WalletStore};

#[cfg(test)]
pub mod scanner_test;
#[cfg(test)]
pub mod wallet_store_test;
