//! Data models and repository traits of the deposit service

pub mod balance;
pub mod checkpoint;
pub mod transaction;
pub mod wallet;

pub use balance::{UserAccountStore, UserBalance};
pub use checkpoint::{CheckpointRepository, InMemoryCheckpointRepository, ScanCheckpoint};
pub use transaction::{
    InMemoryLedgerRepository, LedgerRepository, Settlement, Transaction, TransactionStatus, TransactionType,
};
pub use wallet::{
    InMemoryWalletRepository, MnemonicRecovery, MonitoredAddresses, RetiredWallet, WalletRecord, WalletRepository,
};
