//! SQLx-based repository implementations
//!
//! Drop-in replacements for the in-memory repositories in `models`, backed
//! by the pool in `database::connection`.

pub mod checkpoint_repository;
pub mod ledger_repository;
pub mod wallet_repository;

pub use checkpoint_repository::SqlxCheckpointRepository;
pub use ledger_repository::SqlxLedgerRepository;
pub use wallet_repository::SqlxWalletRepository;
