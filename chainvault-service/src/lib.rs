//! ChainVault deposit service
//!
//! Wallet custody, chain scanning and deposit crediting on top of
//! `chainvault-core`.

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod observability;
pub mod services;
pub mod state;
pub mod storage;

pub use config::Config;
pub use error::{Result, ServiceError};
pub use state::AppState;
