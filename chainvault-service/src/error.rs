//! Error types for the deposit service

use chainvault_core::chain::Chain;
use thiserror::Error;

/// Service level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Key derivation, chain access and other library failures. Invalid
    /// mnemonics and unavailable chains arrive through this variant.
    #[error(transparent)]
    Core(#[from] chainvault_core::Error),

    #[error("Wallet already exists for user {0}")]
    WalletAlreadyExists(String),

    #[error("No wallet for user {0}")]
    WalletNotFound(String),

    #[error("Address {address} on {chain} already belongs to another wallet")]
    AddressConflict { chain: Chain, address: String },

    /// The token has no balance on the platform; the deposit is parked as
    /// failed for manual reconciliation
    #[error("Unknown token {token} in deposit {deposit}")]
    UnknownToken { token: String, deposit: String },

    /// The amount does not fit a decimal; the deposit is parked as failed
    /// with the raw units in its reason
    #[error("Deposit {deposit} of {units} {token} smallest units is not representable")]
    UnrepresentableAmount { deposit: String, units: String, token: String },

    /// A second token moved to the same recipient in one transaction. Only
    /// one deposit is kept per key, so the later one is not recorded.
    #[error("Deposit {deposit} is recorded in {stored}, cannot also record {token}")]
    DepositConflict { deposit: String, stored: String, token: String },

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Encryption error: {0}")]
    EncryptionError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ServiceError {
    /// Whether retrying later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Core(error) => error.is_transient(),
            _ => false,
        }
    }

    pub fn is_invalid_mnemonic(&self) -> bool {
        matches!(self, ServiceError::Core(chainvault_core::Error::InvalidMnemonic(_)))
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(error: sqlx::Error) -> Self {
        ServiceError::DatabaseError(error.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for ServiceError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        ServiceError::DatabaseError(format!("Failed to run migrations: {}", error))
    }
}

impl From<toml::de::Error> for ServiceError {
    fn from(error: toml::de::Error) -> Self {
        ServiceError::ConfigError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
