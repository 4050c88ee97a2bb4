//! SQLite persistence
//!
//! Timestamps are stored as RFC 3339 text in UTC with fixed microsecond
//! precision so they sort as text. Amounts are stored as decimal text.

pub mod connection;
pub mod repositories;

pub use connection::{ConnectionStats, DatabasePool};
pub use repositories::{SqlxCheckpointRepository, SqlxLedgerRepository, SqlxWalletRepository};

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::{Result, ServiceError};

pub(crate) fn encode_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| ServiceError::DatabaseError(format!("Invalid timestamp '{}': {}", value, e)))
}

pub(crate) fn decode_decimal(value: &str) -> Result<Decimal> {
    Decimal::from_str(value).map_err(|e| ServiceError::DatabaseError(format!("Invalid amount '{}': {}", value, e)))
}

pub(crate) fn encode_u64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| ServiceError::DatabaseError(format!("Value {} does not fit in a column", value)))
}

pub(crate) fn decode_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| ServiceError::DatabaseError(format!("Negative value {} in column", value)))
}
