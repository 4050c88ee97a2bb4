//! User balance models

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Balance of one token for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBalance {
    pub user_id: String,
    pub token: String,
    pub amount: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Read access to user balances.
///
/// Deposit credits are applied by the ledger's atomic completion, never
/// through this interface.
#[async_trait]
pub trait UserAccountStore: Send + Sync {
    /// All balances of a user, ordered by token
    async fn get_balances(&self, user_id: &str) -> Result<Vec<UserBalance>>;

    /// Zero when the user holds none of `token`
    async fn get_balance(&self, user_id: &str, token: &str) -> Result<Decimal>;
}
