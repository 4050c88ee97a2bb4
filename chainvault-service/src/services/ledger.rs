//! Deposit ledger
//!
//! The only writer of deposit balance changes. Crediting is at most once per
//! deposit key; the atomic step itself lives in the repository.

use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};

use chainvault_core::chain::DepositEvent;

use crate::error::{Result, ServiceError};
use crate::models::balance::UserBalance;
use crate::models::transaction::{LedgerRepository, Settlement, Transaction};

/// Applies observed deposits to user balances
pub struct Ledger {
    repository: Arc<dyn LedgerRepository>,
    supported_tokens: HashSet<String>,
}

impl Ledger {
    pub fn new(repository: Arc<dyn LedgerRepository>, supported_tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            repository,
            supported_tokens: supported_tokens.into_iter().collect(),
        }
    }

    pub fn supports(&self, token: &str) -> bool {
        self.supported_tokens.contains(token)
    }

    /// Record a deposit that has not reached its confirmation threshold.
    /// Repeated calls only raise the stored confirmation count.
    #[instrument(skip(self, event), fields(key = %event.key(), confirmations = event.confirmations))]
    pub async fn record_pending(&self, event: &DepositEvent, user_id: &str) -> Result<Transaction> {
        let tx = self.repository.upsert_pending(event, user_id).await?;
        debug!(status = %tx.status, "Pending deposit upserted");
        Ok(tx)
    }

    /// Complete a confirmed deposit and credit its amount once.
    ///
    /// A deposit in a token without a platform balance is parked as failed
    /// and `UnknownToken` is returned. So is an amount too large for a
    /// decimal, returning `UnrepresentableAmount`. Completed and failed
    /// deposits come back unchanged.
    #[instrument(skip(self, event), fields(key = %event.key(), token = %event.token_symbol))]
    pub async fn finalize_deposit(&self, event: &DepositEvent, user_id: &str) -> Result<Settlement> {
        if !self.supports(&event.token_symbol) {
            let reason = format!("token {} is not supported", event.token_symbol);
            let parked = self.repository.fail_deposit(event, user_id, &reason).await?;
            warn!(status = %parked.status, amount = %event.amount, "Deposit parked: unknown token");

            return Err(ServiceError::UnknownToken {
                token: event.token_symbol.clone(),
                deposit: event.key().to_string(),
            });
        }

        if let Some(units) = &event.unrepresentable_units {
            let reason = format!(
                "amount of {} {} smallest units is not representable",
                units, event.token_symbol
            );
            let parked = self.repository.fail_deposit(event, user_id, &reason).await?;
            warn!(status = %parked.status, %units, "Deposit parked: amount not representable");

            return Err(ServiceError::UnrepresentableAmount {
                deposit: event.key().to_string(),
                units: units.clone(),
                token: event.token_symbol.clone(),
            });
        }

        let settlement = self.repository.complete_deposit(event, user_id).await?;
        match &settlement {
            Settlement::Completed(tx) => info!(user_id, amount = %tx.amount, "Deposit credited"),
            Settlement::AlreadyCompleted(_) => debug!("Deposit already completed"),
            Settlement::Failed(tx) => warn!(
                reason = tx.failure_reason.as_deref().unwrap_or_default(),
                "Deposit is parked as failed, not crediting"
            ),
        }

        Ok(settlement)
    }

    /// Deposit history of a user, newest first
    pub async fn transaction_history(&self, user_id: &str) -> Result<Vec<Transaction>> {
        self.repository.transactions_for_user(user_id).await
    }

    pub async fn balances(&self, user_id: &str) -> Result<Vec<UserBalance>> {
        self.repository.get_balances(user_id).await
    }

    pub async fn balance(&self, user_id: &str, token: &str) -> Result<Decimal> {
        self.repository.get_balance(user_id, token).await
    }
}
