//! Ledger transaction models

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use chainvault_core::chain::{Chain, DepositEvent, DepositKey};

use super::balance::{UserAccountStore, UserBalance};
use crate::error::{Result, ServiceError};

/// Transaction types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionType::Deposit => write!(f, "deposit"),
            TransactionType::Withdrawal => write!(f, "withdrawal"),
        }
    }
}

impl std::str::FromStr for TransactionType {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "deposit" => Ok(TransactionType::Deposit),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            _ => Err(ServiceError::InvalidInput(format!("Invalid transaction type: {}", s))),
        }
    }
}

/// Transaction status. `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        })
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            _ => Err(ServiceError::InvalidInput(format!("Invalid transaction status: {}", s))),
        }
    }
}

/// Ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: String,
    pub transaction_type: TransactionType,
    pub chain: Chain,
    pub token: String,
    pub amount: Decimal,
    pub tx_hash: String,
    pub status: TransactionStatus,
    pub confirmations: u64,
    pub block_number: u64,
    pub from_address: String,
    pub to_address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Transaction {
    /// A new pending deposit for an observed event
    pub fn deposit(event: &DepositEvent, user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            transaction_type: TransactionType::Deposit,
            chain: event.chain,
            token: event.token_symbol.clone(),
            amount: event.amount,
            tx_hash: event.tx_hash.clone(),
            status: TransactionStatus::Pending,
            confirmations: event.confirmations,
            block_number: event.block_number,
            from_address: event.from_address.clone(),
            to_address: event.to_address.clone(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            failure_reason: None,
        }
    }

    pub fn key(&self) -> DepositKey {
        DepositKey {
            chain: self.chain,
            tx_hash: self.tx_hash.clone(),
            to_address: self.to_address.clone(),
        }
    }

    /// Reject an event in another token than the deposit stored under its key
    pub fn ensure_same_token(&self, event: &DepositEvent) -> Result<()> {
        if self.token == event.token_symbol {
            return Ok(());
        }

        Err(ServiceError::DepositConflict {
            deposit: self.key().to_string(),
            stored: self.token.clone(),
            token: event.token_symbol.clone(),
        })
    }
}

/// Result of an atomic completion attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Moved from pending to completed and credited by this call
    Completed(Transaction),
    /// Already completed earlier; nothing changed
    AlreadyCompleted(Transaction),
    /// Parked as failed; nothing changed
    Failed(Transaction),
}

impl Settlement {
    pub fn transaction(&self) -> &Transaction {
        match self {
            Settlement::Completed(tx) | Settlement::AlreadyCompleted(tx) | Settlement::Failed(tx) => tx,
        }
    }

    pub fn into_transaction(self) -> Transaction {
        match self {
            Settlement::Completed(tx) | Settlement::AlreadyCompleted(tx) | Settlement::Failed(tx) => tx,
        }
    }
}

/// Deposit and balance persistence.
///
/// There is at most one deposit per natural key. The pending to completed
/// transition and the balance credit are applied together, once.
#[async_trait]
pub trait LedgerRepository: UserAccountStore {
    /// Create a pending deposit, or raise the confirmations of a pending one.
    /// Completed and failed deposits are returned unchanged.
    async fn upsert_pending(&self, event: &DepositEvent, user_id: &str) -> Result<Transaction>;

    /// Look up or create the deposit and, if it is pending, mark it completed
    /// and credit its stored amount in one atomic step
    async fn complete_deposit(&self, event: &DepositEvent, user_id: &str) -> Result<Settlement>;

    /// Look up or create the deposit and park it as failed unless it is
    /// already completed.
    ///
    /// Every write fails with `DepositConflict`, changing nothing, when the
    /// key is already stored with another token.
    async fn fail_deposit(&self, event: &DepositEvent, user_id: &str, reason: &str) -> Result<Transaction>;

    async fn find_deposit(&self, key: &DepositKey) -> Result<Option<Transaction>>;

    /// Newest first
    async fn transactions_for_user(&self, user_id: &str) -> Result<Vec<Transaction>>;
}

#[derive(Default)]
struct LedgerTables {
    deposits: HashMap<DepositKey, Transaction>,
    balances: HashMap<(String, String), UserBalance>,
}

impl LedgerTables {
    fn deposit_entry(&mut self, event: &DepositEvent, user_id: &str, now: DateTime<Utc>) -> Result<&mut Transaction> {
        let tx = self
            .deposits
            .entry(event.key())
            .or_insert_with(|| Transaction::deposit(event, user_id, now));
        tx.ensure_same_token(event)?;
        Ok(tx)
    }
}

/// In-memory implementation of LedgerRepository
#[derive(Default)]
pub struct InMemoryLedgerRepository {
    tables: RwLock<LedgerTables>,
}

impl InMemoryLedgerRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserAccountStore for InMemoryLedgerRepository {
    async fn get_balances(&self, user_id: &str) -> Result<Vec<UserBalance>> {
        let tables = self.tables.read().await;
        let mut balances: Vec<UserBalance> = tables
            .balances
            .values()
            .filter(|balance| balance.user_id == user_id)
            .cloned()
            .collect();

        balances.sort_by(|a, b| a.token.cmp(&b.token));
        Ok(balances)
    }

    async fn get_balance(&self, user_id: &str, token: &str) -> Result<Decimal> {
        let tables = self.tables.read().await;
        Ok(tables
            .balances
            .get(&(user_id.to_string(), token.to_string()))
            .map(|balance| balance.amount)
            .unwrap_or_default())
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedgerRepository {
    async fn upsert_pending(&self, event: &DepositEvent, user_id: &str) -> Result<Transaction> {
        let now = Utc::now();
        let mut tables = self.tables.write().await;
        let tx = tables.deposit_entry(event, user_id, now)?;

        if tx.status == TransactionStatus::Pending && event.confirmations > tx.confirmations {
            tx.confirmations = event.confirmations;
            tx.updated_at = now;
        }

        Ok(tx.clone())
    }

    async fn complete_deposit(&self, event: &DepositEvent, user_id: &str) -> Result<Settlement> {
        let now = Utc::now();
        let mut tables = self.tables.write().await;
        let tx = tables.deposit_entry(event, user_id, now)?;

        match tx.status {
            TransactionStatus::Completed => return Ok(Settlement::AlreadyCompleted(tx.clone())),
            TransactionStatus::Failed => return Ok(Settlement::Failed(tx.clone())),
            TransactionStatus::Pending => {}
        }

        tx.status = TransactionStatus::Completed;
        tx.confirmations = tx.confirmations.max(event.confirmations);
        tx.completed_at = Some(now);
        tx.updated_at = now;
        let completed = tx.clone();

        let balance = tables
            .balances
            .entry((completed.user_id.clone(), completed.token.clone()))
            .or_insert_with(|| UserBalance {
                user_id: completed.user_id.clone(),
                token: completed.token.clone(),
                amount: Decimal::ZERO,
                updated_at: now,
            });
        balance.amount += completed.amount;
        balance.updated_at = now;

        Ok(Settlement::Completed(completed))
    }

    async fn fail_deposit(&self, event: &DepositEvent, user_id: &str, reason: &str) -> Result<Transaction> {
        let now = Utc::now();
        let mut tables = self.tables.write().await;
        let tx = tables.deposit_entry(event, user_id, now)?;

        if tx.status == TransactionStatus::Pending {
            tx.status = TransactionStatus::Failed;
            tx.failure_reason = Some(reason.to_string());
            tx.updated_at = now;
        }

        Ok(tx.clone())
    }

    async fn find_deposit(&self, key: &DepositKey) -> Result<Option<Transaction>> {
        Ok(self.tables.read().await.deposits.get(key).cloned())
    }

    async fn transactions_for_user(&self, user_id: &str) -> Result<Vec<Transaction>> {
        let tables = self.tables.read().await;
        let mut transactions: Vec<Transaction> = tables
            .deposits
            .values()
            .filter(|tx| tx.user_id == user_id)
            .cloned()
            .collect();

        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.block_number.cmp(&a.block_number)));
        Ok(transactions)
    }
}
