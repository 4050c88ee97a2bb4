//! SQLx-based ledger repository
//!
//! Every transition is a conditional update on `status = 'pending'`, and the
//! completion and balance credit share one database transaction. Each write
//! transaction opens with a write so SQLite takes the write lock up front.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info};
use uuid::Uuid;

use chainvault_core::chain::{Chain, DepositEvent, DepositKey};

use crate::database::connection::DatabasePool;
use crate::database::{decode_decimal, decode_timestamp, decode_u64, encode_timestamp, encode_u64};
use crate::error::{Result, ServiceError};
use crate::models::balance::{UserAccountStore, UserBalance};
use crate::models::transaction::{LedgerRepository, Settlement, Transaction, TransactionStatus};

const TRANSACTION_COLUMNS: &str = "id, user_id, transaction_type, chain, token, amount, tx_hash, status, \
     confirmations, block_number, from_address, to_address, created_at, updated_at, completed_at, failure_reason";

/// SQLx-based ledger implementation
#[derive(Clone)]
pub struct SqlxLedgerRepository {
    pool: DatabasePool,
}

impl SqlxLedgerRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Insert the event as a pending deposit unless its key is already known
    async fn insert_if_absent(
        conn: &mut SqliteConnection,
        event: &DepositEvent,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let tx = Transaction::deposit(event, user_id, now);

        sqlx::query(
            r#"
            INSERT INTO deposit_transactions
                (id, user_id, transaction_type, chain, token, amount, tx_hash, status,
                 confirmations, block_number, from_address, to_address, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT(chain, tx_hash, to_address) DO NOTHING
            "#,
        )
        .bind(tx.id.to_string())
        .bind(&tx.user_id)
        .bind(tx.transaction_type.to_string())
        .bind(tx.chain.as_str())
        .bind(&tx.token)
        .bind(tx.amount.to_string())
        .bind(&tx.tx_hash)
        .bind(tx.status.to_string())
        .bind(encode_u64(tx.confirmations)?)
        .bind(encode_u64(tx.block_number)?)
        .bind(&tx.from_address)
        .bind(&tx.to_address)
        .bind(encode_timestamp(&now))
        .bind(encode_timestamp(&now))
        .execute(&mut *conn)
        .await
        .map_err(|e| ServiceError::DatabaseError(format!("Failed to record deposit: {}", e)))?;

        Ok(())
    }

    async fn fetch_by_key(conn: &mut SqliteConnection, key: &DepositKey) -> Result<Option<Transaction>> {
        let query = format!(
            "SELECT {} FROM deposit_transactions WHERE chain = $1 AND tx_hash = $2 AND to_address = $3",
            TRANSACTION_COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(key.chain.as_str())
            .bind(&key.tx_hash)
            .bind(&key.to_address)
            .fetch_optional(&mut *conn)
            .await?;

        row.as_ref().map(row_to_transaction).transpose()
    }

    async fn fetch_existing(conn: &mut SqliteConnection, key: &DepositKey) -> Result<Transaction> {
        Self::fetch_by_key(conn, key)
            .await?
            .ok_or_else(|| ServiceError::DatabaseError(format!("Deposit {} vanished inside its transaction", key)))
    }

    /// Insert the event if its key is new and check the stored deposit is in
    /// the same token. On a conflict the caller's transaction is dropped and
    /// rolls back.
    async fn insert_checked(
        conn: &mut SqliteConnection,
        event: &DepositEvent,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        Self::insert_if_absent(conn, event, user_id, now).await?;
        Self::fetch_existing(conn, &event.key()).await?.ensure_same_token(event)
    }

    async fn credit_balance(conn: &mut SqliteConnection, deposit: &Transaction, now: DateTime<Utc>) -> Result<Decimal> {
        let current: Option<String> = sqlx::query_scalar("SELECT amount FROM user_balances WHERE user_id = $1 AND token = $2")
            .bind(&deposit.user_id)
            .bind(&deposit.token)
            .fetch_optional(&mut *conn)
            .await?;

        let current = current.as_deref().map(decode_decimal).transpose()?.unwrap_or_default();
        let updated = current
            .checked_add(deposit.amount)
            .ok_or_else(|| ServiceError::DatabaseError(format!("Balance overflow for {} {}", deposit.user_id, deposit.token)))?;

        sqlx::query(
            r#"
            INSERT INTO user_balances (user_id, token, amount, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT(user_id, token) DO UPDATE SET
                amount = excluded.amount,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&deposit.user_id)
        .bind(&deposit.token)
        .bind(updated.to_string())
        .bind(encode_timestamp(&now))
        .execute(&mut *conn)
        .await?;

        Ok(updated)
    }
}

fn row_to_transaction(row: &SqliteRow) -> Result<Transaction> {
    let id: String = row.try_get("id")?;
    let transaction_type: String = row.try_get("transaction_type")?;
    let chain: String = row.try_get("chain")?;
    let amount: String = row.try_get("amount")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    Ok(Transaction {
        id: Uuid::parse_str(&id).map_err(|e| ServiceError::DatabaseError(format!("Invalid id: {}", e)))?,
        user_id: row.try_get("user_id")?,
        transaction_type: transaction_type.parse()?,
        chain: Chain::from_str(&chain)?,
        token: row.try_get("token")?,
        amount: decode_decimal(&amount)?,
        tx_hash: row.try_get("tx_hash")?,
        status: status.parse()?,
        confirmations: decode_u64(row.try_get("confirmations")?)?,
        block_number: decode_u64(row.try_get("block_number")?)?,
        from_address: row.try_get("from_address")?,
        to_address: row.try_get("to_address")?,
        created_at: decode_timestamp(&created_at)?,
        updated_at: decode_timestamp(&updated_at)?,
        completed_at: completed_at.as_deref().map(decode_timestamp).transpose()?,
        failure_reason: row.try_get("failure_reason")?,
    })
}

fn row_to_balance(row: &SqliteRow) -> Result<UserBalance> {
    let amount: String = row.try_get("amount")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(UserBalance {
        user_id: row.try_get("user_id")?,
        token: row.try_get("token")?,
        amount: decode_decimal(&amount)?,
        updated_at: decode_timestamp(&updated_at)?,
    })
}

#[async_trait]
impl UserAccountStore for SqlxLedgerRepository {
    async fn get_balances(&self, user_id: &str) -> Result<Vec<UserBalance>> {
        let rows = sqlx::query("SELECT user_id, token, amount, updated_at FROM user_balances WHERE user_id = $1 ORDER BY token")
            .bind(user_id)
            .fetch_all(self.pool.inner())
            .await?;

        rows.iter().map(row_to_balance).collect()
    }

    async fn get_balance(&self, user_id: &str, token: &str) -> Result<Decimal> {
        let amount: Option<String> = sqlx::query_scalar("SELECT amount FROM user_balances WHERE user_id = $1 AND token = $2")
            .bind(user_id)
            .bind(token)
            .fetch_optional(self.pool.inner())
            .await?;

        Ok(amount.as_deref().map(decode_decimal).transpose()?.unwrap_or_default())
    }
}

#[async_trait]
impl LedgerRepository for SqlxLedgerRepository {
    async fn upsert_pending(&self, event: &DepositEvent, user_id: &str) -> Result<Transaction> {
        let now = Utc::now();
        let mut tx = self.pool.inner().begin().await?;

        Self::insert_checked(&mut tx, event, user_id, now).await?;

        sqlx::query(
            r#"
            UPDATE deposit_transactions SET confirmations = $1, updated_at = $2
            WHERE chain = $3 AND tx_hash = $4 AND to_address = $5
              AND status = 'pending' AND confirmations < $1
            "#,
        )
        .bind(encode_u64(event.confirmations)?)
        .bind(encode_timestamp(&now))
        .bind(event.chain.as_str())
        .bind(&event.tx_hash)
        .bind(&event.to_address)
        .execute(&mut *tx)
        .await?;

        let stored = Self::fetch_existing(&mut tx, &event.key()).await?;
        tx.commit().await?;

        debug!(key = %event.key(), confirmations = stored.confirmations, status = %stored.status, "Pending deposit recorded");
        Ok(stored)
    }

    async fn complete_deposit(&self, event: &DepositEvent, user_id: &str) -> Result<Settlement> {
        let now = Utc::now();
        let key = event.key();
        let mut tx = self.pool.inner().begin().await?;

        Self::insert_checked(&mut tx, event, user_id, now).await?;

        let completed = sqlx::query(
            r#"
            UPDATE deposit_transactions
            SET status = 'completed', confirmations = MAX(confirmations, $1), completed_at = $2, updated_at = $2
            WHERE chain = $3 AND tx_hash = $4 AND to_address = $5 AND status = 'pending'
            "#,
        )
        .bind(encode_u64(event.confirmations)?)
        .bind(encode_timestamp(&now))
        .bind(key.chain.as_str())
        .bind(&key.tx_hash)
        .bind(&key.to_address)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let stored = Self::fetch_existing(&mut tx, &key).await?;

        let settlement = if completed {
            let balance = Self::credit_balance(&mut tx, &stored, now).await?;
            info!(
                key = %key,
                user_id = %stored.user_id,
                token = %stored.token,
                amount = %stored.amount,
                balance = %balance,
                "Deposit completed and credited"
            );
            Settlement::Completed(stored)
        } else if stored.status == TransactionStatus::Failed {
            Settlement::Failed(stored)
        } else {
            Settlement::AlreadyCompleted(stored)
        };

        tx.commit().await?;
        Ok(settlement)
    }

    async fn fail_deposit(&self, event: &DepositEvent, user_id: &str, reason: &str) -> Result<Transaction> {
        let now = Utc::now();
        let mut tx = self.pool.inner().begin().await?;

        Self::insert_checked(&mut tx, event, user_id, now).await?;

        sqlx::query(
            r#"
            UPDATE deposit_transactions SET status = 'failed', failure_reason = $1, updated_at = $2
            WHERE chain = $3 AND tx_hash = $4 AND to_address = $5 AND status = 'pending'
            "#,
        )
        .bind(reason)
        .bind(encode_timestamp(&now))
        .bind(event.chain.as_str())
        .bind(&event.tx_hash)
        .bind(&event.to_address)
        .execute(&mut *tx)
        .await?;

        let stored = Self::fetch_existing(&mut tx, &event.key()).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn find_deposit(&self, key: &DepositKey) -> Result<Option<Transaction>> {
        let mut conn = self.pool.inner().acquire().await?;
        Self::fetch_by_key(&mut conn, key).await
    }

    async fn transactions_for_user(&self, user_id: &str) -> Result<Vec<Transaction>> {
        let query = format!(
            "SELECT {} FROM deposit_transactions WHERE user_id = $1 ORDER BY created_at DESC, block_number DESC",
            TRANSACTION_COLUMNS
        );

        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(self.pool.inner())
            .await?;

        rows.iter().map(row_to_transaction).collect()
    }
}
