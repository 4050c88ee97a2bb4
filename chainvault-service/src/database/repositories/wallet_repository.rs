//! SQLx-based wallet repository
//!
//! The `wallet_addresses` reverse index is written in the same transaction
//! as the wallet row it belongs to.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use chainvault_core::account::AddressSet;
use chainvault_core::chain::Chain;

use crate::database::connection::DatabasePool;
use crate::database::{decode_timestamp, encode_timestamp};
use crate::error::{Result, ServiceError};
use crate::models::wallet::{MnemonicRecovery, MonitoredAddresses, RetiredWallet, WalletRecord, WalletRepository};

/// SQLx-based wallet repository implementation
#[derive(Clone)]
pub struct SqlxWalletRepository {
    pool: DatabasePool,
}

impl SqlxWalletRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn insert_addresses(tx: &mut Transaction<'_, Sqlite>, wallet: &WalletRecord) -> Result<()> {
        for (chain, address) in &wallet.addresses {
            let owner: Option<String> =
                sqlx::query_scalar("SELECT user_id FROM wallet_addresses WHERE chain = $1 AND address = $2")
                    .bind(chain.as_str())
                    .bind(address)
                    .fetch_optional(&mut **tx)
                    .await?;

            if matches!(owner, Some(ref owner) if owner != &wallet.user_id) {
                return Err(ServiceError::AddressConflict {
                    chain: *chain,
                    address: address.clone(),
                });
            }

            sqlx::query("INSERT OR IGNORE INTO wallet_addresses (chain, address, user_id) VALUES ($1, $2, $3)")
                .bind(chain.as_str())
                .bind(address)
                .bind(&wallet.user_id)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    fn row_to_retired(row: &SqliteRow) -> Result<RetiredWallet> {
        let id: String = row.try_get("id")?;
        let addresses: String = row.try_get("addresses")?;
        let created_at: String = row.try_get("created_at")?;
        let retired_at: String = row.try_get("retired_at")?;

        Ok(RetiredWallet {
            id: Uuid::parse_str(&id).map_err(|e| ServiceError::DatabaseError(format!("Invalid id: {}", e)))?,
            user_id: row.try_get("user_id")?,
            encrypted_mnemonic: row.try_get("encrypted_mnemonic")?,
            addresses: serde_json::from_str(&addresses)
                .map_err(|e| ServiceError::DatabaseError(format!("Invalid retired address set: {}", e)))?,
            created_at: decode_timestamp(&created_at)?,
            retired_at: decode_timestamp(&retired_at)?,
        })
    }

    fn row_to_recovery(row: &SqliteRow) -> Result<MnemonicRecovery> {
        let id: String = row.try_get("id")?;
        let recovered_at: String = row.try_get("recovered_at")?;

        Ok(MnemonicRecovery {
            id: Uuid::parse_str(&id).map_err(|e| ServiceError::DatabaseError(format!("Invalid id: {}", e)))?,
            user_id: row.try_get("user_id")?,
            operator: row.try_get("operator")?,
            reason: row.try_get("reason")?,
            recovered_at: decode_timestamp(&recovered_at)?,
        })
    }
}

fn parse_address_rows(rows: &[SqliteRow]) -> Result<AddressSet> {
    let mut addresses = AddressSet::new();
    for row in rows {
        let chain: String = row.try_get("chain")?;
        addresses.insert(Chain::from_str(&chain)?, row.try_get("address")?);
    }
    Ok(addresses)
}

#[async_trait]
impl WalletRepository for SqlxWalletRepository {
    async fn insert_wallet(&self, wallet: &WalletRecord) -> Result<()> {
        let mut tx = self.pool.inner().begin().await?;

        sqlx::query("INSERT INTO wallets (user_id, encrypted_mnemonic, created_at, rotated_at) VALUES ($1, $2, $3, $4)")
            .bind(&wallet.user_id)
            .bind(&wallet.encrypted_mnemonic)
            .bind(encode_timestamp(&wallet.created_at))
            .bind(wallet.rotated_at.as_ref().map(encode_timestamp))
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    ServiceError::WalletAlreadyExists(wallet.user_id.clone())
                }
                e => ServiceError::DatabaseError(format!("Failed to create wallet: {}", e)),
            })?;

        Self::insert_addresses(&mut tx, wallet).await?;
        tx.commit().await?;

        info!(user_id = %wallet.user_id, addresses = wallet.addresses.len(), "Wallet stored");
        Ok(())
    }

    async fn replace_wallet(&self, wallet: &WalletRecord) -> Result<Option<RetiredWallet>> {
        let mut tx = self.pool.inner().begin().await?;

        // Unindex first so the only remaining owners are other users
        let old_rows = sqlx::query("DELETE FROM wallet_addresses WHERE user_id = $1 RETURNING chain, address")
            .bind(&wallet.user_id)
            .fetch_all(&mut *tx)
            .await?;
        let old_addresses = parse_address_rows(&old_rows)?;

        let previous = sqlx::query("SELECT encrypted_mnemonic, created_at FROM wallets WHERE user_id = $1")
            .bind(&wallet.user_id)
            .fetch_optional(&mut *tx)
            .await?;

        let retired = match previous {
            Some(row) => {
                let created_at: String = row.try_get("created_at")?;
                let previous = WalletRecord {
                    user_id: wallet.user_id.clone(),
                    encrypted_mnemonic: row.try_get("encrypted_mnemonic")?,
                    addresses: old_addresses,
                    created_at: decode_timestamp(&created_at)?,
                    rotated_at: None,
                };
                let retired = RetiredWallet::from_wallet(&previous, wallet.rotated_at.unwrap_or_else(Utc::now));
                let addresses = serde_json::to_string(&retired.addresses)
                    .map_err(|e| ServiceError::DatabaseError(format!("Failed to encode address set: {}", e)))?;

                sqlx::query(
                    r#"
                    INSERT INTO retired_wallets (id, user_id, encrypted_mnemonic, addresses, created_at, retired_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(retired.id.to_string())
                .bind(&retired.user_id)
                .bind(&retired.encrypted_mnemonic)
                .bind(addresses)
                .bind(encode_timestamp(&retired.created_at))
                .bind(encode_timestamp(&retired.retired_at))
                .execute(&mut *tx)
                .await?;

                Some(retired)
            }
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO wallets (user_id, encrypted_mnemonic, created_at, rotated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT(user_id) DO UPDATE SET
                encrypted_mnemonic = excluded.encrypted_mnemonic,
                created_at = excluded.created_at,
                rotated_at = excluded.rotated_at
            "#,
        )
        .bind(&wallet.user_id)
        .bind(&wallet.encrypted_mnemonic)
        .bind(encode_timestamp(&wallet.created_at))
        .bind(wallet.rotated_at.as_ref().map(encode_timestamp))
        .execute(&mut *tx)
        .await?;

        Self::insert_addresses(&mut tx, wallet).await?;
        tx.commit().await?;

        info!(user_id = %wallet.user_id, archived = retired.is_some(), "Wallet replaced");
        Ok(retired)
    }

    async fn get_wallet(&self, user_id: &str) -> Result<Option<WalletRecord>> {
        debug!(user_id, "Fetching wallet");

        let row = sqlx::query("SELECT user_id, encrypted_mnemonic, created_at, rotated_at FROM wallets WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(self.pool.inner())
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let address_rows = sqlx::query("SELECT chain, address FROM wallet_addresses WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(self.pool.inner())
            .await?;

        let created_at: String = row.try_get("created_at")?;
        let rotated_at: Option<String> = row.try_get("rotated_at")?;

        Ok(Some(WalletRecord {
            user_id: row.try_get("user_id")?,
            encrypted_mnemonic: row.try_get("encrypted_mnemonic")?,
            addresses: parse_address_rows(&address_rows)?,
            created_at: decode_timestamp(&created_at)?,
            rotated_at: rotated_at.as_deref().map(decode_timestamp).transpose()?,
        }))
    }

    async fn owner_of(&self, chain: Chain, address: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT user_id FROM wallet_addresses WHERE chain = $1 AND address = $2")
                .bind(chain.as_str())
                .bind(address)
                .fetch_optional(self.pool.inner())
                .await?,
        )
    }

    async fn monitored_addresses(&self) -> Result<MonitoredAddresses> {
        let rows = sqlx::query("SELECT chain, address FROM wallet_addresses")
            .fetch_all(self.pool.inner())
            .await?;

        let mut monitored = MonitoredAddresses::new();
        for row in rows {
            let chain: String = row.try_get("chain")?;
            monitored
                .entry(Chain::from_str(&chain)?)
                .or_default()
                .insert(row.try_get("address")?);
        }
        Ok(monitored)
    }

    async fn retired_wallets(&self, user_id: &str) -> Result<Vec<RetiredWallet>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, encrypted_mnemonic, addresses, created_at, retired_at
            FROM retired_wallets WHERE user_id = $1 ORDER BY retired_at
            "#,
        )
        .bind(user_id)
        .fetch_all(self.pool.inner())
        .await?;

        rows.iter().map(Self::row_to_retired).collect()
    }

    async fn record_recovery(&self, recovery: &MnemonicRecovery) -> Result<()> {
        sqlx::query(
            "INSERT INTO mnemonic_recoveries (id, user_id, operator, reason, recovered_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(recovery.id.to_string())
        .bind(&recovery.user_id)
        .bind(&recovery.operator)
        .bind(&recovery.reason)
        .bind(encode_timestamp(&recovery.recovered_at))
        .execute(self.pool.inner())
        .await
        .map_err(|e| ServiceError::DatabaseError(format!("Failed to record recovery: {}", e)))?;
        Ok(())
    }

    async fn recoveries(&self, user_id: &str) -> Result<Vec<MnemonicRecovery>> {
        let rows = sqlx::query(
            "SELECT id, user_id, operator, reason, recovered_at FROM mnemonic_recoveries WHERE user_id = $1 ORDER BY recovered_at",
        )
        .bind(user_id)
        .fetch_all(self.pool.inner())
        .await?;

        rows.iter().map(Self::row_to_recovery).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet(user_id: &str, eth: &str, sol: &str) -> WalletRecord {
        WalletRecord {
            user_id: user_id.to_string(),
            encrypted_mnemonic: format!("sealed-{}", user_id),
            addresses: AddressSet::from([(Chain::Ethereum, eth.to_string()), (Chain::Solana, sol.to_string())]),
            created_at: Utc::now(),
            rotated_at: None,
        }
    }

    async fn repository() -> SqlxWalletRepository {
        SqlxWalletRepository::new(DatabasePool::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let repository = repository().await;
        repository.insert_wallet(&wallet("alice", "0xaa", "SolA")).await.unwrap();

        let stored = repository.get_wallet("alice").await.unwrap().unwrap();
        assert_eq!(stored.addresses[&Chain::Ethereum], "0xaa");
        assert_eq!(stored.encrypted_mnemonic, "sealed-alice");
        assert_eq!(repository.owner_of(Chain::Solana, "SolA").await.unwrap().as_deref(), Some("alice"));
        assert_eq!(repository.owner_of(Chain::Bsc, "0xaa").await.unwrap(), None);
        assert!(repository.get_wallet("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_wallet_and_conflicting_address() {
        let repository = repository().await;
        repository.insert_wallet(&wallet("alice", "0xaa", "SolA")).await.unwrap();

        assert!(matches!(
            repository.insert_wallet(&wallet("alice", "0xbb", "SolB")).await,
            Err(ServiceError::WalletAlreadyExists(_))
        ));
        assert!(matches!(
            repository.insert_wallet(&wallet("bob", "0xaa", "SolB")).await,
            Err(ServiceError::AddressConflict { chain: Chain::Ethereum, .. })
        ));

        // the failed insert left nothing behind
        assert!(repository.get_wallet("bob").await.unwrap().is_none());
        assert_eq!(repository.owner_of(Chain::Solana, "SolB").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replace_archives_previous_wallet() {
        let repository = repository().await;
        repository.insert_wallet(&wallet("alice", "0xaa", "SolA")).await.unwrap();

        let mut next = wallet("alice", "0xcc", "SolC");
        next.rotated_at = Some(Utc::now());
        let retired = repository.replace_wallet(&next).await.unwrap().unwrap();
        assert_eq!(retired.addresses[&Chain::Ethereum], "0xaa");

        assert_eq!(repository.owner_of(Chain::Ethereum, "0xaa").await.unwrap(), None);
        assert_eq!(repository.owner_of(Chain::Ethereum, "0xcc").await.unwrap().as_deref(), Some("alice"));

        let archived = repository.retired_wallets("alice").await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].id, retired.id);
        assert_eq!(archived[0].addresses, retired.addresses);
        assert_eq!(archived[0].encrypted_mnemonic, "sealed-alice");

        let monitored = repository.monitored_addresses().await.unwrap();
        assert_eq!(monitored[&Chain::Solana].len(), 1);
        assert!(monitored[&Chain::Solana].contains("SolC"));
    }

    #[tokio::test]
    async fn test_recovery_audit_trail() {
        let repository = repository().await;
        let recovery = MnemonicRecovery {
            id: Uuid::new_v4(),
            user_id: "alice".to_string(),
            operator: "ops-1".to_string(),
            reason: "support ticket".to_string(),
            recovered_at: Utc::now(),
        };
        repository.record_recovery(&recovery).await.unwrap();

        let stored = repository.recoveries("alice").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].operator, "ops-1");
        assert!(repository.recoveries("bob").await.unwrap().is_empty());
    }
}
