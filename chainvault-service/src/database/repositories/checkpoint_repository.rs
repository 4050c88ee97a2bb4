//! SQLx-based checkpoint repository

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use tracing::debug;

use chainvault_core::chain::{Chain, Checkpoint};

use crate::database::connection::DatabasePool;
use crate::database::{decode_timestamp, encode_timestamp, encode_u64};
use crate::error::Result;
use crate::models::checkpoint::{CheckpointRepository, ScanCheckpoint};

/// SQLx-based checkpoint repository implementation
#[derive(Clone)]
pub struct SqlxCheckpointRepository {
    pool: DatabasePool,
}

impl SqlxCheckpointRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointRepository for SqlxCheckpointRepository {
    async fn load(&self, chain: Chain) -> Result<Checkpoint> {
        let stored: Option<String> = sqlx::query_scalar("SELECT checkpoint FROM scan_checkpoints WHERE chain = $1")
            .bind(chain.as_str())
            .fetch_optional(self.pool.inner())
            .await?;

        match stored {
            Some(json) => Ok(Checkpoint::from_json(&json)?),
            None => Ok(Checkpoint::Start),
        }
    }

    async fn save(&self, chain: Chain, checkpoint: &Checkpoint) -> Result<bool> {
        // Same ordering as Checkpoint::is_at_or_after, decided in one statement
        let result = sqlx::query(
            r#"
            INSERT INTO scan_checkpoints (chain, checkpoint, position, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT(chain) DO UPDATE SET
                checkpoint = excluded.checkpoint,
                position = excluded.position,
                updated_at = excluded.updated_at
            WHERE json_extract(scan_checkpoints.checkpoint, '$.kind') = 'start'
               OR (json_extract(scan_checkpoints.checkpoint, '$.kind') = json_extract(excluded.checkpoint, '$.kind')
                   AND excluded.position >= scan_checkpoints.position)
            "#,
        )
        .bind(chain.as_str())
        .bind(checkpoint.to_json()?)
        .bind(encode_u64(checkpoint.position())?)
        .bind(encode_timestamp(&Utc::now()))
        .execute(self.pool.inner())
        .await?;

        let stored = result.rows_affected() == 1;
        debug!(%chain, %checkpoint, stored, "Checkpoint save");
        Ok(stored)
    }

    async fn list(&self) -> Result<Vec<ScanCheckpoint>> {
        let rows = sqlx::query("SELECT chain, checkpoint, updated_at FROM scan_checkpoints ORDER BY chain")
            .fetch_all(self.pool.inner())
            .await?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in rows {
            let chain: String = row.try_get("chain")?;
            let checkpoint: String = row.try_get("checkpoint")?;
            let updated_at: String = row.try_get("updated_at")?;

            checkpoints.push(ScanCheckpoint {
                chain: Chain::from_str(&chain)?,
                checkpoint: Checkpoint::from_json(&checkpoint)?,
                updated_at: decode_timestamp(&updated_at)?,
            });
        }

        checkpoints.sort_by_key(|stored| stored.chain);
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    async fn repository() -> SqlxCheckpointRepository {
        SqlxCheckpointRepository::new(DatabasePool::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_block_checkpoint_is_monotonic() {
        let repository = repository().await;
        assert_eq!(repository.load(Chain::Ethereum).await.unwrap(), Checkpoint::Start);

        assert!(repository.save(Chain::Ethereum, &Checkpoint::Block { number: 10 }).await.unwrap());
        assert!(repository.save(Chain::Ethereum, &Checkpoint::Block { number: 10 }).await.unwrap());
        assert!(!repository.save(Chain::Ethereum, &Checkpoint::Block { number: 9 }).await.unwrap());
        assert!(!repository.save(Chain::Ethereum, &Checkpoint::Start).await.unwrap());
        assert!(repository.save(Chain::Ethereum, &Checkpoint::Block { number: 42 }).await.unwrap());

        assert_eq!(
            repository.load(Chain::Ethereum).await.unwrap(),
            Checkpoint::Block { number: 42 }
        );
        assert_eq!(repository.load(Chain::Polygon).await.unwrap(), Checkpoint::Start);
    }

    #[tokio::test]
    async fn test_signature_checkpoint_round_trip() {
        let repository = repository().await;
        let checkpoint = Checkpoint::Signatures {
            slot: 250,
            cursors: BTreeMap::from([("SolA".to_string(), "sig-9".to_string())]),
        };

        assert!(repository.save(Chain::Solana, &checkpoint).await.unwrap());
        assert!(!repository.save(Chain::Solana, &Checkpoint::Block { number: 300 }).await.unwrap());
        assert_eq!(repository.load(Chain::Solana).await.unwrap(), checkpoint);

        let listed = repository.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].chain, Chain::Solana);
    }
}
