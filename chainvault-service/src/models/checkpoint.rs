//! Scan checkpoint models

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use chainvault_core::chain::{Chain, Checkpoint};

use crate::error::Result;

/// Stored checkpoint of one chain
#[derive(Debug, Clone, PartialEq)]
pub struct ScanCheckpoint {
    pub chain: Chain,
    pub checkpoint: Checkpoint,
    pub updated_at: DateTime<Utc>,
}

/// Checkpoint persistence
#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    /// `Checkpoint::Start` when nothing is stored
    async fn load(&self, chain: Chain) -> Result<Checkpoint>;

    /// Store `checkpoint` unless it would move the chain backwards. Returns
    /// whether it was stored.
    async fn save(&self, chain: Chain, checkpoint: &Checkpoint) -> Result<bool>;

    async fn list(&self) -> Result<Vec<ScanCheckpoint>>;
}

/// In-memory implementation of CheckpointRepository
#[derive(Default)]
pub struct InMemoryCheckpointRepository {
    checkpoints: RwLock<HashMap<Chain, ScanCheckpoint>>,
}

impl InMemoryCheckpointRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointRepository for InMemoryCheckpointRepository {
    async fn load(&self, chain: Chain) -> Result<Checkpoint> {
        Ok(self
            .checkpoints
            .read()
            .await
            .get(&chain)
            .map(|stored| stored.checkpoint.clone())
            .unwrap_or_default())
    }

    async fn save(&self, chain: Chain, checkpoint: &Checkpoint) -> Result<bool> {
        let mut checkpoints = self.checkpoints.write().await;

        if let Some(stored) = checkpoints.get(&chain) {
            if !checkpoint.is_at_or_after(&stored.checkpoint) {
                return Ok(false);
            }
        }

        checkpoints.insert(
            chain,
            ScanCheckpoint {
                chain,
                checkpoint: checkpoint.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<ScanCheckpoint>> {
        let mut checkpoints: Vec<ScanCheckpoint> = self.checkpoints.read().await.values().cloned().collect();
        checkpoints.sort_by_key(|stored| stored.chain);
        Ok(checkpoints)
    }
}
