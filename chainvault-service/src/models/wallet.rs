//! Wallet data models

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use chainvault_core::account::AddressSet;
use chainvault_core::chain::Chain;

use crate::error::{Result, ServiceError};

/// A user's live wallet. The mnemonic is only held encrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletRecord {
    pub user_id: String,
    pub encrypted_mnemonic: String,
    pub addresses: AddressSet,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
}

/// A wallet replaced by a reset. Kept so an operator can recover funds sent
/// to a rotated address; never scanned.
#[derive(Debug, Clone, PartialEq)]
pub struct RetiredWallet {
    pub id: Uuid,
    pub user_id: String,
    pub encrypted_mnemonic: String,
    pub addresses: AddressSet,
    pub created_at: DateTime<Utc>,
    pub retired_at: DateTime<Utc>,
}

impl RetiredWallet {
    pub fn from_wallet(wallet: &WalletRecord, retired_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: wallet.user_id.clone(),
            encrypted_mnemonic: wallet.encrypted_mnemonic.clone(),
            addresses: wallet.addresses.clone(),
            created_at: wallet.created_at,
            retired_at,
        }
    }
}

/// Audit record of a mnemonic recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MnemonicRecovery {
    pub id: Uuid,
    pub user_id: String,
    pub operator: String,
    pub reason: String,
    pub recovered_at: DateTime<Utc>,
}

/// Addresses to scan, per chain
pub type MonitoredAddresses = HashMap<Chain, HashSet<String>>;

/// Wallet persistence.
///
/// Implementations keep the address to user index consistent with the
/// wallets in the same write: readers never see a wallet without its index
/// entries or a half replaced address set.
#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// Insert a new wallet. Fails with `WalletAlreadyExists` when the user
    /// has one and `AddressConflict` when an address is owned by another user.
    async fn insert_wallet(&self, wallet: &WalletRecord) -> Result<()>;

    /// Replace the user's wallet, archiving the previous one. Returns the
    /// archived wallet, if there was one.
    async fn replace_wallet(&self, wallet: &WalletRecord) -> Result<Option<RetiredWallet>>;

    async fn get_wallet(&self, user_id: &str) -> Result<Option<WalletRecord>>;

    /// Owner of a live address
    async fn owner_of(&self, chain: Chain, address: &str) -> Result<Option<String>>;

    async fn monitored_addresses(&self) -> Result<MonitoredAddresses>;

    async fn retired_wallets(&self, user_id: &str) -> Result<Vec<RetiredWallet>>;

    async fn record_recovery(&self, recovery: &MnemonicRecovery) -> Result<()>;

    async fn recoveries(&self, user_id: &str) -> Result<Vec<MnemonicRecovery>>;
}

#[derive(Default)]
struct WalletTables {
    wallets: HashMap<String, WalletRecord>,
    address_index: HashMap<(Chain, String), String>,
    retired: Vec<RetiredWallet>,
    recoveries: Vec<MnemonicRecovery>,
}

impl WalletTables {
    fn check_conflicts(&self, wallet: &WalletRecord) -> Result<()> {
        for (chain, address) in &wallet.addresses {
            if let Some(owner) = self.address_index.get(&(*chain, address.clone())) {
                if owner != &wallet.user_id {
                    return Err(ServiceError::AddressConflict {
                        chain: *chain,
                        address: address.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn index(&mut self, wallet: &WalletRecord) {
        for (chain, address) in &wallet.addresses {
            self.address_index
                .insert((*chain, address.clone()), wallet.user_id.clone());
        }
    }

    fn unindex(&mut self, wallet: &WalletRecord) {
        for (chain, address) in &wallet.addresses {
            self.address_index.remove(&(*chain, address.clone()));
        }
    }
}

/// In-memory implementation of WalletRepository
#[derive(Default)]
pub struct InMemoryWalletRepository {
    tables: RwLock<WalletTables>,
}

impl InMemoryWalletRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletRepository for InMemoryWalletRepository {
    async fn insert_wallet(&self, wallet: &WalletRecord) -> Result<()> {
        let mut tables = self.tables.write().await;

        if tables.wallets.contains_key(&wallet.user_id) {
            return Err(ServiceError::WalletAlreadyExists(wallet.user_id.clone()));
        }
        tables.check_conflicts(wallet)?;

        tables.index(wallet);
        tables.wallets.insert(wallet.user_id.clone(), wallet.clone());
        Ok(())
    }

    async fn replace_wallet(&self, wallet: &WalletRecord) -> Result<Option<RetiredWallet>> {
        let mut tables = self.tables.write().await;

        tables.check_conflicts(wallet)?;

        let retired = match tables.wallets.remove(&wallet.user_id) {
            Some(previous) => {
                tables.unindex(&previous);
                let retired = RetiredWallet::from_wallet(&previous, wallet.rotated_at.unwrap_or_else(Utc::now));
                tables.retired.push(retired.clone());
                Some(retired)
            }
            None => None,
        };

        tables.index(wallet);
        tables.wallets.insert(wallet.user_id.clone(), wallet.clone());
        Ok(retired)
    }

    async fn get_wallet(&self, user_id: &str) -> Result<Option<WalletRecord>> {
        Ok(self.tables.read().await.wallets.get(user_id).cloned())
    }

    async fn owner_of(&self, chain: Chain, address: &str) -> Result<Option<String>> {
        Ok(self
            .tables
            .read()
            .await
            .address_index
            .get(&(chain, address.to_string()))
            .cloned())
    }

    async fn monitored_addresses(&self) -> Result<MonitoredAddresses> {
        let tables = self.tables.read().await;
        let mut monitored = MonitoredAddresses::new();

        for (chain, address) in tables.address_index.keys() {
            monitored.entry(*chain).or_default().insert(address.clone());
        }

        Ok(monitored)
    }

    async fn retired_wallets(&self, user_id: &str) -> Result<Vec<RetiredWallet>> {
        Ok(self
            .tables
            .read()
            .await
            .retired
            .iter()
            .filter(|wallet| wallet.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn record_recovery(&self, recovery: &MnemonicRecovery) -> Result<()> {
        self.tables.write().await.recoveries.push(recovery.clone());
        Ok(())
    }

    async fn recoveries(&self, user_id: &str) -> Result<Vec<MnemonicRecovery>> {
        Ok(self
            .tables
            .read()
            .await
            .recoveries
            .iter()
            .filter(|recovery| recovery.user_id == user_id)
            .cloned()
            .collect())
    }
}
