//! Per-user wallet custody
//!
//! One live wallet per user. The seed phrase is sealed before it reaches a
//! repository and only leaves the store twice: once in the `NewWallet`
//! returned by creation or reset, and through the audited recovery path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use chainvault_core::account::{AddressSet, KeyDerivationService};
use chainvault_core::chain::Chain;
use chainvault_core::crypto::SecretMnemonic;

use crate::error::{Result, ServiceError};
use crate::models::wallet::{MnemonicRecovery, MonitoredAddresses, RetiredWallet, WalletRecord, WalletRepository};
use crate::storage::MnemonicVault;

/// A freshly created wallet, including its phrase. Hand the phrase to the
/// user once and drop it; it is zeroized on drop.
#[derive(Debug)]
pub struct NewWallet {
    pub user_id: String,
    pub mnemonic: SecretMnemonic,
    pub addresses: AddressSet,
    pub created_at: DateTime<Utc>,
}

/// Wallet custody service
pub struct WalletStore {
    repository: Arc<dyn WalletRepository>,
    vault: MnemonicVault,
    derivation: KeyDerivationService,
}

impl WalletStore {
    pub fn new(repository: Arc<dyn WalletRepository>, vault: MnemonicVault, derivation: KeyDerivationService) -> Self {
        Self {
            repository,
            vault,
            derivation,
        }
    }

    /// Create the user's wallet. Fails with `WalletAlreadyExists` when the
    /// user already has a live one.
    #[instrument(skip(self))]
    pub async fn create_wallet(&self, user_id: &str) -> Result<NewWallet> {
        validate_user_id(user_id)?;

        if self.repository.get_wallet(user_id).await?.is_some() {
            return Err(ServiceError::WalletAlreadyExists(user_id.to_string()));
        }

        let (record, wallet) = self.seal_new_wallet(user_id, None)?;
        self.repository.insert_wallet(&record).await?;

        info!(user_id, chains = wallet.addresses.len(), "Wallet created");
        Ok(wallet)
    }

    /// Replace the user's wallet with a new phrase. The previous wallet is
    /// archived and its addresses stop being scanned.
    #[instrument(skip(self))]
    pub async fn reset_wallet(&self, user_id: &str) -> Result<NewWallet> {
        validate_user_id(user_id)?;

        let (record, wallet) = self.seal_new_wallet(user_id, Some(Utc::now()))?;
        let retired = self.repository.replace_wallet(&record).await?;

        match retired {
            Some(retired) => info!(user_id, retired_id = %retired.id, "Wallet reset, previous wallet archived"),
            None => info!(user_id, "Wallet reset without a previous wallet"),
        }
        Ok(wallet)
    }

    pub async fn get_addresses(&self, user_id: &str) -> Result<AddressSet> {
        self.repository
            .get_wallet(user_id)
            .await?
            .map(|wallet| wallet.addresses)
            .ok_or_else(|| ServiceError::WalletNotFound(user_id.to_string()))
    }

    pub async fn get_all_monitored_addresses(&self) -> Result<MonitoredAddresses> {
        self.repository.monitored_addresses().await
    }

    /// Owner of a live deposit address. Addresses that are not valid on the
    /// chain belong to nobody.
    pub async fn owner_of(&self, chain: Chain, address: &str) -> Result<Option<String>> {
        let address = match chain.normalize_address(address) {
            Ok(address) => address,
            Err(e) => {
                debug!(%chain, address, error = %e, "Not a deposit address");
                return Ok(None);
            }
        };

        self.repository.owner_of(chain, &address).await
    }

    /// Decrypt a user's phrase for an operator. The audit record is written
    /// before anything is decrypted.
    pub async fn recover_mnemonic(&self, user_id: &str, operator: &str, reason: &str) -> Result<SecretMnemonic> {
        if operator.trim().is_empty() || reason.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "Mnemonic recovery requires an operator and a reason".to_string(),
            ));
        }

        let wallet = self
            .repository
            .get_wallet(user_id)
            .await?
            .ok_or_else(|| ServiceError::WalletNotFound(user_id.to_string()))?;

        let recovery = MnemonicRecovery {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            operator: operator.to_string(),
            reason: reason.to_string(),
            recovered_at: Utc::now(),
        };
        self.repository.record_recovery(&recovery).await?;

        warn!(
            target: "audit",
            recovery_id = %recovery.id,
            user_id,
            operator,
            reason,
            "Mnemonic recovered"
        );

        self.vault.decrypt(user_id, &wallet.encrypted_mnemonic)
    }

    pub async fn retired_wallets(&self, user_id: &str) -> Result<Vec<RetiredWallet>> {
        self.repository.retired_wallets(user_id).await
    }

    pub async fn recoveries(&self, user_id: &str) -> Result<Vec<MnemonicRecovery>> {
        self.repository.recoveries(user_id).await
    }

    fn seal_new_wallet(&self, user_id: &str, rotated_at: Option<DateTime<Utc>>) -> Result<(WalletRecord, NewWallet)> {
        let (mnemonic, addresses) = self.derivation.generate()?;
        let created_at = Utc::now();

        let record = WalletRecord {
            user_id: user_id.to_string(),
            encrypted_mnemonic: self.vault.encrypt(user_id, &mnemonic)?,
            addresses: addresses.clone(),
            created_at,
            rotated_at,
        };

        let wallet = NewWallet {
            user_id: user_id.to_string(),
            mnemonic,
            addresses,
            created_at,
        };

        Ok((record, wallet))
    }
}

fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(ServiceError::InvalidInput("User id must not be empty".to_string()));
    }
    if user_id.len() > 128 {
        return Err(ServiceError::InvalidInput("User id is longer than 128 characters".to_string()));
    }
    Ok(())
}
