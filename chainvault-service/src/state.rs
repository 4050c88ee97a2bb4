//! Application state management

use std::sync::Arc;

use tracing::info;

use chainvault_core::account::KeyDerivationService;
use chainvault_core::chain::ChainClientFactory;

use crate::config::Config;
use crate::database::connection::DatabasePool;
use crate::database::repositories::{SqlxCheckpointRepository, SqlxLedgerRepository, SqlxWalletRepository};
use crate::error::{Result, ServiceError};
use crate::models::checkpoint::CheckpointRepository;
use crate::observability::ScannerMetrics;
use crate::services::{DepositScanner, Ledger, ScannerSettings, WalletStore};
use crate::storage::MnemonicVault;

/// Services shared by the scanner and the CLI commands
pub struct AppState {
    /// Database connection pool
    pub database_pool: DatabasePool,
    /// Wallet custody
    pub wallets: Arc<WalletStore>,
    /// Deposit ledger and balances
    pub ledger: Arc<Ledger>,
    /// Per-chain scan positions
    pub checkpoints: Arc<dyn CheckpointRepository>,
    pub metrics: Arc<ScannerMetrics>,
}

impl AppState {
    /// Connect to the database and assemble the services
    pub async fn from_config(config: &Config) -> Result<Self> {
        let database_pool = DatabasePool::connect(&config.database).await?;

        let vault = MnemonicVault::new(&*config.encryption_key()?);
        let derivation = KeyDerivationService::new(config.mnemonic_strength()?);

        let wallets = Arc::new(WalletStore::new(
            Arc::new(SqlxWalletRepository::new(database_pool.clone())),
            vault,
            derivation,
        ));
        let ledger = Arc::new(Ledger::new(
            Arc::new(SqlxLedgerRepository::new(database_pool.clone())),
            config.supported_token_set(),
        ));
        let checkpoints: Arc<dyn CheckpointRepository> = Arc::new(SqlxCheckpointRepository::new(database_pool.clone()));

        let metrics = Arc::new(
            ScannerMetrics::new().map_err(|e| ServiceError::ConfigError(format!("Failed to register metrics: {}", e)))?,
        );

        info!(supported_tokens = config.supported_tokens.len(), "Application state initialized");

        Ok(Self {
            database_pool,
            wallets,
            ledger,
            checkpoints,
            metrics,
        })
    }

    /// Build a scanner over every enabled chain
    pub fn build_scanner(&self, config: &Config) -> Result<DepositScanner> {
        let settings = ScannerSettings {
            cycle_timeout: config.scanner.cycle_timeout(),
            max_backoff: config.scanner.max_backoff(),
        };

        let mut scanner = DepositScanner::new(
            self.wallets.clone(),
            self.ledger.clone(),
            self.checkpoints.clone(),
            settings,
        )
        .with_metrics(self.metrics.clone());

        for chain in config.enabled_chains() {
            let client = ChainClientFactory::create(&chain.client_config(&config.scanner))?;
            info!(
                chain = %chain.chain,
                confirmations = chain.required_confirmations(),
                interval_secs = chain.poll_interval().as_secs(),
                "Chain registered for scanning"
            );
            scanner.add_chain(client, chain.required_confirmations(), chain.poll_interval());
        }

        Ok(scanner)
    }
}
