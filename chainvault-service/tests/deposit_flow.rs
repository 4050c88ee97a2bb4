//! End-to-end deposit flow over an on-disk database

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tempfile::TempDir;

use chainvault_core::chain::{Chain, ChainClient, Checkpoint, DepositEvent, PollOutcome};
use chainvault_service::config::Config;
use chainvault_service::models::TransactionStatus;
use chainvault_service::services::{DepositScanner, ScannerSettings};
use chainvault_service::AppState;

const KEY: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";

/// Chain client replaying a fixed list of poll results
struct ReplayClient {
    chain: Chain,
    outcomes: Mutex<Vec<PollOutcome>>,
}

impl ReplayClient {
    fn new(chain: Chain, mut outcomes: Vec<PollOutcome>) -> Arc<Self> {
        outcomes.reverse();
        Arc::new(Self {
            chain,
            outcomes: Mutex::new(outcomes),
        })
    }
}

#[async_trait]
impl ChainClient for ReplayClient {
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn poll_incoming(
        &self,
        _addresses: &HashSet<String>,
        checkpoint: &Checkpoint,
    ) -> chainvault_core::Result<PollOutcome> {
        let next = self.outcomes.lock().unwrap().pop();
        Ok(next.unwrap_or_else(|| PollOutcome::empty(checkpoint.clone())))
    }
}

fn config(dir: &Path) -> Config {
    let mut config = Config::from_toml_str(&format!(
        r#"
        supported_tokens = ["ETH", "SOL", "USDC"]

        [database]
        url = "sqlite://{}?mode=rwc"

        [security]
        encryption_key = "{}"
        "#,
        dir.join("chainvault.db").display(),
        KEY
    ))
    .unwrap();
    config.validate().unwrap();
    config
}

fn scanner(state: &AppState) -> DepositScanner {
    DepositScanner::new(
        state.wallets.clone(),
        state.ledger.clone(),
        state.checkpoints.clone(),
        ScannerSettings {
            cycle_timeout: Duration::from_secs(10),
            max_backoff: Duration::from_secs(60),
        },
    )
}

fn event(chain: Chain, to_address: &str, token: &str, amount: Decimal, block: u64, confirmations: u64) -> DepositEvent {
    DepositEvent {
        chain,
        tx_hash: format!("tx-{}-{}", chain, block),
        from_address: "sender".to_string(),
        to_address: to_address.to_string(),
        owner_address: to_address.to_string(),
        token_symbol: token.to_string(),
        amount,
        unrepresentable_units: None,
        block_number: block,
        confirmations,
        observed_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_deposits_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());

    let state = AppState::from_config(&config).await.unwrap();
    let alice = state.wallets.create_wallet("alice").await.unwrap();
    let eth_address = alice.addresses[&Chain::Ethereum].clone();
    let sol_address = alice.addresses[&Chain::Solana].clone();

    let half = Decimal::new(5, 1);
    let ethereum = ReplayClient::new(
        Chain::Ethereum,
        vec![
            PollOutcome {
                events: vec![event(Chain::Ethereum, &eth_address, "ETH", half, 1_000, 4)],
                checkpoint: Checkpoint::Block { number: 996 },
            },
            PollOutcome {
                events: vec![event(Chain::Ethereum, &eth_address, "ETH", half, 1_000, 12)],
                checkpoint: Checkpoint::Block { number: 1_004 },
            },
        ],
    );
    let solana = ReplayClient::new(
        Chain::Solana,
        vec![PollOutcome {
            events: vec![
                event(Chain::Solana, &sol_address, "SOL", Decimal::new(25, 1), 500, 32),
                event(Chain::Solana, &sol_address, "USDC", Decimal::new(10, 0), 501, 1),
            ],
            checkpoint: Checkpoint::Signatures {
                slot: 500,
                cursors: BTreeMap::from([(sol_address.clone(), "sig-500".to_string())]),
            },
        }],
    );

    let mut deposit_scanner = scanner(&state);
    deposit_scanner.add_chain(ethereum, 12, Duration::from_secs(15));
    deposit_scanner.add_chain(solana, 32, Duration::from_secs(5));

    for (_, result) in deposit_scanner.scan_once().await {
        result.unwrap();
    }
    assert_eq!(state.ledger.balance("alice", "ETH").await.unwrap(), Decimal::ZERO);
    assert_eq!(state.ledger.balance("alice", "SOL").await.unwrap(), Decimal::new(25, 1));

    for (_, result) in deposit_scanner.scan_once().await {
        result.unwrap();
    }
    assert_eq!(state.ledger.balance("alice", "ETH").await.unwrap(), half);
    state.database_pool.close().await;

    // reopen the same database
    let reopened = AppState::from_config(&config).await.unwrap();
    assert_eq!(reopened.wallets.get_addresses("alice").await.unwrap(), alice.addresses);
    assert_eq!(reopened.ledger.balance("alice", "ETH").await.unwrap(), half);

    let history = reopened.ledger.transaction_history("alice").await.unwrap();
    assert_eq!(history.len(), 3);
    let usdc = history.iter().find(|tx| tx.token == "USDC").unwrap();
    assert_eq!(usdc.status, TransactionStatus::Pending);
    assert_eq!(usdc.confirmations, 1);

    assert_eq!(
        reopened.checkpoints.load(Chain::Ethereum).await.unwrap(),
        Checkpoint::Block { number: 1_004 }
    );
    assert!(matches!(
        reopened.checkpoints.load(Chain::Solana).await.unwrap(),
        Checkpoint::Signatures { slot: 500, .. }
    ));

    let recovered = reopened.wallets.recover_mnemonic("alice", "ops-1", "restart test").await.unwrap();
    assert_eq!(recovered, alice.mnemonic);
}

#[tokio::test]
async fn test_example_configuration_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../chainvault.example.toml");
    let mut config = Config::from_toml_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    config.security.encryption_key = Some(KEY.to_string());

    let warnings = config.validate().unwrap();
    assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
    assert_eq!(
        config.enabled_chains().map(|chain| chain.chain).collect::<Vec<_>>(),
        vec![Chain::Ethereum, Chain::Bsc, Chain::Solana]
    );
}
