//! Tests for the DepositScanner

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use tokio_util::sync::CancellationToken;

    use chainvault_core::account::KeyDerivationService;
    use chainvault_core::chain::{Chain, ChainClient, Checkpoint, DepositEvent, PollOutcome};

    use crate::error::ServiceError;
    use crate::models::checkpoint::{CheckpointRepository, InMemoryCheckpointRepository};
    use crate::models::transaction::{InMemoryLedgerRepository, TransactionStatus};
    use crate::models::wallet::InMemoryWalletRepository;
    use crate::observability::ScannerMetrics;
    use crate::services::ledger::Ledger;
    use crate::services::scanner::{backoff_delay, DepositScanner, ScanState, ScannerSettings};
    use crate::services::wallet_store::WalletStore;
    use crate::storage::MnemonicVault;

    enum Step {
        Respond(PollOutcome),
        Fail,
        Hang,
    }

    /// Chain client that plays back a script, then reports nothing new
    struct ScriptedClient {
        chain: Chain,
        script: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<(usize, Checkpoint)>>,
    }

    impl ScriptedClient {
        fn new(chain: Chain, steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                chain,
                script: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChainClient for ScriptedClient {
        fn chain(&self) -> Chain {
            self.chain
        }

        async fn poll_incoming(
            &self,
            addresses: &HashSet<String>,
            checkpoint: &Checkpoint,
        ) -> chainvault_core::Result<PollOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push((addresses.len(), checkpoint.clone()));

            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Step::Respond(outcome)) => Ok(outcome),
                Some(Step::Fail) => Err(chainvault_core::Error::chain_unavailable(self.chain, "HTTP 503")),
                Some(Step::Hang) => std::future::pending().await,
                None => Ok(PollOutcome::empty(checkpoint.clone())),
            }
        }
    }

    struct Harness {
        wallets: Arc<WalletStore>,
        ledger: Arc<Ledger>,
        checkpoints: Arc<InMemoryCheckpointRepository>,
    }

    impl Harness {
        fn new() -> Self {
            let wallets = Arc::new(WalletStore::new(
                Arc::new(InMemoryWalletRepository::new()),
                MnemonicVault::new(&[9u8; 32]),
                KeyDerivationService::default(),
            ));
            let ledger = Arc::new(Ledger::new(
                Arc::new(InMemoryLedgerRepository::new()),
                ["ETH", "BNB", "SOL", "USDT"].iter().map(|token| token.to_string()),
            ));

            Self {
                wallets,
                ledger,
                checkpoints: Arc::new(InMemoryCheckpointRepository::new()),
            }
        }

        fn scanner(&self, cycle_timeout: Duration) -> DepositScanner {
            DepositScanner::new(
                self.wallets.clone(),
                self.ledger.clone(),
                self.checkpoints.clone(),
                ScannerSettings {
                    cycle_timeout,
                    max_backoff: Duration::from_secs(300),
                },
            )
        }
    }

    fn eth_event(to_address: &str, token: &str, confirmations: u64) -> DepositEvent {
        DepositEvent {
            chain: Chain::Ethereum,
            tx_hash: "0xfeed".to_string(),
            from_address: "0x1111111111111111111111111111111111111111".to_string(),
            to_address: to_address.to_string(),
            owner_address: to_address.to_string(),
            token_symbol: token.to_string(),
            amount: Decimal::new(5, 1),
            unrepresentable_units: None,
            block_number: 100,
            confirmations,
            observed_at: Utc::now(),
        }
    }

    fn respond(events: Vec<DepositEvent>, block: u64) -> Step {
        Step::Respond(PollOutcome {
            events,
            checkpoint: Checkpoint::Block { number: block },
        })
    }

    #[tokio::test]
    async fn test_half_eth_moves_from_pending_to_completed() {
        let harness = Harness::new();
        let alice = harness.wallets.create_wallet("alice").await.unwrap();
        let address = alice.addresses[&Chain::Ethereum].clone();

        let client = ScriptedClient::new(
            Chain::Ethereum,
            vec![
                respond(vec![eth_event(&address, "ETH", 3)], 97),
                respond(vec![eth_event(&address, "ETH", 12)], 105),
                respond(vec![eth_event(&address, "ETH", 13)], 106),
            ],
        );
        let mut scanner = harness.scanner(Duration::from_secs(5));
        scanner.add_chain(client.clone(), 12, Duration::from_secs(15));

        let first = scanner.scan_chain(Chain::Ethereum).await.unwrap();
        assert_eq!(first.pending, 1);
        assert_eq!(harness.ledger.balance("alice", "ETH").await.unwrap(), Decimal::ZERO);
        let history = harness.ledger.transaction_history("alice").await.unwrap();
        assert_eq!(history[0].status, TransactionStatus::Pending);

        let second = scanner.scan_chain(Chain::Ethereum).await.unwrap();
        assert_eq!(second.completed, 1);
        assert_eq!(harness.ledger.balance("alice", "ETH").await.unwrap(), Decimal::new(5, 1));

        let third = scanner.scan_chain(Chain::Ethereum).await.unwrap();
        assert_eq!(third.already_completed, 1);
        assert_eq!(harness.ledger.balance("alice", "ETH").await.unwrap(), Decimal::new(5, 1));
        assert_eq!(third.checkpoint, Checkpoint::Block { number: 106 });

        // every poll saw the address set and the previous checkpoint
        let seen = client.seen.lock().unwrap().clone();
        assert_eq!(seen[0], (1, Checkpoint::Start));
        assert_eq!(seen[1], (1, Checkpoint::Block { number: 97 }));
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_ignored() {
        let harness = Harness::new();
        let client = ScriptedClient::new(
            Chain::Ethereum,
            vec![respond(
                vec![eth_event("0x2222222222222222222222222222222222222222", "ETH", 50)],
                120,
            )],
        );
        let mut scanner = harness.scanner(Duration::from_secs(5));
        scanner.add_chain(client, 12, Duration::from_secs(15));

        let report = scanner.scan_chain(Chain::Ethereum).await.unwrap();
        assert_eq!(report.ignored, 1);
        assert_eq!(report.completed, 0);
        assert!(report.checkpoint_saved);
    }

    #[tokio::test]
    async fn test_unknown_token_parks_without_failing_cycle() {
        let harness = Harness::new();
        let alice = harness.wallets.create_wallet("alice").await.unwrap();
        let address = alice.addresses[&Chain::Ethereum].clone();

        let client = ScriptedClient::new(Chain::Ethereum, vec![respond(vec![eth_event(&address, "DOGE", 20)], 130)]);
        let mut scanner = harness.scanner(Duration::from_secs(5));
        scanner.add_chain(client, 12, Duration::from_secs(15));

        let report = scanner.scan_chain(Chain::Ethereum).await.unwrap();
        assert_eq!(report.parked, 1);
        assert_eq!(report.checkpoint, Checkpoint::Block { number: 130 });

        let history = harness.ledger.transaction_history("alice").await.unwrap();
        assert_eq!(history[0].status, TransactionStatus::Failed);
        assert!(harness.ledger.balances("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_native_and_token_account_deposits_in_one_transaction() {
        let harness = Harness::new();
        let alice = harness.wallets.create_wallet("alice").await.unwrap();
        let wallet = alice.addresses[&Chain::Solana].clone();

        let mut sol = eth_event(&wallet, "SOL", 32);
        sol.chain = Chain::Solana;
        sol.tx_hash = "5sigBoth".to_string();
        sol.amount = Decimal::new(1, 1);

        // the token deposit lands in alice's token account, not the wallet
        let mut usdt = sol.clone();
        usdt.to_address = "AliceUsdtTokenAccount111111111111111111111".to_string();
        usdt.token_symbol = "USDT".to_string();
        usdt.amount = Decimal::from(50);

        let client = ScriptedClient::new(
            Chain::Solana,
            vec![Step::Respond(PollOutcome {
                events: vec![sol, usdt],
                checkpoint: Checkpoint::Start,
            })],
        );
        let mut scanner = harness.scanner(Duration::from_secs(5));
        scanner.add_chain(client, 32, Duration::from_secs(15));

        let report = scanner.scan_chain(Chain::Solana).await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(report.ignored, 0);
        assert_eq!(harness.ledger.balance("alice", "SOL").await.unwrap(), Decimal::new(1, 1));
        assert_eq!(harness.ledger.balance("alice", "USDT").await.unwrap(), Decimal::from(50));
        assert_eq!(harness.ledger.transaction_history("alice").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unrepresentable_amount_is_parked() {
        let harness = Harness::new();
        let alice = harness.wallets.create_wallet("alice").await.unwrap();
        let address = alice.addresses[&Chain::Ethereum].clone();

        let mut huge = eth_event(&address, "USDT", 20);
        huge.amount = Decimal::ZERO;
        huge.unrepresentable_units = Some("100000000000000000000000000000".to_string());

        let client = ScriptedClient::new(Chain::Ethereum, vec![respond(vec![huge], 140)]);
        let mut scanner = harness.scanner(Duration::from_secs(5));
        scanner.add_chain(client, 12, Duration::from_secs(15));

        let report = scanner.scan_chain(Chain::Ethereum).await.unwrap();
        assert_eq!(report.parked, 1);
        assert_eq!(report.completed, 0);
        assert_eq!(report.checkpoint, Checkpoint::Block { number: 140 });

        let history = harness.ledger.transaction_history("alice").await.unwrap();
        assert_eq!(history[0].status, TransactionStatus::Failed);
        assert!(history[0]
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("100000000000000000000000000000"));
        assert!(harness.ledger.balances("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_token_on_same_key_is_reported_not_credited() {
        let harness = Harness::new();
        let alice = harness.wallets.create_wallet("alice").await.unwrap();
        let address = alice.addresses[&Chain::Ethereum].clone();

        let client = ScriptedClient::new(
            Chain::Ethereum,
            vec![respond(vec![eth_event(&address, "USDT", 20), eth_event(&address, "ETH", 20)], 150)],
        );
        let metrics = Arc::new(ScannerMetrics::new().unwrap());
        let mut scanner = harness.scanner(Duration::from_secs(5)).with_metrics(metrics.clone());
        scanner.add_chain(client, 12, Duration::from_secs(15));

        let report = scanner.scan_chain(Chain::Ethereum).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.conflicts, 1);
        assert!(report.checkpoint_saved);
        assert!(metrics
            .render()
            .unwrap()
            .contains("chainvault_deposits_total{chain=\"ethereum\",result=\"conflict\"} 1"));

        // events are applied in token order, so ETH is the one recorded
        assert_eq!(harness.ledger.balance("alice", "ETH").await.unwrap(), Decimal::new(5, 1));
        assert_eq!(harness.ledger.balance("alice", "USDT").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_checkpoint_never_moves_backwards() {
        let harness = Harness::new();
        let client = ScriptedClient::new(Chain::Ethereum, vec![respond(vec![], 100), respond(vec![], 50)]);
        let mut scanner = harness.scanner(Duration::from_secs(5));
        scanner.add_chain(client, 12, Duration::from_secs(15));

        assert!(scanner.scan_chain(Chain::Ethereum).await.unwrap().checkpoint_saved);

        let report = scanner.scan_chain(Chain::Ethereum).await.unwrap();
        assert!(!report.checkpoint_saved);
        assert_eq!(report.checkpoint, Checkpoint::Block { number: 100 });
        assert_eq!(
            harness.checkpoints.load(Chain::Ethereum).await.unwrap(),
            Checkpoint::Block { number: 100 }
        );
    }

    #[tokio::test]
    async fn test_failing_chains_do_not_affect_others() {
        let harness = Harness::new();
        let alice = harness.wallets.create_wallet("alice").await.unwrap();
        let address = alice.addresses[&Chain::Ethereum].clone();

        let ethereum = ScriptedClient::new(Chain::Ethereum, vec![Step::Fail]);
        let bsc = ScriptedClient::new(Chain::Bsc, vec![Step::Hang]);
        let mut polygon_event = eth_event(&address, "ETH", 200);
        polygon_event.chain = Chain::Polygon;
        polygon_event.token_symbol = "USDT".to_string();
        let polygon = ScriptedClient::new(Chain::Polygon, vec![respond(vec![polygon_event], 900)]);

        let mut scanner = harness.scanner(Duration::from_millis(200));
        scanner.add_chain(ethereum, 12, Duration::from_secs(15));
        scanner.add_chain(bsc, 15, Duration::from_secs(10));
        scanner.add_chain(polygon, 64, Duration::from_secs(10));

        let results = scanner.scan_once().await;
        assert_eq!(results.len(), 3);
        for (chain, result) in &results {
            match chain {
                Chain::Polygon => assert_eq!(result.as_ref().unwrap().completed, 1),
                _ => assert!(matches!(result, Err(e) if e.is_transient())),
            }
        }

        assert_eq!(harness.ledger.balance("alice", "USDT").await.unwrap(), Decimal::new(5, 1));
        assert_eq!(harness.checkpoints.load(Chain::Ethereum).await.unwrap(), Checkpoint::Start);
        assert_eq!(harness.checkpoints.load(Chain::Bsc).await.unwrap(), Checkpoint::Start);

        let status = scanner.status().await;
        let ethereum = status.iter().find(|s| s.chain == Chain::Ethereum).unwrap();
        assert_eq!(
            ethereum.state,
            ScanState::Backoff {
                failures: 1,
                retry_in: Duration::from_secs(30)
            }
        );
        assert!(ethereum.last_error.as_deref().unwrap().contains("503"));

        let polygon = status.iter().find(|s| s.chain == Chain::Polygon).unwrap();
        assert_eq!(polygon.state, ScanState::Idle);
        assert!(polygon.last_success.is_some());
    }

    #[tokio::test]
    async fn test_failures_accumulate_and_reset() {
        let harness = Harness::new();
        let client = ScriptedClient::new(Chain::Ethereum, vec![Step::Fail, Step::Fail, respond(vec![], 10)]);
        let mut scanner = harness.scanner(Duration::from_secs(5));
        scanner.add_chain(client, 12, Duration::from_secs(15));

        assert!(scanner.scan_chain(Chain::Ethereum).await.is_err());
        assert!(scanner.scan_chain(Chain::Ethereum).await.is_err());
        assert_eq!(scanner.status().await[0].consecutive_failures, 2);

        scanner.scan_chain(Chain::Ethereum).await.unwrap();
        let status = &scanner.status().await[0];
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.checkpoint, Some(Checkpoint::Block { number: 10 }));
    }

    #[tokio::test]
    async fn test_unscanned_chain_is_rejected() {
        let harness = Harness::new();
        let scanner = harness.scanner(Duration::from_secs(5));
        assert!(matches!(
            scanner.scan_chain(Chain::Solana).await,
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let max = Duration::from_secs(300);
        let interval = Duration::from_secs(10);

        assert_eq!(backoff_delay(interval, 1, max), Duration::from_secs(20));
        assert_eq!(backoff_delay(interval, 3, max), Duration::from_secs(80));
        assert_eq!(backoff_delay(interval, 6, max), max);
        assert_eq!(backoff_delay(interval, u32::MAX, max), max);
    }

    #[test]
    fn test_backoff_never_undercuts_poll_interval() {
        let interval = Duration::from_secs(600);
        let max = Duration::from_secs(300);

        assert_eq!(backoff_delay(interval, 1, max), interval);
        assert_eq!(backoff_delay(interval, 10, max), interval);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let harness = Harness::new();
        let client = ScriptedClient::new(Chain::Solana, vec![]);
        let metrics = Arc::new(ScannerMetrics::new().unwrap());
        let mut scanner = harness.scanner(Duration::from_secs(5)).with_metrics(metrics.clone());
        scanner.add_chain(client.clone(), 32, Duration::from_millis(10));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(scanner).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        assert!(client.calls() >= 2);
        assert!(metrics.render().unwrap().contains("chain=\"solana\",outcome=\"success\""));
    }
}
