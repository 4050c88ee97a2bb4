//! Deposit scanner
//!
//! One loop per chain: load the monitored addresses and the checkpoint, poll
//! the chain, hand every event for a known address to the ledger, then save
//! the checkpoint. A failing or slow chain backs off on its own schedule and
//! never delays the others.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use chainvault_core::chain::{sort_events, Chain, ChainClient, Checkpoint};

use crate::error::{Result, ServiceError};
use crate::models::checkpoint::CheckpointRepository;
use crate::models::transaction::Settlement;
use crate::observability::ScannerMetrics;
use crate::services::ledger::Ledger;
use crate::services::wallet_store::WalletStore;

/// Largest backoff exponent; keeps the shift well inside `u32`
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Scheduling state of one chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    Backoff { failures: u32, retry_in: Duration },
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Idle => write!(f, "idle"),
            ScanState::Scanning => write!(f, "scanning"),
            ScanState::Backoff { failures, retry_in } => {
                write!(f, "backoff ({} failures, retry in {}s)", failures, retry_in.as_secs())
            }
        }
    }
}

/// Diagnostic view of one chain
#[derive(Debug, Clone, PartialEq)]
pub struct ChainStatus {
    pub chain: Chain,
    pub state: ScanState,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub checkpoint: Option<Checkpoint>,
}

impl ChainStatus {
    fn new(chain: Chain) -> Self {
        Self {
            chain,
            state: ScanState::Idle,
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
            checkpoint: None,
        }
    }
}

/// What one successful cycle did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub events: usize,
    pub ignored: usize,
    pub pending: usize,
    pub completed: usize,
    pub already_completed: usize,
    pub parked: usize,
    /// Deposits whose key is already recorded in another token
    pub conflicts: usize,
    pub checkpoint: Checkpoint,
    pub checkpoint_saved: bool,
}

/// Scanner-wide timing limits
#[derive(Debug, Clone, Copy)]
pub struct ScannerSettings {
    pub cycle_timeout: Duration,
    pub max_backoff: Duration,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            cycle_timeout: Duration::from_secs(120),
            max_backoff: Duration::from_secs(300),
        }
    }
}

struct ChainWorker {
    client: Arc<dyn ChainClient>,
    required_confirmations: u64,
    poll_interval: Duration,
}

/// Per-chain deposit scanner
pub struct DepositScanner {
    wallets: Arc<WalletStore>,
    ledger: Arc<Ledger>,
    checkpoints: Arc<dyn CheckpointRepository>,
    settings: ScannerSettings,
    workers: BTreeMap<Chain, ChainWorker>,
    status: RwLock<BTreeMap<Chain, ChainStatus>>,
    metrics: Option<Arc<ScannerMetrics>>,
}

impl DepositScanner {
    pub fn new(
        wallets: Arc<WalletStore>,
        ledger: Arc<Ledger>,
        checkpoints: Arc<dyn CheckpointRepository>,
        settings: ScannerSettings,
    ) -> Self {
        Self {
            wallets,
            ledger,
            checkpoints,
            settings,
            workers: BTreeMap::new(),
            status: RwLock::new(BTreeMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ScannerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Scan `client`'s chain, crediting at `required_confirmations` and
    /// polling every `poll_interval`. Replaces an earlier client of the same
    /// chain.
    pub fn add_chain(&mut self, client: Arc<dyn ChainClient>, required_confirmations: u64, poll_interval: Duration) {
        let chain = client.chain();
        self.status.get_mut().insert(chain, ChainStatus::new(chain));
        self.workers.insert(
            chain,
            ChainWorker {
                client,
                required_confirmations,
                poll_interval,
            },
        );
    }

    pub fn chains(&self) -> Vec<Chain> {
        self.workers.keys().copied().collect()
    }

    /// Snapshot of every chain's state
    pub async fn status(&self) -> Vec<ChainStatus> {
        self.status.read().await.values().cloned().collect()
    }

    /// Run one cycle on every chain concurrently
    pub async fn scan_once(&self) -> Vec<(Chain, Result<CycleReport>)> {
        let cycles = self.workers.keys().map(|chain| async move {
            let (result, _) = self.cycle(*chain).await;
            (*chain, result)
        });
        join_all(cycles).await
    }

    /// Run one cycle on a single chain
    pub async fn scan_chain(&self, chain: Chain) -> Result<CycleReport> {
        self.cycle(chain).await.0
    }

    /// Scan every chain until `shutdown` is cancelled. A cycle in flight
    /// when shutdown arrives runs to completion.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(chains = ?self.chains(), "Deposit scanner starting");

        let handles: Vec<_> = self
            .chains()
            .into_iter()
            .map(|chain| {
                let scanner = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { scanner.chain_loop(chain, shutdown).await })
            })
            .collect();

        for handle in join_all(handles).await {
            if let Err(e) = handle {
                error!(error = %e, "Chain scan task aborted");
            }
        }

        info!("Deposit scanner stopped");
    }

    async fn chain_loop(&self, chain: Chain, shutdown: CancellationToken) {
        info!(%chain, "Chain scan loop started");

        while !shutdown.is_cancelled() {
            let (_, delay) = self.cycle(chain).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(%chain, "Chain scan loop stopped");
    }

    /// One bounded cycle with its bookkeeping. Returns the result and the
    /// delay before the next cycle.
    async fn cycle(&self, chain: Chain) -> (Result<CycleReport>, Duration) {
        let Some(worker) = self.workers.get(&chain) else {
            return (
                Err(ServiceError::InvalidInput(format!("Chain {} is not scanned", chain))),
                self.settings.max_backoff,
            );
        };

        self.set_state(chain, ScanState::Scanning).await;
        let started = Instant::now();

        let result = match tokio::time::timeout(self.settings.cycle_timeout, self.run_cycle(chain, worker)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Core(chainvault_core::Error::chain_unavailable(
                chain,
                format!("scan cycle exceeded {}s", self.settings.cycle_timeout.as_secs()),
            ))),
        };
        let elapsed = started.elapsed().as_secs_f64();

        let mut status = self.status.write().await;
        let entry = status.entry(chain).or_insert_with(|| ChainStatus::new(chain));

        let delay = match &result {
            Ok(report) => {
                entry.state = ScanState::Idle;
                entry.consecutive_failures = 0;
                entry.last_success = Some(Utc::now());
                entry.checkpoint = Some(report.checkpoint.clone());

                if let Some(metrics) = &self.metrics {
                    metrics.record_cycle(chain, "success", elapsed);
                    metrics.set_failures(chain, 0);
                    metrics.set_checkpoint(chain, report.checkpoint.position());
                }
                worker.poll_interval
            }
            Err(e) => {
                let failures = entry.consecutive_failures.saturating_add(1);
                let retry_in = backoff_delay(worker.poll_interval, failures, self.settings.max_backoff);

                entry.state = ScanState::Backoff { failures, retry_in };
                entry.consecutive_failures = failures;
                entry.last_error = Some(e.to_string());

                if e.is_transient() {
                    warn!(%chain, failures, retry_in_secs = retry_in.as_secs(), error = %e, "Chain unavailable, backing off");
                } else {
                    error!(%chain, failures, retry_in_secs = retry_in.as_secs(), error = %e, "Scan cycle failed");
                }

                if let Some(metrics) = &self.metrics {
                    metrics.record_cycle(chain, if e.is_transient() { "unavailable" } else { "failure" }, elapsed);
                    metrics.set_failures(chain, failures);
                }
                retry_in
            }
        };

        (result, delay)
    }

    #[instrument(skip(self, worker), fields(confirmations = worker.required_confirmations))]
    async fn run_cycle(&self, chain: Chain, worker: &ChainWorker) -> Result<CycleReport> {
        let monitored = self.wallets.get_all_monitored_addresses().await?;
        let addresses: HashSet<String> = monitored.get(&chain).cloned().unwrap_or_default();
        let checkpoint = self.checkpoints.load(chain).await?;

        debug!(addresses = addresses.len(), %checkpoint, "Polling chain");
        let outcome = worker.client.poll_incoming(&addresses, &checkpoint).await?;

        let mut events = outcome.events;
        sort_events(&mut events);

        let mut report = CycleReport {
            events: events.len(),
            ..CycleReport::default()
        };

        for event in &events {
            if event.chain != chain {
                warn!(key = %event.key(), "Event from another chain, ignoring");
                report.ignored += 1;
                continue;
            }

            let Some(user_id) = self.wallets.owner_of(chain, &event.owner_address).await? else {
                debug!(key = %event.key(), owner = %event.owner_address, "No wallet owns the recipient, ignoring");
                report.ignored += 1;
                continue;
            };

            if event.confirmations < worker.required_confirmations {
                match self.ledger.record_pending(event, &user_id).await {
                    Ok(_) => {
                        report.pending += 1;
                        self.record_deposit(chain, "pending");
                    }
                    Err(ServiceError::DepositConflict { deposit, stored, token }) => {
                        self.record_conflict(chain, &mut report, &deposit, &stored, &token);
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            match self.ledger.finalize_deposit(event, &user_id).await {
                Ok(Settlement::Completed(_)) => {
                    report.completed += 1;
                    self.record_deposit(chain, "completed");
                }
                Ok(Settlement::AlreadyCompleted(_)) => report.already_completed += 1,
                Ok(Settlement::Failed(_)) => report.parked += 1,
                Err(ServiceError::UnknownToken { token, deposit }) => {
                    warn!(%token, %deposit, "Deposit in unsupported token parked for reconciliation");
                    report.parked += 1;
                    self.record_deposit(chain, "parked");
                }
                Err(ServiceError::UnrepresentableAmount { deposit, units, token }) => {
                    error!(%deposit, %units, %token, "Deposit amount not representable, parked for reconciliation");
                    report.parked += 1;
                    self.record_deposit(chain, "parked");
                }
                Err(ServiceError::DepositConflict { deposit, stored, token }) => {
                    self.record_conflict(chain, &mut report, &deposit, &stored, &token);
                }
                Err(e) => return Err(e),
            }
        }

        report.checkpoint_saved = self.checkpoints.save(chain, &outcome.checkpoint).await?;
        if !report.checkpoint_saved {
            warn!(checkpoint = %outcome.checkpoint, "Client checkpoint is behind the stored one, keeping stored");
        }
        report.checkpoint = self.checkpoints.load(chain).await?;

        if report.events > 0 {
            info!(
                events = report.events,
                pending = report.pending,
                completed = report.completed,
                parked = report.parked,
                conflicts = report.conflicts,
                checkpoint = %report.checkpoint,
                "Scan cycle finished"
            );
        } else {
            debug!(checkpoint = %report.checkpoint, "Scan cycle finished, nothing new");
        }

        Ok(report)
    }

    async fn set_state(&self, chain: Chain, state: ScanState) {
        self.status
            .write()
            .await
            .entry(chain)
            .or_insert_with(|| ChainStatus::new(chain))
            .state = state;
    }

    fn record_deposit(&self, chain: Chain, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_deposit(chain, result);
        }
    }

    /// The event is skipped so the chain keeps moving; the transfer needs
    /// manual reconciliation.
    fn record_conflict(&self, chain: Chain, report: &mut CycleReport, deposit: &str, stored: &str, token: &str) {
        error!(%deposit, %stored, %token, "Deposit key already recorded in another token, not recording");
        report.conflicts += 1;
        self.record_deposit(chain, "conflict");
    }
}

/// `interval * 2^failures`, capped at `max` but never below `interval`
pub fn backoff_delay(interval: Duration, failures: u32, max: Duration) -> Duration {
    let factor = 1u32 << failures.min(MAX_BACKOFF_EXPONENT);
    interval.checked_mul(factor).unwrap_or(max).min(max).max(interval)
}
