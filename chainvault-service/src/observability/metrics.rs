//! Deposit scanner metrics

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::info;

use chainvault_core::chain::Chain;

/// Per-chain scanner metrics
pub struct ScannerMetrics {
    pub registry: Registry,

    pub scan_cycles_total: IntCounterVec,
    pub scan_cycle_duration: HistogramVec,
    pub consecutive_failures: IntGaugeVec,
    pub checkpoint_position: IntGaugeVec,

    pub deposits_total: IntCounterVec,
}

impl ScannerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let scan_cycles_total = IntCounterVec::new(
            Opts::new("scan_cycles_total", "Scan cycles by chain and outcome").namespace("chainvault"),
            &["chain", "outcome"],
        )?;

        let scan_cycle_duration = HistogramVec::new(
            HistogramOpts::new("scan_cycle_duration_seconds", "Duration of scan cycles in seconds")
                .namespace("chainvault")
                .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["chain"],
        )?;

        let consecutive_failures = IntGaugeVec::new(
            Opts::new("scan_consecutive_failures", "Failed cycles since the last success").namespace("chainvault"),
            &["chain"],
        )?;

        let checkpoint_position = IntGaugeVec::new(
            Opts::new("scan_checkpoint_position", "Last saved block or slot").namespace("chainvault"),
            &["chain"],
        )?;

        let deposits_total = IntCounterVec::new(
            Opts::new("deposits_total", "Deposits handed to the ledger by chain and result").namespace("chainvault"),
            &["chain", "result"],
        )?;

        registry.register(Box::new(scan_cycles_total.clone()))?;
        registry.register(Box::new(scan_cycle_duration.clone()))?;
        registry.register(Box::new(consecutive_failures.clone()))?;
        registry.register(Box::new(checkpoint_position.clone()))?;
        registry.register(Box::new(deposits_total.clone()))?;

        Ok(Self {
            registry,
            scan_cycles_total,
            scan_cycle_duration,
            consecutive_failures,
            checkpoint_position,
            deposits_total,
        })
    }

    pub fn record_cycle(&self, chain: Chain, outcome: &str, seconds: f64) {
        self.scan_cycles_total
            .with_label_values(&[chain.as_str(), outcome])
            .inc();
        self.scan_cycle_duration
            .with_label_values(&[chain.as_str()])
            .observe(seconds);
    }

    pub fn record_deposit(&self, chain: Chain, result: &str) {
        self.deposits_total.with_label_values(&[chain.as_str(), result]).inc();
    }

    pub fn set_failures(&self, chain: Chain, failures: u32) {
        self.consecutive_failures
            .with_label_values(&[chain.as_str()])
            .set(i64::from(failures));
    }

    pub fn set_checkpoint(&self, chain: Chain, position: u64) {
        self.checkpoint_position
            .with_label_values(&[chain.as_str()])
            .set(i64::try_from(position).unwrap_or(i64::MAX));
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Create metrics endpoint router
pub fn create_metrics_router(metrics: Arc<ScannerMetrics>) -> Router {
    async fn metrics_handler(State(metrics): State<Arc<ScannerMetrics>>) -> Result<String, StatusCode> {
        metrics.render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    }

    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Serve `/metrics` until `shutdown` is cancelled
pub async fn serve_metrics(
    address: SocketAddr,
    metrics: Arc<ScannerMetrics>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(%address, "Metrics endpoint listening");

    axum::serve(listener, create_metrics_router(metrics))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_chain_labels() {
        let metrics = ScannerMetrics::new().unwrap();
        metrics.record_cycle(Chain::Polygon, "success", 0.3);
        metrics.record_deposit(Chain::Polygon, "completed");
        metrics.set_checkpoint(Chain::Polygon, 1_234);

        let text = metrics.render().unwrap();
        assert!(text.contains("chainvault_scan_cycles_total{chain=\"polygon\",outcome=\"success\"} 1"));
        assert!(text.contains("chainvault_deposits_total{chain=\"polygon\",result=\"completed\"} 1"));
        assert!(text.contains("chainvault_scan_checkpoint_position{chain=\"polygon\"} 1234"));
    }
}
