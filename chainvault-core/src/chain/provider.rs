//! Chain client configuration and construction

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::evm::EvmChainClient;
use super::solana::SolanaChainClient;
use super::{Chain, ChainClient, ChainFamily};
use crate::error::{Error, Result};

/// RPC endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider URL
    pub url: String,
    /// API key, appended as the last path segment when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl ProviderConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// The URL requests are sent to
    pub fn endpoint(&self) -> String {
        match &self.api_key {
            Some(key) if !key.is_empty() => format!("{}/{}", self.url.trim_end_matches('/'), key),
            _ => self.url.clone(),
        }
    }
}

/// A token watched for deposits: an ERC-20 contract on EVM chains, an SPL
/// mint on Solana
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenContract {
    pub symbol: String,
    /// Contract address or mint
    pub contract: String,
    pub decimals: u32,
}

/// Scan limits for one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    pub required_confirmations: u64,
    /// Largest block range fetched in one EVM poll
    pub max_blocks_per_poll: u64,
    /// How far behind the tip a fresh EVM checkpoint starts
    pub initial_lookback_blocks: u64,
    /// Fixed first block for a fresh EVM checkpoint, overrides the lookback
    pub start_block: Option<u64>,
    /// Concurrent RPC requests per poll
    pub rpc_concurrency: usize,
    /// Page size for `getSignaturesForAddress`
    pub signature_page_limit: usize,
}

impl ScanOptions {
    pub fn for_chain(chain: Chain) -> Self {
        Self {
            required_confirmations: chain.default_required_confirmations(),
            max_blocks_per_poll: 50,
            initial_lookback_blocks: 100,
            start_block: None,
            rpc_concurrency: 8,
            signature_page_limit: 1000,
        }
    }
}

/// Everything needed to build a client for one chain
#[derive(Debug, Clone)]
pub struct ChainClientConfig {
    pub chain: Chain,
    pub provider: ProviderConfig,
    pub tokens: Vec<TokenContract>,
    pub scan: ScanOptions,
}

impl ChainClientConfig {
    pub fn new(chain: Chain, provider: ProviderConfig) -> Self {
        Self {
            chain,
            provider,
            tokens: Vec::new(),
            scan: ScanOptions::for_chain(chain),
        }
    }

    pub fn with_tokens(mut self, tokens: Vec<TokenContract>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_scan(mut self, scan: ScanOptions) -> Self {
        self.scan = scan;
        self
    }

    /// Build the shared HTTP client with the configured timeout
    pub(crate) fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.provider.timeout())
            .build()
            .map_err(|e| Error::InvalidInput(format!("HTTP client for {}: {}", self.chain, e)))
    }
}

/// Chain client factory
pub struct ChainClientFactory;

impl ChainClientFactory {
    /// Create the client matching the chain's family
    pub fn create(config: &ChainClientConfig) -> Result<Arc<dyn ChainClient>> {
        if config.provider.url.trim().is_empty() {
            return Err(Error::InvalidInput(format!("no RPC URL for {}", config.chain)));
        }

        match config.chain.family() {
            ChainFamily::Evm => Ok(Arc::new(EvmChainClient::new(config)?)),
            ChainFamily::Solana => Ok(Arc::new(SolanaChainClient::new(config)?)),
        }
    }
}
