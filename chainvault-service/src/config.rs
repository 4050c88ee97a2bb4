//! Service configuration
//!
//! Settings are read from a TOML file. Secrets and connection strings can be
//! overridden from the environment so they never need to live in the file.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroizing;

use chainvault_core::chain::{
    Chain, ChainClientConfig, ChainFamily, ProviderConfig, ScanOptions, TokenContract,
    SOLANA_FINALIZED_CONFIRMATIONS,
};
use chainvault_core::crypto::MnemonicStrength;

use crate::error::{Result, ServiceError};

/// Environment variable overriding `database.url`
pub const DATABASE_URL_ENV: &str = "CHAINVAULT_DATABASE_URL";

/// Environment variable overriding `security.encryption_key`
pub const ENCRYPTION_KEY_ENV: &str = "CHAINVAULT_ENCRYPTION_KEY";

/// Top level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    /// Token symbols that have a user balance. Deposits of any other token
    /// are parked as failed.
    #[serde(default = "default_supported_tokens")]
    pub supported_tokens: Vec<String>,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Base64 encoded 32 byte AES-256 key for mnemonics at rest
    #[serde(default, skip_serializing)]
    pub encryption_key: Option<String>,

    /// 12 or 24
    #[serde(default = "default_mnemonic_words")]
    pub mnemonic_words: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// A cycle running longer than this is abandoned
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,

    /// Upper bound of the backoff delay after failed cycles
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Concurrent RPC requests per chain
    #[serde(default = "default_rpc_concurrency")]
    pub rpc_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

/// One scanned chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain: Chain,

    pub rpc_url: String,

    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    #[serde(default = "default_rpc_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Defaults to the chain's standard threshold
    #[serde(default)]
    pub required_confirmations: Option<u64>,

    /// Defaults to the chain's standard cadence
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,

    #[serde(default = "default_max_blocks_per_poll")]
    pub max_blocks_per_poll: u64,

    #[serde(default = "default_initial_lookback")]
    pub initial_lookback_blocks: u64,

    #[serde(default)]
    pub start_block: Option<u64>,

    /// ERC-20 contracts or SPL mints
    #[serde(default)]
    pub tokens: Vec<TokenContract>,
}

fn default_supported_tokens() -> Vec<String> {
    ["ETH", "BNB", "MATIC", "SOL", "USDT", "USDC"]
        .iter()
        .map(|symbol| symbol.to_string())
        .collect()
}

fn default_database_url() -> String {
    "sqlite://chainvault.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_mnemonic_words() -> usize {
    12
}

fn default_cycle_timeout() -> u64 {
    120
}

fn default_max_backoff() -> u64 {
    300
}

fn default_rpc_concurrency() -> usize {
    8
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9184".to_string()
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_max_blocks_per_poll() -> u64 {
    50
}

fn default_initial_lookback() -> u64 {
    100
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            cycle_timeout_secs: default_cycle_timeout(),
            max_backoff_secs: default_max_backoff(),
            rpc_concurrency: default_rpc_concurrency(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

impl ScannerConfig {
    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

impl ChainConfig {
    pub fn new(chain: Chain, rpc_url: impl Into<String>) -> Self {
        Self {
            chain,
            rpc_url: rpc_url.into(),
            api_key: None,
            timeout_secs: default_rpc_timeout(),
            enabled: true,
            required_confirmations: None,
            poll_interval_secs: None,
            max_blocks_per_poll: default_max_blocks_per_poll(),
            initial_lookback_blocks: default_initial_lookback(),
            start_block: None,
            tokens: Vec::new(),
        }
    }

    pub fn required_confirmations(&self) -> u64 {
        self.required_confirmations
            .unwrap_or_else(|| self.chain.default_required_confirmations())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(
            self.poll_interval_secs
                .unwrap_or_else(|| self.chain.default_poll_interval_secs()),
        )
    }

    /// Settings for the chain client
    pub fn client_config(&self, scanner: &ScannerConfig) -> ChainClientConfig {
        let provider = ProviderConfig {
            url: self.rpc_url.clone(),
            api_key: self.api_key.clone(),
            timeout_secs: self.timeout_secs,
        };

        let scan = ScanOptions {
            required_confirmations: self.required_confirmations(),
            max_blocks_per_poll: self.max_blocks_per_poll,
            initial_lookback_blocks: self.initial_lookback_blocks,
            start_block: self.start_block,
            rpc_concurrency: scanner.rpc_concurrency,
            ..ScanOptions::for_chain(self.chain)
        };

        // Ledger balances are keyed by upper case symbols
        let tokens = self
            .tokens
            .iter()
            .map(|token| TokenContract {
                symbol: token.symbol.trim().to_ascii_uppercase(),
                ..token.clone()
            })
            .collect();

        ChainClientConfig::new(self.chain, provider)
            .with_tokens(tokens)
            .with_scan(scan)
    }
}

impl Config {
    /// Load configuration from a TOML file and apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServiceError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from a variable lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(DATABASE_URL_ENV).filter(|value| !value.is_empty()) {
            self.database.url = url;
        }
        if let Some(key) = lookup(ENCRYPTION_KEY_ENV).filter(|value| !value.is_empty()) {
            self.security.encryption_key = Some(key);
        }
    }

    /// Validate the configuration. Returns warnings for settings that are
    /// accepted but probably unintended.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if self.database.url.trim().is_empty() {
            return Err(ServiceError::ConfigError("database.url must not be empty".to_string()));
        }

        self.encryption_key()?;
        self.mnemonic_strength()?;
        self.metrics_address()?;

        if self.scanner.cycle_timeout_secs == 0 {
            return Err(ServiceError::ConfigError("scanner.cycle_timeout_secs must be positive".to_string()));
        }

        let supported = self.supported_token_set();
        let mut seen = HashSet::new();

        for chain in &self.chains {
            if !seen.insert(chain.chain) {
                return Err(ServiceError::ConfigError(format!("{} is configured twice", chain.chain)));
            }
            if chain.rpc_url.trim().is_empty() {
                return Err(ServiceError::ConfigError(format!("{}: rpc_url must not be empty", chain.chain)));
            }
            if chain.poll_interval().is_zero() {
                return Err(ServiceError::ConfigError(format!(
                    "{}: poll_interval_secs must be positive",
                    chain.chain
                )));
            }
            if chain.required_confirmations() == 0 {
                return Err(ServiceError::ConfigError(format!(
                    "{}: required_confirmations must be positive",
                    chain.chain
                )));
            }
            if chain.chain.family() == ChainFamily::Solana
                && chain.required_confirmations() != SOLANA_FINALIZED_CONFIRMATIONS
            {
                return Err(ServiceError::ConfigError(format!(
                    "{}: only finalized transactions may be credited, required_confirmations must be {}",
                    chain.chain, SOLANA_FINALIZED_CONFIRMATIONS
                )));
            }
            if chain.max_blocks_per_poll == 0 {
                return Err(ServiceError::ConfigError(format!(
                    "{}: max_blocks_per_poll must be positive",
                    chain.chain
                )));
            }

            for token in &chain.tokens {
                chain.chain.normalize_address(&token.contract).map_err(|e| {
                    ServiceError::ConfigError(format!("{} token {}: {}", chain.chain, token.symbol, e))
                })?;

                if !supported.contains(&token.symbol.to_ascii_uppercase()) {
                    warnings.push(format!(
                        "{} watches {} which is not a supported token; its deposits will be parked",
                        chain.chain, token.symbol
                    ));
                }
            }

            if !supported.contains(chain.chain.native_symbol()) {
                warnings.push(format!(
                    "native token {} of {} is not supported; its deposits will be parked",
                    chain.chain.native_symbol(),
                    chain.chain
                ));
            }
        }

        if self.enabled_chains().next().is_none() {
            warnings.push("no chains are enabled".to_string());
        }

        for warning in &warnings {
            warn!("{}", warning);
        }

        Ok(warnings)
    }

    /// Decode the mnemonic encryption key
    pub fn encryption_key(&self) -> Result<Zeroizing<[u8; 32]>> {
        let encoded = self.security.encryption_key.as_deref().ok_or_else(|| {
            ServiceError::ConfigError(format!(
                "security.encryption_key is not set (or set {})",
                ENCRYPTION_KEY_ENV
            ))
        })?;

        let decoded = Zeroizing::new(
            general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| ServiceError::ConfigError(format!("encryption key is not base64: {}", e)))?,
        );

        if decoded.len() != 32 {
            return Err(ServiceError::ConfigError(format!(
                "encryption key must be 32 bytes, got {}",
                decoded.len()
            )));
        }

        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&decoded);
        Ok(key)
    }

    pub fn mnemonic_strength(&self) -> Result<MnemonicStrength> {
        match self.security.mnemonic_words {
            12 => Ok(MnemonicStrength::Words12),
            24 => Ok(MnemonicStrength::Words24),
            other => Err(ServiceError::ConfigError(format!(
                "security.mnemonic_words must be 12 or 24, got {}",
                other
            ))),
        }
    }

    pub fn metrics_address(&self) -> Result<SocketAddr> {
        self.metrics
            .listen
            .parse()
            .map_err(|e| ServiceError::ConfigError(format!("metrics.listen {}: {}", self.metrics.listen, e)))
    }

    pub fn supported_token_set(&self) -> HashSet<String> {
        self.supported_tokens
            .iter()
            .map(|symbol| symbol.trim().to_ascii_uppercase())
            .collect()
    }

    pub fn enabled_chains(&self) -> impl Iterator<Item = &ChainConfig> {
        self.chains.iter().filter(|chain| chain.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";

    fn sample() -> String {
        format!(
            r#"
supported_tokens = ["ETH", "SOL", "USDC"]

[database]
url = "sqlite::memory:"

[security]
encryption_key = "{KEY}"

[[chains]]
chain = "ethereum"
rpc_url = "https://eth.example.com"
required_confirmations = 6

[[chains.tokens]]
symbol = "USDC"
contract = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"
decimals = 6

[[chains]]
chain = "solana"
rpc_url = "https://sol.example.com"
"#
        )
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.scanner.cycle_timeout_secs, 120);
        assert!(config.chains.is_empty());
    }

    #[test]
    fn test_parse_and_validate() {
        let config = Config::from_toml_str(&sample()).unwrap();
        let warnings = config.validate().unwrap();
        assert!(warnings.is_empty(), "{:?}", warnings);

        let ethereum = &config.chains[0];
        assert_eq!(ethereum.required_confirmations(), 6);
        assert_eq!(ethereum.poll_interval(), Duration::from_secs(15));

        let solana = &config.chains[1];
        assert_eq!(solana.required_confirmations(), 32);
        assert!(solana.poll_interval() < ethereum.poll_interval());

        let client = ethereum.client_config(&config.scanner);
        assert_eq!(client.scan.required_confirmations, 6);
        assert_eq!(client.tokens.len(), 1);
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let mut config = Config::from_toml_str(&sample()).unwrap();
        config.security.encryption_key = None;
        assert!(matches!(config.validate(), Err(ServiceError::ConfigError(_))));

        config.security.encryption_key = Some("c2hvcnQ=".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_solana_must_wait_for_finality() {
        let mut config = Config::from_toml_str(&sample()).unwrap();
        config.chains[1].required_confirmations = Some(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_rpc_url_is_rejected() {
        let mut config = Config::from_toml_str(&sample()).unwrap();
        config.chains[0].rpc_url = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsupported_token_is_a_warning() {
        let mut config = Config::from_toml_str(&sample()).unwrap();
        config.supported_tokens = vec!["ETH".to_string(), "SOL".to_string()];
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("USDC"));
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::from_toml_str(&sample()).unwrap();
        let env: HashMap<&str, &str> = [
            (DATABASE_URL_ENV, "sqlite://other.db"),
            (ENCRYPTION_KEY_ENV, "HyAhISIjJCUmJygpKissLS4vMDEyMzQ1Njc4OTo7PD0="),
        ]
        .into_iter()
        .collect();

        config.apply_overrides(|name| env.get(name).map(|value| value.to_string()));
        assert_eq!(config.database.url, "sqlite://other.db");
        assert_eq!(config.encryption_key().unwrap()[0], 0x1f);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, sample().as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.chains.len(), 2);
        assert!(Config::from_file(Path::new("/nonexistent/chainvault.toml")).is_err());
    }
}
