//! Solana deposit detection over JSON-RPC
//!
//! Each monitored wallet, and each of its token accounts for the configured
//! SPL mints (found with `getTokenAccountsByOwner`), is scanned with
//! `getSignaturesForAddress`, newest first, down to that account's cursor.
//! A transfer into an existing token account does not mention the wallet, so
//! the token accounts need their own scan. Every successful signature is
//! fetched with `getTransaction` (`jsonParsed`) and credited from the balance
//! deltas in its metadata: lamports for the wallet, token amounts for the
//! token account.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use super::types::{amount_from_units, coalesce_events, sort_events};
use super::{
    Chain, ChainClient, ChainClientConfig, Checkpoint, DepositEvent, PollOutcome, ScanOptions,
    TokenContract, SOLANA_FINALIZED_CONFIRMATIONS,
};
use crate::error::{Error, Result};

/// Commitment level of a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn confirmations(self) -> u64 {
        match self {
            Commitment::Processed => 0,
            Commitment::Confirmed => 1,
            Commitment::Finalized => SOLANA_FINALIZED_CONFIRMATIONS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub signature: String,
    pub slot: u64,
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub confirmation_status: Option<Commitment>,
}

impl SignatureInfo {
    /// Signatures older than the node's status cache carry no status; they
    /// are rooted.
    pub fn commitment(&self) -> Commitment {
        self.confirmation_status.unwrap_or(Commitment::Finalized)
    }

    pub fn failed(&self) -> bool {
        self.err.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTransaction {
    pub slot: u64,
    pub meta: Option<TransactionMeta>,
    pub transaction: TransactionEnvelope,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMeta {
    #[serde(default)]
    pub err: Option<Value>,
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
    #[serde(default)]
    pub pre_token_balances: Option<Vec<TokenBalance>>,
    #[serde(default)]
    pub post_token_balances: Option<Vec<TokenBalance>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    pub account_index: usize,
    pub mint: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub ui_token_amount: UiTokenAmount,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UiTokenAmount {
    pub amount: String,
    pub decimals: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionEnvelope {
    pub message: ParsedMessage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedMessage {
    pub account_keys: Vec<AccountKey>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountKey {
    pub pubkey: String,
    #[serde(default)]
    pub signer: bool,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    #[serde(default = "Option::default")]
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct TokenAccountsByOwner {
    value: Vec<KeyedAccount>,
}

#[derive(Debug, Deserialize)]
struct KeyedAccount {
    pubkey: String,
}

/// An account whose signatures are scanned
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScanTarget {
    /// A monitored wallet: native SOL deposits, and SPL deposits into token
    /// accounts of the wallet that are not scanned on their own
    Wallet(String),
    /// A token account of a monitored wallet for one configured mint
    TokenAccount { account: String, owner: String, mint: String },
}

impl ScanTarget {
    /// Account whose signatures are listed; also the cursor key
    pub fn address(&self) -> &str {
        match self {
            ScanTarget::Wallet(address) => address,
            ScanTarget::TokenAccount { account, .. } => account,
        }
    }

    /// Monitored wallet the deposits belong to
    pub fn owner(&self) -> &str {
        match self {
            ScanTarget::Wallet(address) => address,
            ScanTarget::TokenAccount { owner, .. } => owner,
        }
    }
}

/// Scan result for one address
struct AddressScan {
    address: String,
    events: Vec<DepositEvent>,
    cursor: Option<String>,
    slot: u64,
}

/// Client for Solana
pub struct SolanaChainClient {
    chain: Chain,
    http: reqwest::Client,
    endpoint: String,
    mints: HashMap<String, TokenContract>,
    options: ScanOptions,
    request_id: AtomicU64,
}

impl SolanaChainClient {
    pub fn new(config: &ChainClientConfig) -> Result<Self> {
        let mints = config
            .tokens
            .iter()
            .map(|token| (token.contract.clone(), token.clone()))
            .collect();

        Ok(Self {
            chain: config.chain,
            http: config.http_client()?,
            endpoint: config.provider.endpoint(),
            mints,
            options: config.scan.clone(),
            request_id: AtomicU64::new(1),
        })
    }

    fn unavailable(&self, reason: impl Display) -> Error {
        Error::chain_unavailable(self.chain, reason)
    }

    /// Send a JSON-RPC request. `Ok(None)` means the node answered with a
    /// null result.
    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unavailable(format!("{}: {}", method, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.unavailable(format!("{} returned HTTP {}", method, status)));
        }

        let response: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| self.unavailable(format!("malformed {} response: {}", method, e)))?;

        if let Some(error) = response.error {
            return Err(self.unavailable(format!(
                "{} failed with code {}: {}",
                method, error.code, error.message
            )));
        }

        Ok(response.result)
    }

    /// Signatures newer than `until`, newest first
    async fn signatures_since(&self, address: &str, until: Option<&str>) -> Result<Vec<SignatureInfo>> {
        let limit = self.options.signature_page_limit.clamp(1, 1000);
        let mut signatures = Vec::new();
        let mut before: Option<String> = None;

        loop {
            let mut config = json!({ "limit": limit, "commitment": "confirmed" });
            if let Some(until) = until {
                config["until"] = json!(until);
            }
            if let Some(before) = &before {
                config["before"] = json!(before);
            }

            let page: Vec<SignatureInfo> = self
                .request("getSignaturesForAddress", json!([address, config]))
                .await?
                .ok_or_else(|| self.unavailable("getSignaturesForAddress returned null"))?;

            let exhausted = page.len() < limit;
            before = page.last().map(|info| info.signature.clone());
            signatures.extend(page);

            if exhausted || before.is_none() {
                break;
            }
        }

        Ok(signatures)
    }

    async fn transaction(&self, signature: &str) -> Result<Option<ParsedTransaction>> {
        self.request(
            "getTransaction",
            json!([
                signature,
                {
                    "encoding": "jsonParsed",
                    "commitment": "confirmed",
                    "maxSupportedTransactionVersion": 0,
                }
            ]),
        )
        .await
    }

    /// Token accounts `owner` holds for `mint`
    async fn token_accounts(&self, owner: &str, mint: &str) -> Result<Vec<String>> {
        let accounts: TokenAccountsByOwner = self
            .request(
                "getTokenAccountsByOwner",
                json!([owner, { "mint": mint }, { "encoding": "jsonParsed", "commitment": "confirmed" }]),
            )
            .await?
            .ok_or_else(|| self.unavailable("getTokenAccountsByOwner returned null"))?;

        Ok(accounts.value.into_iter().map(|account| account.pubkey).collect())
    }

    /// Every monitored wallet plus its token accounts for the configured mints
    async fn scan_targets(&self, addresses: &HashSet<String>) -> Result<Vec<ScanTarget>> {
        let lookups: Vec<(String, String)> = addresses
            .iter()
            .flat_map(|owner| self.mints.keys().map(move |mint| (owner.clone(), mint.clone())))
            .collect();

        let found: Vec<Vec<ScanTarget>> = stream::iter(lookups)
            .map(|(owner, mint)| async move {
                let accounts = self.token_accounts(&owner, &mint).await?;
                Ok::<_, Error>(
                    accounts
                        .into_iter()
                        .map(|account| ScanTarget::TokenAccount {
                            account,
                            owner: owner.clone(),
                            mint: mint.clone(),
                        })
                        .collect::<Vec<_>>(),
                )
            })
            .buffer_unordered(self.options.rpc_concurrency.max(1))
            .try_collect()
            .await?;

        let mut targets: Vec<ScanTarget> = addresses.iter().cloned().map(ScanTarget::Wallet).collect();
        let mut seen: HashSet<String> = addresses.clone();
        for target in found.into_iter().flatten() {
            // an account that is itself a monitored wallet is scanned once
            if seen.insert(target.address().to_string()) {
                targets.push(target);
            }
        }

        Ok(targets)
    }

    async fn scan_target(
        &self,
        target: ScanTarget,
        cursor: Option<String>,
        token_accounts: &HashSet<String>,
    ) -> Result<AddressScan> {
        let newest_first = self.signatures_since(target.address(), cursor.as_deref()).await?;
        let mut events = Vec::new();
        let mut unavailable = HashSet::new();

        // oldest first so events come out in slot order
        for info in newest_first.iter().rev() {
            if info.failed() {
                continue;
            }
            if info.commitment() == Commitment::Processed {
                unavailable.insert(info.signature.clone());
                continue;
            }

            match self.transaction(&info.signature).await? {
                Some(tx) => events.extend(deposits_from_transaction(
                    self.chain,
                    &info.signature,
                    info.commitment(),
                    &tx,
                    &target,
                    token_accounts,
                    &self.mints,
                )?),
                None => {
                    debug!(chain = %self.chain, signature = %info.signature, "transaction not yet retrievable");
                    unavailable.insert(info.signature.clone());
                }
            }
        }

        let (cursor, slot) = advance_cursor(cursor, &newest_first, &unavailable);

        Ok(AddressScan {
            address: target.address().to_string(),
            events,
            cursor,
            slot,
        })
    }
}

#[async_trait]
impl ChainClient for SolanaChainClient {
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn poll_incoming(
        &self,
        addresses: &HashSet<String>,
        checkpoint: &Checkpoint,
    ) -> Result<PollOutcome> {
        let (previous_slot, previous_cursors) = match checkpoint {
            Checkpoint::Start => (0, BTreeMap::new()),
            Checkpoint::Signatures { slot, cursors } => (*slot, cursors.clone()),
            Checkpoint::Block { .. } => {
                return Err(Error::InvalidInput(format!("not a signature checkpoint: {}", checkpoint)));
            }
        };

        let targets = self.scan_targets(addresses).await?;
        let token_accounts: HashSet<String> = targets
            .iter()
            .filter(|target| matches!(target, ScanTarget::TokenAccount { .. }))
            .map(|target| target.address().to_string())
            .collect();
        debug!(chain = %self.chain, targets = targets.len(), token_accounts = token_accounts.len(), "scanning accounts");

        let token_accounts = &token_accounts;
        let scans: Vec<AddressScan> = stream::iter(targets)
            .map(|target| {
                let cursor = previous_cursors.get(target.address()).cloned();
                self.scan_target(target, cursor, token_accounts)
            })
            .buffer_unordered(self.options.rpc_concurrency.max(1))
            .try_collect()
            .await?;

        let mut slot = previous_slot;
        let mut cursors = BTreeMap::new();
        let mut events = Vec::new();

        // accounts no longer scanned drop out of the checkpoint
        for scan in scans {
            slot = slot.max(scan.slot);
            if let Some(cursor) = scan.cursor {
                cursors.insert(scan.address, cursor);
            }
            events.extend(scan.events);
        }

        let mut events = coalesce_events(events);
        sort_events(&mut events);

        Ok(PollOutcome {
            events,
            checkpoint: Checkpoint::Signatures { slot, cursors },
        })
    }
}

/// Move an address cursor through the contiguous run of finalized, processed
/// signatures following it.
///
/// `newest_first` is the page list returned after the current cursor.
/// Signatures in `unavailable` could not be fetched and block the cursor, as
/// does any signature that is not yet finalized. Returns the new cursor and
/// the slot of the signature it points at (0 when unchanged).
pub fn advance_cursor(
    current: Option<String>,
    newest_first: &[SignatureInfo],
    unavailable: &HashSet<String>,
) -> (Option<String>, u64) {
    let mut cursor = current;
    let mut slot = 0;

    for info in newest_first.iter().rev() {
        if info.commitment() != Commitment::Finalized || unavailable.contains(&info.signature) {
            break;
        }
        cursor = Some(info.signature.clone());
        slot = info.slot;
    }

    (cursor, slot)
}

/// Deposits `target` received in one transaction.
///
/// A wallet target yields its lamport increase, plus token increases in
/// accounts it owns that are not in `token_accounts` (those are credited by
/// their own scan). A token account target yields its increase in its mint.
/// Every token deposit is keyed by the token account, so the same deposit
/// found by either scan has the same key.
///
/// Failed transactions yield nothing. Missing metadata or balance arrays
/// that do not line up with the account keys are malformed responses.
pub fn deposits_from_transaction(
    chain: Chain,
    signature: &str,
    commitment: Commitment,
    tx: &ParsedTransaction,
    target: &ScanTarget,
    token_accounts: &HashSet<String>,
    mints: &HashMap<String, TokenContract>,
) -> Result<Vec<DepositEvent>> {
    let meta = tx
        .meta
        .as_ref()
        .ok_or_else(|| Error::chain_unavailable(chain, format!("transaction {} has no meta", signature)))?;

    if meta.err.is_some() {
        return Ok(Vec::new());
    }

    let keys = &tx.transaction.message.account_keys;
    let sender = keys
        .iter()
        .find(|key| key.signer)
        .or_else(|| keys.first())
        .map(|key| key.pubkey.clone())
        .unwrap_or_default();

    let deposit = |to_address: &str, token_symbol: &str, raw: u128, decimals: u32| -> DepositEvent {
        let (amount, unrepresentable_units) = amount_from_units(raw, decimals);
        if let Some(units) = &unrepresentable_units {
            error!(%chain, %signature, token = %token_symbol, %units, "amount not representable, deposit needs manual review");
        }

        DepositEvent {
            chain,
            tx_hash: signature.to_string(),
            from_address: sender.clone(),
            to_address: to_address.to_string(),
            owner_address: target.owner().to_string(),
            token_symbol: token_symbol.to_string(),
            amount,
            unrepresentable_units,
            block_number: tx.slot,
            confirmations: commitment.confirmations(),
            observed_at: Utc::now(),
        }
    };

    let mut events = Vec::new();
    let pre_tokens = meta.pre_token_balances.as_deref().unwrap_or_default();
    let post_tokens = meta.post_token_balances.as_deref().unwrap_or_default();

    match target {
        ScanTarget::Wallet(address) => {
            if let Some(index) = keys.iter().position(|key| &key.pubkey == address) {
                let (pre, post) = match (meta.pre_balances.get(index), meta.post_balances.get(index)) {
                    (Some(pre), Some(post)) => (*pre, *post),
                    _ => {
                        return Err(Error::chain_unavailable(
                            chain,
                            format!("transaction {} balances do not match account keys", signature),
                        ))
                    }
                };

                if post > pre {
                    events.push(deposit(
                        address.as_str(),
                        chain.native_symbol(),
                        u128::from(post - pre),
                        chain.native_decimals(),
                    ));
                }
            }

            for post in post_tokens {
                if post.owner.as_deref() != Some(address.as_str()) {
                    continue;
                }
                let Some(token) = mints.get(&post.mint) else {
                    continue;
                };
                let account = token_account_key(chain, signature, keys, post.account_index)?;
                if token_accounts.contains(account) {
                    continue;
                }

                let increase = token_increase(chain, signature, pre_tokens, post)?;
                if increase > 0 {
                    events.push(deposit(account, &token.symbol, increase, token.decimals));
                }
            }
        }
        ScanTarget::TokenAccount { account, mint, .. } => {
            let Some(token) = mints.get(mint) else {
                return Ok(events);
            };
            let Some(index) = keys.iter().position(|key| &key.pubkey == account) else {
                return Ok(events);
            };

            for post in post_tokens.iter().filter(|post| post.account_index == index && &post.mint == mint) {
                let increase = token_increase(chain, signature, pre_tokens, post)?;
                if increase > 0 {
                    events.push(deposit(account.as_str(), &token.symbol, increase, token.decimals));
                }
            }
        }
    }

    Ok(events)
}

fn token_account_key<'a>(chain: Chain, signature: &str, keys: &'a [AccountKey], index: usize) -> Result<&'a str> {
    keys.get(index).map(|key| key.pubkey.as_str()).ok_or_else(|| {
        Error::chain_unavailable(
            chain,
            format!("transaction {} token balance index {} has no account key", signature, index),
        )
    })
}

/// Raw amount a token balance grew by in one transaction; a balance with no
/// pre entry started at zero
fn token_increase(chain: Chain, signature: &str, pre_tokens: &[TokenBalance], post: &TokenBalance) -> Result<u128> {
    let after = parse_token_amount(chain, signature, &post.ui_token_amount)?;
    let before = match pre_tokens
        .iter()
        .find(|pre| pre.account_index == post.account_index && pre.mint == post.mint)
    {
        Some(pre) => parse_token_amount(chain, signature, &pre.ui_token_amount)?,
        None => 0,
    };

    Ok(after.saturating_sub(before))
}

fn parse_token_amount(chain: Chain, signature: &str, amount: &UiTokenAmount) -> Result<u128> {
    amount.amount.parse::<u128>().map_err(|e| {
        Error::chain_unavailable(
            chain,
            format!("transaction {} token amount {:?}: {}", signature, amount.amount, e),
        )
    })
}
