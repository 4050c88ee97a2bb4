//! EVM deposit detection
//!
//! Native transfers are read from full blocks and confirmed against their
//! receipts. ERC-20 deposits come from `Transfer` logs of the configured
//! contracts, filtered on the recipient topic.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{
    Address, Block, BlockId, BlockNumber, Filter, Log, Transaction as EvmTransaction,
    TransactionReceipt, ValueOrArray, H256, U256, U64,
};
use futures::stream::{self, StreamExt, TryStreamExt};
use rust_decimal::Decimal;
use tracing::{debug, error, warn};

use super::types::{amount_from_units, coalesce_events, sort_events};
use super::{Chain, ChainClient, ChainClientConfig, Checkpoint, DepositEvent, PollOutcome, ScanOptions, TokenContract};
use crate::error::{Error, Result};

/// ERC-20 transfer event signature
pub const TRANSFER_EVENT: &str = "Transfer(address,address,uint256)";

/// Recipient topics per `eth_getLogs` request
const MAX_RECIPIENTS_PER_FILTER: usize = 500;

/// Inclusive block range of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockWindow {
    pub from: u64,
    pub to: u64,
}

/// Client for Ethereum and EVM compatible chains
pub struct EvmChainClient {
    chain: Chain,
    provider: Provider<Http>,
    tokens: HashMap<Address, TokenContract>,
    options: ScanOptions,
}

impl EvmChainClient {
    pub fn new(config: &ChainClientConfig) -> Result<Self> {
        let url = reqwest::Url::parse(&config.provider.endpoint())
            .map_err(|e| Error::InvalidInput(format!("RPC URL for {}: {}", config.chain, e)))?;
        let provider = Provider::new(Http::new_with_client(url, config.http_client()?));

        let mut tokens = HashMap::new();
        for token in &config.tokens {
            let contract = Address::from_str(&token.contract).map_err(|e| {
                Error::InvalidAddress(format!("{} contract {}: {}", token.symbol, token.contract, e))
            })?;
            tokens.insert(contract, token.clone());
        }

        Ok(Self {
            chain: config.chain,
            provider,
            tokens,
            options: config.scan.clone(),
        })
    }

    fn unavailable(&self, reason: impl Display) -> Error {
        Error::chain_unavailable(self.chain, reason)
    }

    fn concurrency(&self) -> usize {
        self.options.rpc_concurrency.max(1)
    }

    fn recipients(&self, addresses: &HashSet<String>) -> HashSet<Address> {
        addresses
            .iter()
            .filter_map(|address| match Address::from_str(address) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!(chain = %self.chain, %address, "ignoring unparsable address: {}", e);
                    None
                }
            })
            .collect()
    }

    async fn native_deposits(
        &self,
        window: BlockWindow,
        latest: u64,
        recipients: &HashSet<Address>,
    ) -> Result<Vec<DepositEvent>> {
        let blocks: Vec<(u64, Option<Block<EvmTransaction>>)> = stream::iter(window.from..=window.to)
            .map(|number| async move {
                self.provider
                    .get_block_with_txs(BlockId::Number(BlockNumber::Number(U64::from(number))))
                    .await
                    .map(|block| (number, block))
            })
            .buffered(self.concurrency())
            .try_collect()
            .await
            .map_err(|e| self.unavailable(e))?;

        let mut candidates = Vec::new();
        for (number, block) in blocks {
            let block = block.ok_or_else(|| self.unavailable(format!("block {} not returned", number)))?;
            for tx in block.transactions {
                match tx.to {
                    Some(to) if recipients.contains(&to) && !tx.value.is_zero() => {
                        candidates.push((number, tx))
                    }
                    _ => {}
                }
            }
        }

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let hashes: Vec<H256> = candidates.iter().map(|(_, tx)| tx.hash).collect();
        let receipts: Vec<Option<TransactionReceipt>> = stream::iter(hashes)
            .map(|hash| self.provider.get_transaction_receipt(hash))
            .buffered(self.concurrency())
            .try_collect()
            .await
            .map_err(|e| self.unavailable(e))?;

        let mut events = Vec::new();
        for ((number, tx), receipt) in candidates.iter().zip(receipts) {
            let receipt =
                receipt.ok_or_else(|| self.unavailable(format!("no receipt for {:#x}", tx.hash)))?;

            if receipt.status == Some(U64::zero()) {
                debug!(chain = %self.chain, tx_hash = %format!("{:#x}", tx.hash), "skipping reverted transfer");
                continue;
            }

            if let Some(event) = native_deposit(self.chain, tx, *number, latest) {
                events.push(event);
            }
        }

        Ok(events)
    }

    async fn token_deposits(
        &self,
        window: BlockWindow,
        latest: u64,
        recipients: &HashSet<Address>,
    ) -> Result<Vec<DepositEvent>> {
        if self.tokens.is_empty() {
            return Ok(Vec::new());
        }

        let contracts: Vec<Address> = self.tokens.keys().copied().collect();
        let recipients: Vec<Address> = recipients.iter().copied().collect();
        let mut events = Vec::new();

        for chunk in recipients.chunks(MAX_RECIPIENTS_PER_FILTER) {
            let filter = Filter::new()
                .from_block(BlockNumber::Number(U64::from(window.from)))
                .to_block(BlockNumber::Number(U64::from(window.to)))
                .address(ValueOrArray::Array(contracts.clone()))
                .event(TRANSFER_EVENT)
                .topic2(ValueOrArray::Array(
                    chunk.iter().map(|address| Some(H256::from(*address))).collect::<Vec<_>>(),
                ));

            let logs = self.provider.get_logs(&filter).await.map_err(|e| self.unavailable(e))?;

            for log in logs {
                let token = self.tokens.get(&log.address).ok_or_else(|| {
                    self.unavailable(format!("log from unrequested contract {:#x}", log.address))
                })?;

                if let Some(event) = decode_transfer_log(self.chain, &log, token, latest)? {
                    events.push(event);
                }
            }
        }

        Ok(events)
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn poll_incoming(
        &self,
        addresses: &HashSet<String>,
        checkpoint: &Checkpoint,
    ) -> Result<PollOutcome> {
        let latest = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| self.unavailable(e))?
            .as_u64();

        let window = match scan_window(checkpoint, latest, &self.options)? {
            Some(window) => window,
            None => return Ok(PollOutcome::empty(checkpoint.clone())),
        };

        debug!(chain = %self.chain, from = window.from, to = window.to, latest, "scanning blocks");

        let recipients = self.recipients(addresses);
        let mut events = Vec::new();

        if !recipients.is_empty() {
            events.extend(self.native_deposits(window, latest, &recipients).await?);
            events.extend(self.token_deposits(window, latest, &recipients).await?);
        }

        let mut events = coalesce_events(events);
        sort_events(&mut events);

        Ok(PollOutcome {
            events,
            checkpoint: settled_checkpoint(window, latest, self.options.required_confirmations, checkpoint),
        })
    }
}

/// Block range to scan after `checkpoint`, or `None` when the tip has not
/// moved past it
pub fn scan_window(checkpoint: &Checkpoint, latest: u64, options: &ScanOptions) -> Result<Option<BlockWindow>> {
    let from = match checkpoint {
        Checkpoint::Start => options
            .start_block
            .unwrap_or_else(|| latest.saturating_sub(options.initial_lookback_blocks)),
        Checkpoint::Block { number } => number.saturating_add(1),
        Checkpoint::Signatures { .. } => {
            return Err(Error::InvalidInput(format!("not a block checkpoint: {}", checkpoint)));
        }
    };

    if from > latest {
        return Ok(None);
    }

    let span = options.max_blocks_per_poll.max(1);
    let to = latest.min(from.saturating_add(span - 1));

    Ok(Some(BlockWindow { from, to }))
}

/// Checkpoint after scanning `window`: the highest block in the window that
/// already has `required` confirmations. Blocks above it are scanned again
/// on the next poll.
pub fn settled_checkpoint(
    window: BlockWindow,
    latest: u64,
    required: u64,
    previous: &Checkpoint,
) -> Checkpoint {
    let settled = (latest + 1).checked_sub(required.max(1)).map(|safe| safe.min(window.to));

    match settled {
        Some(number) if number >= window.from => Checkpoint::Block { number },
        // anchor a fresh checkpoint so the lookback window stops sliding
        _ if matches!(previous, Checkpoint::Start) && window.from > 0 => Checkpoint::Block {
            number: window.from - 1,
        },
        _ => previous.clone(),
    }
}

pub fn confirmations(latest: u64, block: u64) -> u64 {
    if block > latest {
        0
    } else {
        latest - block + 1
    }
}

/// Decimal amount of a raw token value, or zero and the raw value as text
/// when it does not fit a decimal
fn u256_amount(value: U256, decimals: u32) -> (Decimal, Option<String>) {
    if value.bits() > 128 {
        return (Decimal::ZERO, Some(value.to_string()));
    }
    amount_from_units(value.as_u128(), decimals)
}

fn native_deposit(chain: Chain, tx: &EvmTransaction, block_number: u64, latest: u64) -> Option<DepositEvent> {
    let to = format!("{:#x}", tx.to?);
    let tx_hash = format!("{:#x}", tx.hash);

    let (amount, unrepresentable_units) = u256_amount(tx.value, chain.native_decimals());
    if let Some(units) = &unrepresentable_units {
        error!(%chain, %tx_hash, %units, "native amount not representable, deposit needs manual review");
    }

    Some(DepositEvent {
        chain,
        tx_hash,
        from_address: format!("{:#x}", tx.from),
        to_address: to.clone(),
        owner_address: to,
        token_symbol: chain.native_symbol().to_string(),
        amount,
        unrepresentable_units,
        block_number,
        confirmations: confirmations(latest, block_number),
        observed_at: Utc::now(),
    })
}

/// Decode an ERC-20 `Transfer` log into a deposit.
///
/// Removed (reorged) logs and zero-value transfers yield `None`. A log that
/// does not have the ERC-20 shape is a malformed response. A value too large
/// for a decimal still yields a deposit, carrying the raw units.
pub fn decode_transfer_log(
    chain: Chain,
    log: &Log,
    token: &TokenContract,
    latest: u64,
) -> Result<Option<DepositEvent>> {
    if log.removed == Some(true) {
        return Ok(None);
    }

    if log.topics.len() != 3 || log.data.len() != 32 {
        return Err(Error::chain_unavailable(
            chain,
            format!("unexpected Transfer log shape from {:#x}", log.address),
        ));
    }

    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| Error::chain_unavailable(chain, "log without transaction hash"))?;
    let block_number = log
        .block_number
        .ok_or_else(|| Error::chain_unavailable(chain, "log without block number"))?
        .as_u64();

    let value = U256::from_big_endian(&log.data);
    if value.is_zero() {
        return Ok(None);
    }

    let tx_hash = format!("{:#x}", tx_hash);
    let to = format!("{:#x}", Address::from(log.topics[2]));
    let (amount, unrepresentable_units) = u256_amount(value, token.decimals);
    if let Some(units) = &unrepresentable_units {
        error!(%chain, %tx_hash, token = %token.symbol, %units, "token amount not representable, deposit needs manual review");
    }

    Ok(Some(DepositEvent {
        chain,
        tx_hash,
        from_address: format!("{:#x}", Address::from(log.topics[1])),
        to_address: to.clone(),
        owner_address: to,
        token_symbol: token.symbol.clone(),
        amount,
        unrepresentable_units,
        block_number,
        confirmations: confirmations(latest, block_number),
        observed_at: Utc::now(),
    }))
}
