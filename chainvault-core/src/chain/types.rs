//! Deposit detection types

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Chain;
use crate::error::{Error, Result};

/// An incoming transfer observed on chain.
///
/// Events are ephemeral. The same transfer is reported again on later polls
/// while it is still below the confirmation threshold, each time with a
/// higher `confirmations` count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositEvent {
    pub chain: Chain,
    pub tx_hash: String,
    pub from_address: String,
    /// Account the funds arrived in: the wallet itself, or for SPL tokens
    /// the wallet's token account
    pub to_address: String,
    /// Monitored wallet that controls `to_address`
    pub owner_address: String,
    pub token_symbol: String,
    /// Zero when `unrepresentable_units` is set
    pub amount: Decimal,
    /// The raw amount in the token's smallest unit when it does not fit a
    /// decimal. Such a deposit cannot be credited and is parked for review.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrepresentable_units: Option<String>,
    /// Block number on EVM chains, slot on Solana
    pub block_number: u64,
    pub confirmations: u64,
    pub observed_at: DateTime<Utc>,
}

impl DepositEvent {
    pub fn key(&self) -> DepositKey {
        DepositKey {
            chain: self.chain,
            tx_hash: self.tx_hash.clone(),
            to_address: self.to_address.clone(),
        }
    }

    pub fn is_representable(&self) -> bool {
        self.unrepresentable_units.is_none()
    }
}

/// Natural key of a deposit: one credited deposit per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DepositKey {
    pub chain: Chain,
    pub tx_hash: String,
    pub to_address: String,
}

impl fmt::Display for DepositKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.chain, self.tx_hash, self.to_address)
    }
}

/// Last scanned position of a chain
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Checkpoint {
    /// Nothing scanned yet
    #[default]
    Start,
    /// Every block up to and including `number` is settled
    Block { number: u64 },
    /// Per address, the newest signature up to which everything is finalized
    /// and processed. `slot` is the highest slot among those signatures.
    Signatures {
        slot: u64,
        cursors: BTreeMap<String, String>,
    },
}

impl Checkpoint {
    /// Scan position used to order checkpoints of the same chain
    pub fn position(&self) -> u64 {
        match self {
            Checkpoint::Start => 0,
            Checkpoint::Block { number } => *number,
            Checkpoint::Signatures { slot, .. } => *slot,
        }
    }

    /// Whether `self` may replace `previous` without moving backwards
    pub fn is_at_or_after(&self, previous: &Checkpoint) -> bool {
        match (previous, self) {
            (Checkpoint::Start, _) => true,
            (_, Checkpoint::Start) => false,
            (Checkpoint::Block { .. }, Checkpoint::Block { .. })
            | (Checkpoint::Signatures { .. }, Checkpoint::Signatures { .. }) => {
                self.position() >= previous.position()
            }
            _ => false,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_json(value: &str) -> Result<Self> {
        serde_json::from_str(value).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::Start => write!(f, "start"),
            Checkpoint::Block { number } => write!(f, "block {}", number),
            Checkpoint::Signatures { slot, cursors } => {
                write!(f, "slot {} ({} cursors)", slot, cursors.len())
            }
        }
    }
}

/// Result of one poll
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    /// Events in increasing block order
    pub events: Vec<DepositEvent>,
    pub checkpoint: Checkpoint,
}

impl PollOutcome {
    pub fn empty(checkpoint: Checkpoint) -> Self {
        Self {
            events: Vec::new(),
            checkpoint,
        }
    }
}

/// Polling interface over one chain's RPC endpoint
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain(&self) -> Chain;

    /// List transfers to `addresses` newer than `checkpoint`.
    ///
    /// Transient RPC failures and malformed responses fail with
    /// [`Error::ChainUnavailable`]. Nothing is persisted.
    async fn poll_incoming(
        &self,
        addresses: &HashSet<String>,
        checkpoint: &Checkpoint,
    ) -> Result<PollOutcome>;
}

/// Convert an integer amount in the smallest unit into a decimal
pub fn units_to_decimal(raw: u128, decimals: u32) -> Result<Decimal> {
    let raw = i128::try_from(raw)
        .map_err(|_| Error::InvalidInput(format!("amount {} out of range", raw)))?;

    Decimal::try_from_i128_with_scale(raw, decimals)
        .map(|amount| amount.normalize())
        .map_err(|e| Error::InvalidInput(format!("amount {} with {} decimals: {}", raw, decimals, e)))
}

/// Event amount for `raw` smallest units: the decimal amount, or zero and the
/// raw units as text when they do not fit a decimal
pub fn amount_from_units(raw: u128, decimals: u32) -> (Decimal, Option<String>) {
    match units_to_decimal(raw, decimals) {
        Ok(amount) => (amount, None),
        Err(_) => (Decimal::ZERO, Some(raw.to_string())),
    }
}

/// Merge events that share a natural key and token by summing their amounts.
///
/// A single transaction can move the same token to the same recipient more
/// than once (batched transfers). Only one deposit is recorded per natural
/// key, so the parts are credited together.
pub fn coalesce_events(events: Vec<DepositEvent>) -> Vec<DepositEvent> {
    let mut merged: Vec<DepositEvent> = Vec::with_capacity(events.len());
    let mut index: HashMap<(DepositKey, String), usize> = HashMap::new();

    for event in events {
        let slot = (event.key(), event.token_symbol.clone());
        match index.get(&slot) {
            Some(&position) => {
                let existing = &mut merged[position];
                match existing.amount.checked_add(event.amount) {
                    Some(total) if existing.is_representable() && event.is_representable() => existing.amount = total,
                    _ => {
                        let left = existing.unrepresentable_units.take().unwrap_or_else(|| existing.amount.to_string());
                        let right = event.unrepresentable_units.clone().unwrap_or_else(|| event.amount.to_string());
                        existing.amount = Decimal::ZERO;
                        existing.unrepresentable_units = Some(format!("{} + {}", left, right));
                    }
                }
                existing.confirmations = existing.confirmations.min(event.confirmations);
            }
            None => {
                index.insert(slot, merged.len());
                merged.push(event);
            }
        }
    }

    merged
}

/// Sort events by block, then transaction, then recipient
pub fn sort_events(events: &mut [DepositEvent]) {
    events.sort_by(|a, b| {
        (a.block_number, &a.tx_hash, &a.to_address, &a.token_symbol).cmp(&(
            b.block_number,
            &b.tx_hash,
            &b.to_address,
            &b.token_symbol,
        ))
    });
}
