pub mod indexer;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::amount::sats_to_decimal;

/// Settlement layer holding a swap's on-chain contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Bitcoin,
    Liquid,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Bitcoin => "bitcoin",
            Chain::Liquid => "liquid",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bitcoin" => Ok(Chain::Bitcoin),
            "liquid" => Ok(Chain::Liquid),
            other => anyhow::bail!("unknown chain: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub chain_height: u32,
}

/// One entry of the indexer's event stream. `id` is the cursor value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexerEvent {
    pub id: u64,
    pub event: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Block(BlockEvent),
    Transaction(TransactionEvent),
    #[serde(other)]
    Unknown,
}

impl EventPayload {
    pub fn into_chain_event(self) -> Option<ChainEvent> {
        match self {
            EventPayload::Block(b) => Some(ChainEvent::Block(b)),
            EventPayload::Transaction(t) => Some(ChainEvent::Transaction(t)),
            EventPayload::Unknown => None,
        }
    }
}

/// Chain activity delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    Block(BlockEvent),
    Transaction(TransactionEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockEvent {
    pub height: u32,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    /// Address the indexer was tracking when it reported this transaction.
    pub tracked_source: String,
    pub outputs: Vec<TxOutputInfo>,
    #[serde(default)]
    pub inputs: Vec<TxInputRef>,
    pub transaction_data: TransactionData,
}

impl TransactionEvent {
    pub fn spends(&self, txid: &str, vout: u32) -> bool {
        self.inputs.iter().any(|i| i.txid == txid && i.vout == vout)
    }

    pub fn pays_to(&self, address: &str) -> bool {
        self.outputs
            .iter()
            .any(|o| o.address.as_deref() == Some(address))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionData {
    pub hash: String,
    pub raw: String,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxOutputInfo {
    pub vout: u32,
    #[serde(default)]
    pub address: Option<String>,
    pub amount: OutputAmount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInputRef {
    pub txid: String,
    pub vout: u32,
}

/// Base-layer outputs report a plain satoshi value, Liquid outputs an asset/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputAmount {
    Plain(u64),
    Asset { asset: String, value: u64 },
}

impl OutputAmount {
    /// Value in coin units. Outputs of any asset other than `policy_asset` count as zero.
    pub fn normalize(&self, policy_asset: Option<&str>) -> Decimal {
        match self {
            OutputAmount::Plain(sats) => sats_to_decimal(*sats),
            OutputAmount::Asset { asset, value } => match policy_asset {
                Some(policy) if policy.eq_ignore_ascii_case(asset) => sats_to_decimal(*value),
                _ => Decimal::ZERO,
            },
        }
    }
}

/// Client for the external per-chain indexer.
#[async_trait::async_trait]
pub trait IndexerClient: Send + Sync {
    async fn network_status(&self) -> Result<NetworkStatus>;

    async fn track_address(&self, address: &str) -> Result<()>;

    /// Fee rate in satoshis per virtual byte for confirmation within `target_blocks`.
    async fn fee_rate(&self, target_blocks: u32) -> Result<f64>;

    /// Returns the txid of the broadcast transaction.
    async fn broadcast_tx(&self, raw_hex: &str) -> Result<String>;

    /// Long-polls for events with an id greater than `after`.
    async fn get_events(&self, after: u64, timeout: Duration) -> Result<Vec<IndexerEvent>>;
}

/// Operator-controlled on-chain wallet for one settlement layer.
#[async_trait::async_trait]
pub trait ChainWallet: Send + Sync {
    async fn new_address(&self) -> Result<String>;

    /// Pays `amount_sat` to `address` and returns the funding txid.
    async fn send_to_address(&self, address: &str, amount_sat: u64) -> Result<String>;
}
