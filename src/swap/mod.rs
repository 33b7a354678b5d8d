pub mod error;
pub mod machine;
pub mod memory;
pub mod orchestrator;
pub mod store;
pub mod swap_in;
pub mod swap_out;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chain::Chain;

pub use error::SwapError;
pub use orchestrator::{CreateSwapIn, CreateSwapOut, Orchestrator};
pub use store::{CursorStore, SqliteStore, SwapRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapOutcome {
    Success,
    Refunded,
    Expired,
}

impl SwapOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapOutcome::Success => "SUCCESS",
            SwapOutcome::Refunded => "REFUNDED",
            SwapOutcome::Expired => "EXPIRED",
        }
    }
}

/// Lifecycle of a swap-in: the counterparty locks on-chain funds and the
/// operator pays their Lightning invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapInStatus {
    Created,
    ContractFundedUnconfirmed,
    PartialPaymentUnconfirmed,
    ContractFunded,
    PartialPaymentConfirmed,
    InvoicePaid,
    ContractClaimedUnconfirmed,
    ContractExpired,
    ContractRefundedUnconfirmed,
    Done,
}

impl SwapInStatus {
    pub fn can_transition_to(self, next: SwapInStatus) -> bool {
        use SwapInStatus::*;
        matches!(
            (self, next),
            (Created, ContractFundedUnconfirmed)
                | (Created, PartialPaymentUnconfirmed)
                | (Created, Done)
                | (ContractFundedUnconfirmed, ContractFunded)
                | (PartialPaymentUnconfirmed, PartialPaymentConfirmed)
                | (ContractFunded, InvoicePaid)
                | (InvoicePaid, ContractClaimedUnconfirmed)
                | (ContractClaimedUnconfirmed, Done)
                | (ContractFundedUnconfirmed, ContractExpired)
                | (ContractFunded, ContractExpired)
                | (PartialPaymentUnconfirmed, ContractExpired)
                | (PartialPaymentConfirmed, ContractExpired)
                | (ContractExpired, ContractRefundedUnconfirmed)
                | (ContractRefundedUnconfirmed, Done)
        )
    }

    /// Funding seen at the contract address, confirmed or not.
    pub fn is_funded(self) -> bool {
        matches!(
            self,
            SwapInStatus::ContractFundedUnconfirmed
                | SwapInStatus::ContractFunded
                | SwapInStatus::PartialPaymentUnconfirmed
                | SwapInStatus::PartialPaymentConfirmed
        )
    }
}

/// Lifecycle of a swap-out: the counterparty pays a hold invoice and the
/// operator locks on-chain funds they can claim with its preimage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapOutStatus {
    Created,
    InvoicePaymentIntentReceived,
    ContractFundedUnconfirmed,
    ContractFunded,
    ContractClaimedUnconfirmed,
    ContractExpired,
    ContractRefundedUnconfirmed,
    Done,
}

impl SwapOutStatus {
    pub fn can_transition_to(self, next: SwapOutStatus) -> bool {
        use SwapOutStatus::*;
        matches!(
            (self, next),
            (Created, InvoicePaymentIntentReceived)
                | (Created, Done)
                | (InvoicePaymentIntentReceived, ContractFundedUnconfirmed)
                | (InvoicePaymentIntentReceived, Done)
                | (ContractFundedUnconfirmed, ContractFunded)
                | (ContractFundedUnconfirmed, ContractClaimedUnconfirmed)
                | (ContractFunded, ContractClaimedUnconfirmed)
                | (ContractClaimedUnconfirmed, Done)
                | (ContractFundedUnconfirmed, ContractExpired)
                | (ContractFunded, ContractExpired)
                | (ContractExpired, ContractClaimedUnconfirmed)
                | (ContractExpired, ContractRefundedUnconfirmed)
                | (ContractRefundedUnconfirmed, Done)
        )
    }

    pub fn is_funded(self) -> bool {
        matches!(
            self,
            SwapOutStatus::ContractFundedUnconfirmed | SwapOutStatus::ContractFunded
        )
    }
}

/// A transaction as observed by the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedTx {
    pub txid: String,
    pub raw: String,
    pub height: Option<u32>,
}

impl ObservedTx {
    pub fn confirmations(&self, tip: u32) -> u32 {
        match self.height {
            Some(h) if h <= tip => tip - h + 1,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapCommon {
    pub id: Uuid,
    pub chain: Chain,
    pub input_amount: Decimal,
    pub output_amount: Decimal,
    pub lock_script: Option<String>,
    pub contract_address: Option<String>,
    /// Index of the operator key, derived from the operator mnemonic.
    pub key_index: u32,
    pub unlock_private_key: String,
    pub counterparty_public_key: String,
    pub timeout_block_height: Option<u32>,
    pub lock_tx: Option<ObservedTx>,
    pub lock_vout: Option<u32>,
    pub unlock_tx: Option<ObservedTx>,
    pub preimage: Option<String>,
    pub outcome: Option<SwapOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapIn {
    #[serde(flatten)]
    pub common: SwapCommon,
    pub status: SwapInStatus,
    /// Invoice the operator pays once the contract is funded.
    pub invoice: String,
    pub payment_hash: String,
    /// Operator address the claim pays to, set when the claim is built.
    pub sweep_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapOut {
    #[serde(flatten)]
    pub common: SwapCommon,
    pub status: SwapOutStatus,
    /// Hold invoice issued by the operator.
    pub invoice: String,
    pub preimage_hash: String,
    pub funding_txid: Option<String>,
    /// Operator address the refund pays to, set when the refund is built.
    pub sweep_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Swap {
    In(SwapIn),
    Out(SwapOut),
}

impl Swap {
    pub fn common(&self) -> &SwapCommon {
        match self {
            Swap::In(s) => &s.common,
            Swap::Out(s) => &s.common,
        }
    }

    pub fn id(&self) -> Uuid {
        self.common().id
    }

    pub fn chain(&self) -> Chain {
        self.common().chain
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Swap::In(_) => "in",
            Swap::Out(_) => "out",
        }
    }

    pub fn status_str(&self) -> String {
        let value = match self {
            Swap::In(s) => serde_json::to_value(s.status),
            Swap::Out(s) => serde_json::to_value(s.status),
        };
        match value {
            Ok(serde_json::Value::String(s)) => s,
            _ => String::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            Swap::In(s) => s.status == SwapInStatus::Done,
            Swap::Out(s) => s.status == SwapOutStatus::Done,
        }
    }
}
