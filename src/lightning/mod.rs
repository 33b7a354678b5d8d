pub mod invoice;
pub mod lnd;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// State of an invoice issued by the operator's node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceState {
    Open,
    /// An HTLC is held against a hold invoice but not yet settled.
    Accepted,
    Settled,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvoiceLookup {
    pub state: InvoiceState,
    /// Lowest expiry height of the HTLCs held against the invoice.
    pub htlc_expiry: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct HoldInvoiceRequest {
    pub payment_hash: [u8; 32],
    pub amount_sat: u64,
    pub expiry_secs: u32,
    pub cltv_expiry: u32,
    pub memo: String,
}

/// Operations the engine needs from the operator's Lightning node.
#[async_trait::async_trait]
pub trait LightningClient: Send + Sync {
    /// Pays `invoice` with at most `cltv_limit` blocks of total time lock and
    /// returns the revealed preimage.
    async fn send_payment(&self, invoice: &str, cltv_limit: u32) -> Result<[u8; 32]>;

    /// Preimage of an already completed outgoing payment, if any.
    async fn find_payment_preimage(&self, payment_hash: &[u8; 32]) -> Result<Option<[u8; 32]>>;

    /// Returns the BOLT11 encoding of the new invoice.
    async fn add_hold_invoice(&self, req: HoldInvoiceRequest) -> Result<String>;

    async fn lookup_invoice(&self, payment_hash: &[u8; 32]) -> Result<InvoiceLookup>;

    async fn settle_invoice(&self, preimage: &[u8; 32]) -> Result<()>;

    async fn cancel_invoice(&self, payment_hash: &[u8; 32]) -> Result<()>;
}
