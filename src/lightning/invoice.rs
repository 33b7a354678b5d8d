use std::str::FromStr as _;

use anyhow::Result;
use bitcoin::hashes::Hash as _;
use lightning_invoice::Bolt11Invoice;

/// The parts of a BOLT11 invoice the engine checks before accepting a swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceDetails {
    pub payment_hash: [u8; 32],
    pub amount_msat: Option<u64>,
    pub network: bitcoin::Network,
    pub min_final_cltv_expiry_delta: u64,
    pub is_expired: bool,
}

pub fn parse_bolt11(invoice: &str) -> Result<InvoiceDetails> {
    let invoice = Bolt11Invoice::from_str(invoice.trim())
        .map_err(|e| anyhow::anyhow!("parse BOLT11 invoice: {e:?}"))?;
    Ok(InvoiceDetails {
        payment_hash: invoice.payment_hash().to_byte_array(),
        amount_msat: invoice.amount_milli_satoshis(),
        network: invoice.network(),
        min_final_cltv_expiry_delta: invoice.min_final_cltv_expiry_delta(),
        is_expired: invoice.is_expired(),
    })
}

pub fn payment_hash_from_bolt11(invoice: &str) -> Result<[u8; 32]> {
    Ok(parse_bolt11(invoice)?.payment_hash)
}
