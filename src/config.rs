use std::time::Duration;

use lwk_wollet::ElementsNetwork;
use rust_decimal::Decimal;

use crate::chain::Chain;

/// Liquid produces a block roughly every minute, Bitcoin every ten.
pub const LIQUID_BLOCKS_PER_BITCOIN_BLOCK: u32 = 10;

/// Blocks kept in reserve between the payment's CLTV budget and the contract timeout.
pub const PAYMENT_CLTV_SAFETY_BLOCKS: u32 = 6;

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub required_confirmations: u32,
    /// Distance between the current height and a swap-in contract's timeout.
    pub swap_in_timeout_blocks: u32,
    pub fee_target_blocks: u32,
}

impl ChainConfig {
    pub fn bitcoin() -> Self {
        Self {
            min_amount: Decimal::new(1, 4),
            max_amount: Decimal::new(5, 2),
            required_confirmations: 2,
            swap_in_timeout_blocks: 144,
            fee_target_blocks: 6,
        }
    }

    pub fn liquid() -> Self {
        Self {
            min_amount: Decimal::new(1, 4),
            max_amount: Decimal::new(5, 2),
            required_confirmations: 2,
            swap_in_timeout_blocks: 1_440,
            fee_target_blocks: 2,
        }
    }
}

/// Timer and retry knobs of the swap state machines.
#[derive(Debug, Clone)]
pub struct Timings {
    pub expiry_check_interval: Duration,
    pub invoice_poll_interval: Duration,
    pub payment_attempts: u32,
    pub payment_retry_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            expiry_check_interval: Duration::from_secs(60),
            invoice_poll_interval: Duration::from_secs(1),
            payment_attempts: 3,
            payment_retry_delay: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bitcoin_network: bitcoin::Network,
    pub liquid_network: ElementsNetwork,
    pub bitcoin: ChainConfig,
    pub liquid: ChainConfig,
    /// Operator fee in percent of the swapped amount.
    pub fee_percent: Decimal,
    /// Age after which a swap that never got funded is closed as expired.
    pub swap_expiry: Duration,
    pub swap_out_invoice_expiry_secs: u32,
    pub swap_out_min_final_cltv_expiry: u32,
    /// Blocks between a swap-out contract timeout and the held HTLC's expiry.
    pub swap_out_cltv_margin: u32,
    pub timings: Timings,
}

impl EngineConfig {
    pub fn chain(&self, chain: Chain) -> &ChainConfig {
        match chain {
            Chain::Bitcoin => &self.bitcoin,
            Chain::Liquid => &self.liquid,
        }
    }

    /// Hex id of the Liquid policy asset (L-BTC), used to normalize asset/value outputs.
    pub fn policy_asset_hex(&self, chain: Chain) -> Option<String> {
        match chain {
            Chain::Bitcoin => None,
            Chain::Liquid => Some(self.liquid_network.policy_asset().to_string()),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bitcoin_network: bitcoin::Network::Regtest,
            liquid_network: ElementsNetwork::default_regtest(),
            bitcoin: ChainConfig::bitcoin(),
            liquid: ChainConfig::liquid(),
            fee_percent: Decimal::new(5, 1),
            swap_expiry: Duration::from_secs(60 * 60),
            swap_out_invoice_expiry_secs: 3600,
            swap_out_min_final_cltv_expiry: 144,
            swap_out_cltv_margin: 18,
            timings: Timings::default(),
        }
    }
}
