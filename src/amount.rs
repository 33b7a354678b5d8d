//! Fixed-point amounts.
//!
//! Swap records carry amounts as decimals with 8 fractional digits (whole coin
//! units). Scripts, fees and RPCs work in satoshis.

use anyhow::{Context as _, Result};
use rust_decimal::prelude::ToPrimitive as _;
use rust_decimal::{Decimal, RoundingStrategy};

pub const AMOUNT_SCALE: u32 = 8;
pub const SATS_PER_COIN: u64 = 100_000_000;

pub fn sats_to_decimal(sats: u64) -> Decimal {
    Decimal::from_i128_with_scale(i128::from(sats), AMOUNT_SCALE)
}

pub fn decimal_to_sats(amount: Decimal) -> Result<u64> {
    anyhow::ensure!(
        amount.scale() <= AMOUNT_SCALE || amount.round_dp(AMOUNT_SCALE) == amount,
        "amount {amount} has more than {AMOUNT_SCALE} fractional digits"
    );
    let scaled = amount
        .checked_mul(Decimal::from(SATS_PER_COIN))
        .with_context(|| format!("amount {amount} overflows"))?;
    scaled
        .to_u64()
        .with_context(|| format!("amount {amount} is not a valid satoshi value"))
}

/// `amount * (1 + percent / 100)`, rounded up to the amount scale.
pub fn add_fee_percent(amount: Decimal, percent: Decimal) -> Decimal {
    (amount + amount * percent / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::AwayFromZero)
}

/// `amount * (1 - percent / 100)`, rounded down to the amount scale.
pub fn sub_fee_percent(amount: Decimal, percent: Decimal) -> Decimal {
    (amount - amount * percent / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::ToZero)
}
