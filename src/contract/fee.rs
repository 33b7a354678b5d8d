//! Two-pass fee sizing for contract spends.
//!
//! Pass one builds the spend with a nominal fee through the real signing path
//! (with a zero placeholder secret) and measures its virtual size. Pass two
//! rebuilds it with `ceil((vsize + input_count) * fee_rate)` deducted from the
//! contract output.

use super::SpendError;

/// Payouts at or below this value are rejected instead of broadcast.
pub const DUST_LIMIT_SAT: u64 = 1_000;

const FEE_PASS_AMOUNT_SAT: u64 = 1;

/// Anything whose virtual size can be measured after it is built.
pub trait VirtualSize {
    fn virtual_size(&self) -> usize;
}

impl VirtualSize for bitcoin::Transaction {
    fn virtual_size(&self) -> usize {
        self.vsize()
    }
}

impl VirtualSize for lwk_wollet::elements::Transaction {
    fn virtual_size(&self) -> usize {
        self.weight().div_ceil(4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeQuote {
    pub vsize: usize,
    pub fee: u64,
    pub payout: u64,
}

pub fn fee_for(vsize: usize, input_count: usize, fee_rate: f64) -> u64 {
    ((vsize + input_count) as f64 * fee_rate).ceil() as u64
}

/// Runs both passes of `build(fee, is_fee_pass)` over a contract output worth `input_value`.
pub fn build_with_fee<T, F>(
    input_value: u64,
    input_count: usize,
    fee_rate: f64,
    mut build: F,
) -> Result<(T, FeeQuote), SpendError>
where
    T: VirtualSize,
    F: FnMut(u64, bool) -> Result<T, SpendError>,
{
    if !(fee_rate.is_finite() && fee_rate > 0.0) {
        return Err(SpendError::InvalidFeeRate(fee_rate));
    }
    if input_value <= FEE_PASS_AMOUNT_SAT {
        return Err(SpendError::DustOutput {
            value: input_value,
            fee: FEE_PASS_AMOUNT_SAT,
        });
    }

    let measured = build(FEE_PASS_AMOUNT_SAT, true)?;
    let vsize = measured.virtual_size();

    let fee = fee_for(vsize, input_count, fee_rate);
    let payout = input_value.saturating_sub(fee);
    if payout <= DUST_LIMIT_SAT {
        return Err(SpendError::DustOutput {
            value: input_value,
            fee,
        });
    }

    let tx = build(fee, false)?;
    Ok((tx, FeeQuote { vsize, fee, payout }))
}
