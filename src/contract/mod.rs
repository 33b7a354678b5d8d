//! HTLC contracts: script construction, fee sizing and spend transactions.

pub mod btc;
pub mod fee;
pub mod script;
pub mod spend;

pub use fee::{DUST_LIMIT_SAT, FeeQuote, build_with_fee};
pub use script::SwapScript;
pub use spend::{BuiltSpend, ContractSpend, Networks, SpendBranch, UnsignedSpend};

/// Failure to build a contract spend. None of these touch swap state.
#[derive(Debug, thiserror::Error)]
pub enum SpendError {
    #[error("payout of {value} sat minus {fee} sat fee is at or below the dust limit")]
    DustOutput { value: u64, fee: u64 },

    #[error("invalid fee rate {0}")]
    InvalidFeeRate(f64),

    #[error("lock transaction has no output {0}")]
    MissingOutput(u32),

    #[error("contract output {0} is confidential")]
    ConfidentialOutput(u32),

    #[error("invalid destination address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("malformed transaction: {0}")]
    MalformedTx(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

/// Upper bound of a DER signature plus sighash byte, used to size unsigned spends.
pub(crate) const PLACEHOLDER_SIGNATURE_LEN: usize = 73;
