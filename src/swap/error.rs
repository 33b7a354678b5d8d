use rust_decimal::Decimal;
use uuid::Uuid;

use crate::chain::Chain;
use crate::contract::SpendError;

/// Errors surfaced to callers of the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("amount {amount} outside of [{min}, {max}] on {chain}")]
    AmountOutOfRange {
        chain: Chain,
        amount: Decimal,
        min: Decimal,
        max: Decimal,
    },

    #[error("invalid invoice: {0}")]
    InvalidInvoice(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid preimage hash: {0}")]
    InvalidPreimageHash(String),

    #[error("swap {0} not found")]
    NotFound(Uuid),

    #[error("swap {id} is {status}, which does not allow this operation")]
    WrongStatus { id: Uuid, status: String },

    #[error("transaction does not spend the contract of swap {0}")]
    UnrelatedTransaction(Uuid),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error(transparent)]
    Spend(#[from] SpendError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
