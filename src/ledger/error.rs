//! Error types for wallet ledger primitives.

use thiserror::Error;

use crate::Amount;
use crate::model::UserId;
use crate::store::StorageError;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("wallet of user {0} not found")]
    WalletNotFound(UserId),

    #[error("ledger amounts must be positive, got {0}")]
    NonPositiveAmount(Amount),

    #[error("insufficient spendable balance for user {0}: spendable {1}, required {2}")]
    InsufficientBalance(UserId, Amount, Amount),

    #[error("insufficient held balance for user {0}: held {1}, required {2}")]
    InsufficientHeld(UserId, Amount, Amount),

    #[error("amount {1} would overflow the wallet of user {0}")]
    Overflow(UserId, Amount),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
