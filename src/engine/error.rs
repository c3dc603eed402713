//! Error types returned by the engine.

use thiserror::Error;

use crate::booking::BookingError;
use crate::ledger::LedgerError;
use crate::model::{BookingId, OrderId, OrderStatus, RideId, UserId};
use crate::store::StorageError;

/// Top-level error returned by every [`Engine`](super::Engine) operation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("user {0} already exists")]
    UserExists(UserId),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("booking {0} not found")]
    BookingNotFound(BookingId),

    #[error("user {1} has no booking on ride {0}")]
    NoBookingOnRide(RideId, UserId),

    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    #[error("external order '{0}' was already recorded")]
    DuplicateOrder(String),

    #[error("order {0} is {1:?} and cannot be refunded")]
    OrderNotRefundable(OrderId, OrderStatus),

    #[error("booking failed: {0}")]
    Booking(#[from] BookingError),

    #[error("ledger operation failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Coarse classification callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    NotAuthorized,
    InvalidState,
    InsufficientBalance,
    CapacityExceeded,
    /// A concurrent write won; the request may be retried as a whole.
    ConcurrencyConflict,
    /// A time threshold or waiting window is not satisfied yet.
    Timing,
    Storage,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::UserNotFound(_)
            | EngineError::BookingNotFound(_)
            | EngineError::NoBookingOnRide(..)
            | EngineError::OrderNotFound(_) => ErrorKind::NotFound,
            EngineError::UserExists(_)
            | EngineError::DuplicateOrder(_)
            | EngineError::OrderNotRefundable(..) => ErrorKind::InvalidState,
            EngineError::Booking(e) => booking_kind(e),
            EngineError::Ledger(e) => ledger_kind(e),
            EngineError::Storage(e) => storage_kind(e),
        }
    }

    /// Only lost write races are worth repeating.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ConcurrencyConflict
    }
}

fn booking_kind(error: &BookingError) -> ErrorKind {
    match error {
        BookingError::ProfileIncomplete(_)
        | BookingError::InvalidRide(..)
        | BookingError::InvalidLocations(_) => ErrorKind::Validation,
        BookingError::UserNotFound(_)
        | BookingError::RideNotFound(_)
        | BookingError::NotFound(..) => ErrorKind::NotFound,
        BookingError::NotAuthorized(..) | BookingError::NotRideDriver(..) => {
            ErrorKind::NotAuthorized
        }
        BookingError::RideUnavailable(_)
        | BookingError::RideExists(_)
        | BookingError::DuplicateBooking(..)
        | BookingError::ConcurrentActiveRide(_)
        | BookingError::InvalidState(..)
        | BookingError::InvalidRideState(..) => ErrorKind::InvalidState,
        BookingError::CapacityExceeded(..) => ErrorKind::CapacityExceeded,
        BookingError::TooEarly(..) | BookingError::InsufficientWaitElapsed(..) => {
            ErrorKind::Timing
        }
        BookingError::Ledger(e) => ledger_kind(e),
        BookingError::Storage(e) => storage_kind(e),
    }
}

fn ledger_kind(error: &LedgerError) -> ErrorKind {
    match error {
        LedgerError::WalletNotFound(_) => ErrorKind::NotFound,
        LedgerError::NonPositiveAmount(_) | LedgerError::Overflow(..) => ErrorKind::Validation,
        LedgerError::InsufficientBalance(..) => ErrorKind::InsufficientBalance,
        LedgerError::InsufficientHeld(..) => ErrorKind::InvalidState,
        LedgerError::Storage(e) => storage_kind(e),
    }
}

fn storage_kind(error: &StorageError) -> ErrorKind {
    match error {
        StorageError::Conflict => ErrorKind::ConcurrencyConflict,
        StorageError::UniqueViolation(_) => ErrorKind::Validation,
        StorageError::RowMissing(..) => ErrorKind::NotFound,
        StorageError::Unavailable(_) => ErrorKind::Storage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Amount;
    use crate::booking::BookingOperation;

    #[test]
    fn conflicts_are_retryable_wherever_they_surface() {
        let direct = EngineError::from(StorageError::Conflict);
        let via_ledger = EngineError::from(LedgerError::Storage(StorageError::Conflict));
        let via_booking = EngineError::from(BookingError::Ledger(LedgerError::Storage(
            StorageError::Conflict,
        )));
        for error in [direct, via_ledger, via_booking] {
            assert_eq!(error.kind(), ErrorKind::ConcurrencyConflict);
            assert!(error.is_retryable());
        }
    }

    #[test]
    fn business_errors_are_terminal() {
        let cases = [
            (
                EngineError::from(BookingError::CapacityExceeded(1, 3)),
                ErrorKind::CapacityExceeded,
            ),
            (
                EngineError::from(BookingError::TooEarly(BookingOperation::ActivateByDriver, 1)),
                ErrorKind::Timing,
            ),
            (
                EngineError::from(BookingError::NotAuthorized(
                    BookingOperation::CancelByRider,
                    4,
                    9,
                )),
                ErrorKind::NotAuthorized,
            ),
            (
                EngineError::from(BookingError::Ledger(LedgerError::InsufficientBalance(
                    1,
                    Amount::ZERO,
                    Amount::from_whole(100),
                ))),
                ErrorKind::InsufficientBalance,
            ),
            (
                EngineError::Validation("page must be at least 1".to_string()),
                ErrorKind::Validation,
            ),
        ];
        for (error, kind) in cases {
            assert_eq!(error.kind(), kind, "{error}");
            assert!(!error.is_retryable());
        }
    }

    #[test]
    fn existing_rows_are_state_conflicts() {
        let cases = [
            EngineError::from(BookingError::DuplicateBooking(3, 7)),
            EngineError::from(BookingError::RideExists(3)),
            EngineError::UserExists(7),
            EngineError::DuplicateOrder("mart-1".to_string()),
        ];
        for error in cases {
            assert_eq!(error.kind(), ErrorKind::InvalidState, "{error}");
        }
    }

    #[test]
    fn wallet_overflow_is_rejected_input() {
        let error = EngineError::from(LedgerError::Overflow(1, Amount::from_whole(1)));
        assert_eq!(error.kind(), ErrorKind::Validation);
        assert!(!error.is_retryable());
    }

    #[test]
    fn display_is_human_readable() {
        let error = EngineError::from(BookingError::DuplicateBooking(3, 7));
        assert_eq!(
            error.to_string(),
            "booking failed: user 7 has already booked ride 3"
        );
    }
}
