use crate::Amount;
use crate::model::{BookingId, BookingStatus, RideId, UserId};

/// A fine charged as part of a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fine {
    pub user: UserId,
    pub amount: Amount,
}

/// The ledger effect a transition committed together with its state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEffect {
    /// State change only.
    None,
    /// Rider funds reserved at booking.
    Hold { user: UserId, amount: Amount },
    /// Rider hold settled and the same amount paid out to the driver.
    Settle {
        rider: UserId,
        driver: UserId,
        amount: Amount,
    },
    /// Rider hold released, possibly with a penalty on top.
    Release {
        user: UserId,
        amount: Amount,
        fine: Option<Fine>,
    },
}

/// Result of a booking transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingOutcome {
    pub booking: BookingId,
    pub ride: RideId,
    pub rider: UserId,
    pub driver: UserId,
    pub status: BookingStatus,
    pub ledger: LedgerEffect,
}

/// Result of completing a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub outcome: BookingOutcome,
    pub ce_points_earned: Amount,
}
