//! Error types for booking transitions.

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::model::{BookingId, BookingStatus, RideId, RideStatus, UserId};
use crate::store::StorageError;

/// The transition being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingOperation {
    Book,
    ActivateByRider,
    ActivateByDriver,
    Complete,
    CancelByRider,
    CancelByDriver,
    CancelNoShow,
    CancelOnRideCancel,
    CreateRide,
    StartRide,
    CancelRide,
}

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("user {0} must complete their profile before booking")]
    ProfileIncomplete(UserId),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("ride {0} not found")]
    RideNotFound(RideId),

    #[error("ride {0} already exists")]
    RideExists(RideId),

    #[error("ride {0} is not available for booking")]
    RideUnavailable(RideId),

    #[error("ride {0} is invalid: {1}")]
    InvalidRide(RideId, &'static str),

    #[error("ride {0} has reached maximum passenger capacity of {1}")]
    CapacityExceeded(RideId, u32),

    #[error("user {1} has already booked ride {0}")]
    DuplicateBooking(RideId, UserId),

    #[error("user {0} has an active ride, complete it before booking a new one")]
    ConcurrentActiveRide(UserId),

    #[error("{0:?}: booking {1} not found")]
    NotFound(BookingOperation, BookingId),

    #[error("{0:?}: user {2} is not authorized to manage booking {1}")]
    NotAuthorized(BookingOperation, BookingId, UserId),

    #[error("{0:?}: user {2} is not the driver of ride {1}")]
    NotRideDriver(BookingOperation, RideId, UserId),

    #[error("{0:?}: booking {1} is {2:?}")]
    InvalidState(BookingOperation, BookingId, BookingStatus),

    #[error("{0:?}: ride {1} is {2:?}")]
    InvalidRideState(BookingOperation, RideId, RideStatus),

    #[error("{0:?}: ride {1} has not reached its starting time")]
    TooEarly(BookingOperation, RideId),

    #[error("{0:?}: waiting time for ride {1} has not elapsed yet")]
    InsufficientWaitElapsed(BookingOperation, RideId),

    #[error("ride {0}: both starting and destination locations must be defined")]
    InvalidLocations(RideId),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
