//! Transactional storage contract.
//!
//! The engine never mutates shared state directly. Every operation runs inside
//! [`Storage::run_atomic`], which hands the closure a [`UnitOfWork`]:
//! reads are versioned, writes are buffered, and commit either applies every
//! write or none of them.

use crate::ledger::Wallet;
use crate::model::{
    BookingId, ExternalOrder, Location, LocationId, NewExternalOrder, NewRideBooking,
    NewWalletTransaction, OrderId, Ride, RideBooking, RideId, User, UserId, Vehicle, VehicleId,
    WalletTransaction,
};

mod error;
pub use error::{StorageError, StoreResult};

mod memory;
pub use memory::MemoryStore;

/// A storage backend able to run all-or-nothing units of work.
pub trait Storage: Send + Sync {
    /// Run `f` as one atomic unit. If `f` fails nothing is written; if the
    /// commit detects a conflicting concurrent write it fails with
    /// [`StorageError::Conflict`] and nothing is written either.
    fn run_atomic<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, E>,
        E: From<StorageError>;
}

/// Reads and writes available inside one atomic unit.
///
/// Row reads register the version they observed; the unit fails to commit if
/// any of them changed in the meantime. Reads see the unit's own writes.
pub trait UnitOfWork {
    fn user(&mut self, id: UserId) -> StoreResult<Option<User>>;
    fn insert_user(&mut self, user: User) -> StoreResult<()>;
    fn update_user(&mut self, user: User) -> StoreResult<()>;

    fn wallet(&mut self, user: UserId) -> StoreResult<Option<Wallet>>;
    fn insert_wallet(&mut self, wallet: Wallet) -> StoreResult<()>;
    fn update_wallet(&mut self, wallet: Wallet) -> StoreResult<()>;

    /// Append a ledger entry. Entries are insert-only.
    fn append_transaction(&mut self, entry: NewWalletTransaction)
    -> StoreResult<WalletTransaction>;
    /// Ledger entries of `user`, newest first.
    fn transactions(
        &mut self,
        user: UserId,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<WalletTransaction>>;

    fn ride(&mut self, id: RideId) -> StoreResult<Option<Ride>>;
    fn insert_ride(&mut self, ride: Ride) -> StoreResult<()>;
    fn update_ride(&mut self, ride: Ride) -> StoreResult<()>;

    fn location(&mut self, id: LocationId) -> StoreResult<Option<Location>>;
    fn insert_location(&mut self, location: Location) -> StoreResult<()>;

    fn vehicle(&mut self, id: VehicleId) -> StoreResult<Option<Vehicle>>;
    fn insert_vehicle(&mut self, vehicle: Vehicle) -> StoreResult<()>;

    fn booking(&mut self, id: BookingId) -> StoreResult<Option<RideBooking>>;
    /// Every booking of a ride. Registers the ride's booking set as read, so a
    /// concurrent insert or status change on that ride conflicts.
    fn bookings_for_ride(&mut self, ride: RideId) -> StoreResult<Vec<RideBooking>>;
    /// Every booking of a user, same conflict rules as [`Self::bookings_for_ride`].
    fn bookings_for_user(&mut self, user: UserId) -> StoreResult<Vec<RideBooking>>;
    /// Fails with [`StorageError::UniqueViolation`] if (ride, user) exists.
    fn insert_booking(&mut self, booking: NewRideBooking) -> StoreResult<RideBooking>;
    fn update_booking(&mut self, booking: RideBooking) -> StoreResult<()>;

    fn external_order(&mut self, id: OrderId) -> StoreResult<Option<ExternalOrder>>;
    fn insert_external_order(&mut self, order: NewExternalOrder) -> StoreResult<ExternalOrder>;
    fn update_external_order(&mut self, order: ExternalOrder) -> StoreResult<()>;

    fn booking_for(&mut self, ride: RideId, user: UserId) -> StoreResult<Option<RideBooking>> {
        Ok(self
            .bookings_for_ride(ride)?
            .into_iter()
            .find(|booking| booking.user == user))
    }
}
