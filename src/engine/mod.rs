//! Ride booking engine.
//!
//! The engine is the entry point request handlers call. Every operation runs as
//! one atomic unit on the configured [`Storage`], is retried when it loses a
//! write race, and is logged with its outcome. Notifications go out only after
//! the unit committed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::Amount;
use crate::booking::{self, BookingError, BookingOutcome, Completion, NewRide};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::ledger::{self, LedgerError, WalletBalance};
use crate::model::{
    BookingId, ExternalOrder, Location, NewExternalOrder, OrderId, OrderStatus, Ride, RideBooking,
    RideId, User, UserId, Vehicle, WalletTransaction,
};
use crate::notify::{LogNotifier, Notification, Notifier};
use crate::store::{MemoryStore, Storage, StorageError, UnitOfWork};

mod error;
pub use error::{EngineError, ErrorKind};

/// Largest page [`Engine::list_transactions`] serves.
pub const MAX_PAGE_LIMIT: usize = 100;

/// Who is marking a booking as started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Rider,
    Driver,
}

/// Why a booking is being cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The rider withdrew.
    Rider,
    /// The driver dropped the rider.
    DriverVoluntary,
    /// The rider never showed up at the pickup point.
    DriverNoShow,
    /// The whole ride was called off.
    RideCancelled,
}

/// The booking engine.
pub struct Engine<S: Storage = MemoryStore> {
    store: S,
    config: Config,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
}

/// Public API
impl<S: Storage> Engine<S> {
    pub fn new(store: S, config: Config) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create a user together with their empty wallet.
    pub async fn register_user(&self, user: User) -> Result<User, EngineError> {
        let id = user.id;
        let result = self
            .atomic("register_user", |tx, _| -> Result<_, EngineError> {
                tx.insert_user(user.clone()).map_err(|e| match e {
                    StorageError::UniqueViolation(_) => EngineError::UserExists(id),
                    other => other.into(),
                })?;
                ledger::open_wallet(tx, id)?;
                Ok(user.clone())
            })
            .await;
        Self::log_result("register_user", id, id, None, &result);
        result
    }

    pub async fn get_user(&self, user: UserId) -> Result<User, EngineError> {
        self.atomic("get_user", |tx, _| -> Result<_, EngineError> {
            tx.user(user)?.ok_or(EngineError::UserNotFound(user))
        })
        .await
    }

    pub async fn add_location(&self, location: Location) -> Result<(), EngineError> {
        self.atomic("add_location", |tx, _| -> Result<_, EngineError> {
            tx.insert_location(location.clone())?;
            Ok(())
        })
        .await
    }

    pub async fn add_vehicle(&self, vehicle: Vehicle) -> Result<(), EngineError> {
        self.atomic("add_vehicle", |tx, _| -> Result<_, EngineError> {
            if tx.user(vehicle.owner)?.is_none() {
                return Err(EngineError::UserNotFound(vehicle.owner));
            }
            tx.insert_vehicle(vehicle.clone())?;
            Ok(())
        })
        .await
    }

    pub async fn create_ride(&self, new: NewRide) -> Result<Ride, EngineError> {
        let (driver, ride) = (new.driver, new.id);
        let result = self
            .atomic("create_ride", |tx, now| -> Result<_, BookingError> {
                if new.starting_time <= now {
                    return Err(BookingError::InvalidRide(
                        new.id,
                        "starting time must be in the future",
                    ));
                }
                booking::create_ride(tx, new.clone())
            })
            .await;
        Self::log_result("create_ride", driver, ride, None, &result);
        result
    }

    pub async fn start_ride(&self, driver: UserId, ride: RideId) -> Result<Ride, EngineError> {
        let result = self
            .atomic("start_ride", |tx, _| booking::start_ride(tx, driver, ride))
            .await;
        Self::log_result("start_ride", driver, ride, None, &result);
        result
    }

    /// Cancel a ride and release every seat still booked on it.
    pub async fn cancel_ride(
        &self,
        driver: UserId,
        ride: RideId,
    ) -> Result<Vec<BookingOutcome>, EngineError> {
        let result = self
            .atomic("cancel_ride", |tx, now| {
                booking::cancel_ride(tx, now, driver, ride)
            })
            .await;
        Self::log_result("cancel_ride", driver, ride, None, &result);
        result
    }

    /// Reserve a seat on `ride` for `user` and hold its cost.
    pub async fn book_ride(
        &self,
        user: UserId,
        ride: RideId,
    ) -> Result<BookingOutcome, EngineError> {
        let rules = &self.config.rules;
        let result = self
            .atomic("book", |tx, now| -> Result<_, BookingError> {
                let outcome = booking::book(tx, now, rules, user, ride)?;
                let name = rider_name(tx, user)?;
                Ok((outcome, name))
            })
            .await;
        Self::log_result("book", user, ride, None, &result);

        let (outcome, name) = result?;
        self.dispatch(Notification::booking_confirmed(
            outcome.driver,
            outcome.booking,
            &name,
        ));
        Ok(outcome)
    }

    /// Mark a booking as started, either by its rider (arrived at pickup) or
    /// by the ride's driver (picked the rider up).
    pub async fn activate_booking(
        &self,
        actor_id: UserId,
        booking: BookingId,
        actor: Actor,
    ) -> Result<BookingOutcome, EngineError> {
        let result = self
            .atomic("activate", |tx, now| -> Result<_, BookingError> {
                let outcome = match actor {
                    Actor::Rider => booking::activate_by_rider(tx, actor_id, booking)?,
                    Actor::Driver => booking::activate_by_driver(tx, now, actor_id, booking)?,
                };
                let name = rider_name(tx, outcome.rider)?;
                Ok((outcome, name))
            })
            .await;
        Self::log_result("activate", actor_id, booking, None, &result);

        let (outcome, name) = result?;
        if actor == Actor::Rider {
            self.dispatch(Notification::rider_arrived(
                outcome.driver,
                outcome.booking,
                &name,
            ));
        }
        Ok(outcome)
    }

    /// Drop the rider off, settle the fare and award CE points.
    pub async fn complete_booking(
        &self,
        driver: UserId,
        booking: BookingId,
    ) -> Result<Completion, EngineError> {
        let rules = &self.config.rules;
        let result = self
            .atomic("complete", |tx, now| {
                booking::complete(tx, now, rules, driver, booking)
            })
            .await;
        Self::log_result("complete", driver, booking, None, &result);
        result
    }

    pub async fn cancel_booking(
        &self,
        actor_id: UserId,
        booking: BookingId,
        reason: CancelReason,
    ) -> Result<BookingOutcome, EngineError> {
        let rules = &self.config.rules;
        let result = self
            .atomic("cancel", |tx, now| -> Result<_, BookingError> {
                let outcome = match reason {
                    CancelReason::Rider => {
                        booking::cancel_by_rider(tx, now, rules, actor_id, booking)?
                    }
                    CancelReason::DriverVoluntary => {
                        booking::cancel_by_driver(tx, now, rules, actor_id, booking)?
                    }
                    CancelReason::DriverNoShow => {
                        booking::cancel_no_show(tx, now, rules, actor_id, booking)?
                    }
                    CancelReason::RideCancelled => {
                        booking::cancel_on_ride_cancel(tx, now, actor_id, booking)?
                    }
                };
                let name = rider_name(tx, outcome.rider)?;
                Ok((outcome, name))
            })
            .await;
        Self::log_result("cancel", actor_id, booking, None, &result);

        let (outcome, name) = result?;
        if reason == CancelReason::Rider {
            self.dispatch(Notification::booking_cancelled(
                outcome.driver,
                outcome.booking,
                &name,
            ));
        }
        Ok(outcome)
    }

    pub async fn get_booking(&self, booking: BookingId) -> Result<RideBooking, EngineError> {
        self.atomic("get_booking", |tx, _| -> Result<_, EngineError> {
            tx.booking(booking)?
                .ok_or(EngineError::BookingNotFound(booking))
        })
        .await
    }

    /// The booking `user` holds on `ride`, if any.
    pub async fn find_booking(
        &self,
        ride: RideId,
        user: UserId,
    ) -> Result<Option<RideBooking>, EngineError> {
        self.atomic("find_booking", |tx, _| tx.booking_for(ride, user))
            .await
    }

    /// Booking history of `user`, newest first.
    pub async fn user_bookings(
        &self,
        user: UserId,
        limit: usize,
    ) -> Result<Vec<RideBooking>, EngineError> {
        let mut bookings = self
            .atomic("user_bookings", |tx, _| tx.bookings_for_user(user))
            .await?;
        bookings.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        bookings.truncate(limit);
        Ok(bookings)
    }

    pub async fn get_wallet(&self, user: UserId) -> Result<WalletBalance, EngineError> {
        self.atomic("get_wallet", |tx, _| ledger::balance(tx, user))
            .await
    }

    pub async fn has_sufficient_spendable_balance(
        &self,
        user: UserId,
        amount: Amount,
    ) -> Result<bool, EngineError> {
        self.atomic("balance_check", |tx, _| {
            ledger::has_sufficient_spendable_balance(tx, user, amount)
        })
        .await
    }

    /// One page of `user`'s ledger, newest first. `page` starts at 1.
    pub async fn list_transactions(
        &self,
        user: UserId,
        page: usize,
        limit: usize,
    ) -> Result<Vec<WalletTransaction>, EngineError> {
        if page == 0 {
            return Err(EngineError::Validation(
                "page must be at least 1".to_string(),
            ));
        }
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(EngineError::Validation(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }
        let offset = (page - 1).saturating_mul(limit);
        self.atomic("list_transactions", |tx, _| -> Result<_, EngineError> {
            if tx.user(user)?.is_none() {
                return Err(EngineError::UserNotFound(user));
            }
            Ok(tx.transactions(user, offset, limit)?)
        })
        .await
    }

    /// Credit carbon points bought outside the booking flow.
    pub async fn top_up(
        &self,
        user: UserId,
        amount: Amount,
    ) -> Result<WalletTransaction, EngineError> {
        let result = self
            .atomic("top_up", |tx, now| ledger::top_up(tx, now, user, amount))
            .await;
        Self::log_result("top_up", user, user, Some(amount), &result);
        result
    }

    /// Spend `coins` carbon points on a mart recharge. The order row and the
    /// wallet debit commit together.
    pub async fn recharge_mart(
        &self,
        user: UserId,
        ext_order_id: &str,
        coins: Amount,
    ) -> Result<ExternalOrder, EngineError> {
        if !coins.is_positive() {
            return Err(EngineError::Validation(
                "carbon coin amount must be positive".to_string(),
            ));
        }
        if ext_order_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "external order id is required".to_string(),
            ));
        }
        let rules = &self.config.rules;
        let result = self
            .atomic("recharge_mart", |tx, now| -> Result<_, EngineError> {
                if !ledger::has_sufficient_spendable_balance(tx, user, coins)? {
                    let spendable = ledger::balance(tx, user)?.spendable;
                    return Err(LedgerError::InsufficientBalance(user, spendable, coins).into());
                }
                let order = tx.insert_external_order(NewExternalOrder {
                    user,
                    ext_order_id: ext_order_id.to_string(),
                    amount: rules.mart_amount_for(coins),
                    coin_amount: coins,
                    conversion_rate: rules.mart_conversion_rate,
                    status: OrderStatus::Completed,
                    created_at: now,
                })?;
                ledger::order_purchase(tx, now, user, order.id, coins)?;
                Ok(order)
            })
            .await
            .map_err(|e| match e {
                // raised in the unit or at commit, whichever saw the other order first
                EngineError::Storage(StorageError::UniqueViolation(_)) => {
                    EngineError::DuplicateOrder(ext_order_id.to_string())
                }
                other => other,
            });
        Self::log_result("recharge_mart", user, user, Some(coins), &result);
        result
    }

    /// Return the carbon points of a completed mart order.
    pub async fn refund_order(
        &self,
        user: UserId,
        order: OrderId,
    ) -> Result<ExternalOrder, EngineError> {
        let result = self
            .atomic("refund_order", |tx, now| -> Result<_, EngineError> {
                let mut row = tx
                    .external_order(order)?
                    .filter(|row| row.user == user)
                    .ok_or(EngineError::OrderNotFound(order))?;
                if row.status != OrderStatus::Completed {
                    return Err(EngineError::OrderNotRefundable(order, row.status));
                }
                ledger::order_refund(tx, now, row.user, order, row.coin_amount)?;
                row.status = OrderStatus::Refunded;
                tx.update_external_order(row.clone())?;
                Ok(row)
            })
            .await;
        let amount = result.as_ref().ok().map(|row| row.coin_amount);
        Self::log_result("refund_order", user, order, amount, &result);
        result
    }
}

/// Private API
impl<S: Storage> Engine<S> {
    /// Run `f` as one unit, retrying it from scratch while it loses write
    /// races. `now` is read again for every attempt.
    async fn atomic<T, E, F>(&self, op: &'static str, mut f: F) -> Result<T, EngineError>
    where
        F: FnMut(&mut dyn UnitOfWork, DateTime<Utc>) -> Result<T, E>,
        E: From<StorageError> + Into<EngineError>,
    {
        let retry = self.config.retry;
        let mut attempt = 1;
        loop {
            let now = self.clock.now();
            let error: EngineError = match self.store.run_atomic(|tx| f(tx, now)) {
                Ok(value) => return Ok(value),
                Err(e) => e.into(),
            };
            if !error.is_retryable() || attempt >= retry.max_attempts {
                return Err(error);
            }
            debug!(op, attempt, "unit of work conflicted, retrying");
            tokio::time::sleep(retry.backoff(attempt)).await;
            attempt += 1;
        }
    }

    /// Best-effort delivery; a failure never undoes what was committed.
    fn dispatch(&self, notification: Notification) {
        let user = notification.user;
        let event = notification.event.name();
        if let Err(e) = self.notifier.notify(notification) {
            warn!(user = user, event = event, reason = %e, "notification not delivered");
        }
    }

    /// Small helper to log operation results
    fn log_result<T, E: std::fmt::Display>(
        op: &str,
        user: UserId,
        subject: u64,
        amount: Option<Amount>,
        result: &Result<T, E>,
    ) {
        match (result, amount) {
            (Ok(_), Some(amt)) => {
                info!(
                    user = %user,
                    subject = %subject,
                    amount = %amt,
                    "{op} applied"
                );
            }
            (Ok(_), None) => {
                info!(
                    user = %user,
                    subject = %subject,
                    "{op} applied"
                );
            }
            (Err(e), Some(amt)) => {
                info!(
                    user = %user,
                    subject = %subject,
                    amount = %amt,
                    reason = %e,
                    "{op} skipped"
                );
            }
            (Err(e), None) => {
                info!(
                    user = %user,
                    subject = %subject,
                    reason = %e,
                    "{op} skipped"
                );
            }
        }
    }
}

fn rider_name(tx: &mut dyn UnitOfWork, user: UserId) -> Result<String, StorageError> {
    Ok(tx.user(user)?.map(|u| u.name).unwrap_or_default())
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(MemoryStore::new(), Config::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{RetryPolicy, Rules};
    use crate::model::{BookingStatus, Direction, Purpose, VehicleKind};
    use crate::notify::{ChannelNotifier, Event, NotifyError};

    // test utils

    const RIDER: UserId = 1;
    const DRIVER: UserId = 2;
    const RIDE: RideId = 10;

    fn cp(amount: i64) -> Amount {
        Amount::from_whole(amount)
    }

    fn start() -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + Duration::days(1)
    }

    /// Rider with 500 CP, a driver with a four-wheeler, and a 2-seat ride from
    /// a location 4 km out to the campus, starting in 60 minutes.
    async fn fixture_with<S: Storage>(store: S, config: Config) -> (Engine<S>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start() - Duration::minutes(60)));
        let engine = Engine::new(store, config).with_clock(clock.clone());

        engine
            .register_user(User::new(RIDER, "Asha", "asha@example.com"))
            .await
            .unwrap();
        engine
            .register_user(User::new(DRIVER, "Ravi", "ravi@example.com"))
            .await
            .unwrap();
        engine.top_up(RIDER, cp(500)).await.unwrap();
        engine
            .add_location(Location {
                id: 1,
                name: "Campus".to_string(),
                is_organization: true,
                distance_from_org: 0.0,
            })
            .await
            .unwrap();
        engine
            .add_location(Location {
                id: 2,
                name: "Old Town".to_string(),
                is_organization: false,
                distance_from_org: 4.0,
            })
            .await
            .unwrap();
        engine
            .add_vehicle(Vehicle {
                id: 1,
                owner: DRIVER,
                kind: VehicleKind::FourWheeler,
            })
            .await
            .unwrap();
        engine
            .create_ride(NewRide {
                id: RIDE,
                driver: DRIVER,
                starting_time: start(),
                max_passengers: 2,
                starting_location: 2,
                destination_location: 1,
                vehicle: Some(1),
            })
            .await
            .unwrap();
        (engine, clock)
    }

    async fn fixture() -> (Engine, Arc<ManualClock>) {
        fixture_with(MemoryStore::new(), Config::default()).await
    }

    /// Fails the first `conflicts` units with a write conflict.
    struct FlakyStore {
        inner: MemoryStore,
        conflicts: AtomicU32,
    }

    impl FlakyStore {
        fn new(conflicts: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                conflicts: AtomicU32::new(conflicts),
            }
        }

        fn arm(&self, conflicts: u32) {
            self.conflicts.store(conflicts, Ordering::SeqCst);
        }
    }

    impl Storage for FlakyStore {
        fn run_atomic<T, E, F>(&self, f: F) -> Result<T, E>
        where
            F: FnOnce(&mut dyn UnitOfWork) -> Result<T, E>,
            E: From<StorageError>,
        {
            let remaining = self.conflicts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.conflicts.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::Conflict.into());
            }
            self.inner.run_atomic(f)
        }
    }

    struct BrokenNotifier;

    impl Notifier for BrokenNotifier {
        fn notify(&self, _: Notification) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected("push service down".to_string()))
        }
    }

    #[tokio::test]
    async fn book_activate_complete() {
        let (engine, clock) = fixture().await;

        let booked = engine.book_ride(RIDER, RIDE).await.unwrap();
        assert_eq!(booked.status, BookingStatus::Confirmed);
        let wallet = engine.get_wallet(RIDER).await.unwrap();
        assert_eq!(wallet.total, cp(500));
        assert_eq!(wallet.spendable, cp(400));
        assert_eq!(wallet.held, cp(100));

        clock.set(start() - Duration::minutes(2));
        let active = engine
            .activate_booking(RIDER, booked.booking, Actor::Rider)
            .await
            .unwrap();
        assert_eq!(active.status, BookingStatus::Active);

        clock.set(start() + Duration::minutes(25));
        let done = engine
            .complete_booking(DRIVER, booked.booking)
            .await
            .unwrap();
        assert_eq!(done.ce_points_earned, cp(500));

        let rider = engine.get_wallet(RIDER).await.unwrap();
        assert_eq!(rider.total, cp(400));
        assert_eq!(rider.spendable, cp(400));
        assert_eq!(rider.held, Amount::ZERO);
        let driver = engine.get_wallet(DRIVER).await.unwrap();
        assert_eq!(driver.total, cp(100));
        assert_eq!(driver.spendable, cp(100));

        let booking = engine.get_booking(booked.booking).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Completed);
        assert_eq!(booking.ce_points_earned, cp(500));
        assert_eq!(engine.get_user(RIDER).await.unwrap().ce_points, cp(500));

        let history = engine.list_transactions(RIDER, 1, 10).await.unwrap();
        let purposes: Vec<_> = history.iter().map(|e| e.purpose).collect();
        assert_eq!(
            purposes,
            vec![Purpose::BookingSettle, Purpose::BookingReserve, Purpose::TopUp]
        );
        let payout = engine.list_transactions(DRIVER, 1, 10).await.unwrap();
        assert_eq!(payout.len(), 1);
        assert_eq!(payout[0].direction, Direction::Credit);
        assert_eq!(payout[0].purpose, Purpose::Payout);
        assert_eq!(payout[0].booking, Some(booked.booking));
    }

    #[tokio::test]
    async fn late_rider_cancel_is_fined() {
        let (engine, clock) = fixture().await;
        let booked = engine.book_ride(RIDER, RIDE).await.unwrap();

        clock.set(start() - Duration::minutes(20));
        let cancelled = engine
            .cancel_booking(RIDER, booked.booking, CancelReason::Rider)
            .await
            .unwrap();
        assert_eq!(cancelled.status, BookingStatus::CancelledUser);

        let wallet = engine.get_wallet(RIDER).await.unwrap();
        assert_eq!(wallet.total, cp(480));
        assert_eq!(wallet.spendable, cp(480));
        assert_eq!(wallet.held, Amount::ZERO);
    }

    #[tokio::test]
    async fn early_rider_cancel_is_free() {
        let (engine, clock) = fixture().await;
        let booked = engine.book_ride(RIDER, RIDE).await.unwrap();

        clock.set(start() - Duration::minutes(45));
        engine
            .cancel_booking(RIDER, booked.booking, CancelReason::Rider)
            .await
            .unwrap();

        let wallet = engine.get_wallet(RIDER).await.unwrap();
        assert_eq!(wallet.total, cp(500));
        assert_eq!(wallet.spendable, cp(500));
    }

    #[tokio::test]
    async fn rebooking_after_cancel_is_still_a_duplicate() {
        let (engine, _) = fixture().await;
        let booked = engine.book_ride(RIDER, RIDE).await.unwrap();
        engine
            .cancel_booking(RIDER, booked.booking, CancelReason::Rider)
            .await
            .unwrap();

        let again = engine.book_ride(RIDER, RIDE).await.unwrap_err();
        assert_eq!(again.kind(), ErrorKind::InvalidState);
        assert!(matches!(
            again,
            EngineError::Booking(BookingError::DuplicateBooking(RIDE, RIDER))
        ));
    }

    #[tokio::test]
    async fn driver_cannot_pick_up_before_start() {
        let (engine, clock) = fixture().await;
        let booked = engine.book_ride(RIDER, RIDE).await.unwrap();

        let early = engine
            .activate_booking(DRIVER, booked.booking, Actor::Driver)
            .await
            .unwrap_err();
        assert_eq!(early.kind(), ErrorKind::Timing);

        clock.set(start());
        let active = engine
            .activate_booking(DRIVER, booked.booking, Actor::Driver)
            .await
            .unwrap();
        assert_eq!(active.status, BookingStatus::Active);
    }

    #[tokio::test]
    async fn no_show_fines_the_rider_after_waiting() {
        let (engine, clock) = fixture().await;
        let booked = engine.book_ride(RIDER, RIDE).await.unwrap();

        clock.set(start() + Duration::minutes(5));
        let waiting = engine
            .cancel_booking(DRIVER, booked.booking, CancelReason::DriverNoShow)
            .await
            .unwrap_err();
        assert_eq!(waiting.kind(), ErrorKind::Timing);

        clock.advance(Duration::minutes(10));
        let cancelled = engine
            .cancel_booking(DRIVER, booked.booking, CancelReason::DriverNoShow)
            .await
            .unwrap();
        assert_eq!(cancelled.status, BookingStatus::CancelledDriver);
        let wallet = engine.get_wallet(RIDER).await.unwrap();
        assert_eq!(wallet.spendable, cp(480));
        assert_eq!(wallet.held, Amount::ZERO);
    }

    #[tokio::test]
    async fn cancelling_the_ride_releases_riders() {
        let (engine, _) = fixture().await;
        let booked = engine.book_ride(RIDER, RIDE).await.unwrap();

        let stranger = engine.cancel_ride(RIDER, RIDE).await.unwrap_err();
        assert_eq!(stranger.kind(), ErrorKind::NotAuthorized);

        let released = engine.cancel_ride(DRIVER, RIDE).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].booking, booked.booking);
        assert_eq!(engine.get_wallet(RIDER).await.unwrap().spendable, cp(500));

        let closed = engine.book_ride(RIDER, RIDE).await.unwrap_err();
        assert_eq!(closed.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn rides_must_start_in_the_future() {
        let (engine, _) = fixture().await;
        let past = engine
            .create_ride(NewRide {
                id: 11,
                driver: DRIVER,
                starting_time: start() - Duration::hours(2),
                max_passengers: 1,
                starting_location: 1,
                destination_location: 2,
                vehicle: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            past,
            EngineError::Booking(BookingError::InvalidRide(11, _))
        ));
    }

    #[tokio::test]
    async fn insufficient_balance_leaves_no_trace() {
        let (engine, _) = fixture().await;
        engine
            .register_user(User::new(3, "Meera", "meera@example.com"))
            .await
            .unwrap();
        engine.top_up(3, cp(60)).await.unwrap();

        let error = engine.book_ride(3, RIDE).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InsufficientBalance);
        assert!(engine.find_booking(RIDE, 3).await.unwrap().is_none());
        assert_eq!(engine.list_transactions(3, 1, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transaction_pages_are_validated() {
        let (engine, _) = fixture().await;
        for _ in 0..4 {
            engine.top_up(RIDER, cp(1)).await.unwrap();
        }

        let first = engine.list_transactions(RIDER, 1, 2).await.unwrap();
        let third = engine.list_transactions(RIDER, 3, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].amount, cp(500));

        for (page, limit) in [(0, 10), (1, 0), (1, MAX_PAGE_LIMIT + 1)] {
            let error = engine
                .list_transactions(RIDER, page, limit)
                .await
                .unwrap_err();
            assert_eq!(error.kind(), ErrorKind::Validation);
        }
        let missing = engine.list_transactions(99, 1, 10).await.unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn registering_twice_is_rejected() {
        let (engine, _) = fixture().await;
        let error = engine
            .register_user(User::new(RIDER, "Asha", "asha@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(error, EngineError::UserExists(RIDER)));
        assert_eq!(engine.get_wallet(RIDER).await.unwrap().total, cp(500));
    }

    #[tokio::test]
    async fn mart_recharge_and_refund() {
        let config = Config {
            rules: Rules {
                mart_conversion_rate: 0.5,
                ..Rules::default()
            },
            ..Config::default()
        };
        let (engine, _) = fixture_with(MemoryStore::new(), config).await;

        let order = engine
            .recharge_mart(RIDER, "mart-881", cp(200))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.amount, cp(100));
        assert_eq!(engine.get_wallet(RIDER).await.unwrap().total, cp(300));

        let too_much = engine
            .recharge_mart(RIDER, "mart-882", cp(301))
            .await
            .unwrap_err();
        assert_eq!(too_much.kind(), ErrorKind::InsufficientBalance);

        let foreign = engine.refund_order(DRIVER, order.id).await.unwrap_err();
        assert_eq!(foreign.kind(), ErrorKind::NotFound);

        let refunded = engine.refund_order(RIDER, order.id).await.unwrap();
        assert_eq!(refunded.status, OrderStatus::Refunded);
        assert_eq!(engine.get_wallet(RIDER).await.unwrap().total, cp(500));

        let twice = engine.refund_order(RIDER, order.id).await.unwrap_err();
        assert!(matches!(
            twice,
            EngineError::OrderNotRefundable(_, OrderStatus::Refunded)
        ));
    }

    #[tokio::test]
    async fn mart_recharge_rejects_a_reused_order_id() {
        let (engine, _) = fixture().await;

        engine.recharge_mart(RIDER, "ORD-1", cp(10)).await.unwrap();
        let again = engine
            .recharge_mart(RIDER, "ORD-1", cp(10))
            .await
            .unwrap_err();
        assert!(matches!(&again, EngineError::DuplicateOrder(id) if id == "ORD-1"));
        assert_eq!(again.kind(), ErrorKind::InvalidState);
        assert_eq!(engine.get_wallet(RIDER).await.unwrap().total, cp(490));
    }

    #[tokio::test]
    async fn top_up_past_the_wallet_limit_is_refused() {
        let (engine, _) = fixture().await;
        let huge = Amount::from_scaled(i64::MAX / 2);

        engine.top_up(RIDER, huge).await.unwrap();
        let before = engine.get_wallet(RIDER).await.unwrap();

        let error = engine.top_up(RIDER, huge).await.unwrap_err();
        assert!(matches!(
            error,
            EngineError::Ledger(LedgerError::Overflow(RIDER, _))
        ));
        assert_eq!(error.kind(), ErrorKind::Validation);
        assert_eq!(engine.get_wallet(RIDER).await.unwrap(), before);
    }

    #[tokio::test]
    async fn user_bookings_are_newest_first() {
        let (engine, clock) = fixture().await;
        engine
            .create_ride(NewRide {
                id: 11,
                driver: DRIVER,
                starting_time: start() + Duration::hours(3),
                max_passengers: 1,
                starting_location: 1,
                destination_location: 2,
                vehicle: None,
            })
            .await
            .unwrap();

        let first = engine.book_ride(RIDER, RIDE).await.unwrap();
        clock.advance(Duration::minutes(1));
        let second = engine.book_ride(RIDER, 11).await.unwrap();

        let history = engine.user_bookings(RIDER, 10).await.unwrap();
        let ids: Vec<_> = history.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![second.booking, first.booking]);
        assert_eq!(engine.user_bookings(RIDER, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conflicts_are_retried() {
        let (engine, _) = fixture_with(FlakyStore::new(0), Config::default()).await;
        engine.store().arm(2);

        let booked = engine.book_ride(RIDER, RIDE).await.unwrap();
        assert_eq!(booked.status, BookingStatus::Confirmed);
        assert_eq!(engine.get_wallet(RIDER).await.unwrap().held, cp(100));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_conflict() {
        let config = Config {
            retry: RetryPolicy {
                max_attempts: 2,
                backoff_ms: 1,
            },
            ..Config::default()
        };
        let (engine, _) = fixture_with(FlakyStore::new(0), config).await;
        engine.store().arm(2);

        let error = engine.book_ride(RIDER, RIDE).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ConcurrencyConflict);
        assert!(error.is_retryable());
        assert_eq!(engine.get_wallet(RIDER).await.unwrap().held, Amount::ZERO);
    }

    #[tokio::test]
    async fn driver_is_notified_after_commit() {
        let (notifier, mut rx) = ChannelNotifier::channel(8);
        let (engine, _) = fixture().await;
        let engine = engine.with_notifier(Arc::new(notifier));

        let booked = engine.book_ride(RIDER, RIDE).await.unwrap();
        engine
            .activate_booking(RIDER, booked.booking, Actor::Rider)
            .await
            .unwrap();

        let confirmed = rx.recv().await.unwrap();
        assert_eq!(confirmed.user, DRIVER);
        assert_eq!(confirmed.event, Event::BookingConfirmation);
        assert!(confirmed.body.starts_with("Asha"));
        let arrived = rx.recv().await.unwrap();
        assert_eq!(arrived.event, Event::RideActivated);
        assert_eq!(arrived.booking, booked.booking);
    }

    #[tokio::test]
    async fn failed_notification_keeps_the_booking() {
        let (engine, _) = fixture().await;
        let engine = engine.with_notifier(Arc::new(BrokenNotifier));

        let booked = engine.book_ride(RIDER, RIDE).await.unwrap();
        let cancelled = engine
            .cancel_booking(RIDER, booked.booking, CancelReason::Rider)
            .await
            .unwrap();
        assert_eq!(cancelled.status, BookingStatus::CancelledUser);
        assert_eq!(
            engine.get_booking(booked.booking).await.unwrap().status,
            BookingStatus::CancelledUser
        );
    }
}
