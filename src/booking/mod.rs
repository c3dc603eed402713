//! Ride booking state machine.
//!
//! `Confirmed -> {Active, CancelledUser, CancelledDriver}`,
//! `Active -> {Completed, CancelledDriver}`.
//!
//! Every transition takes the open unit of work and the instant captured for
//! it, re-reads the booking and ride through the unit, validates, then writes
//! the new status together with its ledger calls. A failed check returns
//! before anything is written, and any later failure aborts the whole unit.

use chrono::{DateTime, Utc};

use crate::config::Rules;
use crate::ledger::{self, BookingRef};
use crate::model::{
    BookingId, BookingStatus, NewRideBooking, Ride, RideBooking, RideId, RideStatus, UserId,
};
use crate::store::{StorageError, UnitOfWork};
use crate::{Amount, time};

mod error;
pub use error::{BookingError, BookingOperation};

mod outcome;
pub use outcome::{BookingOutcome, Completion, Fine, LedgerEffect};

mod ride;
pub use ride::{NewRide, cancel_ride, create_ride, start_ride};

/// Book a seat for `user` on `ride`, holding the booking cost.
///
/// The seat count, duplicate and active-ride checks all read through the unit,
/// so a concurrent booking on the same ride makes one of the two units fail to
/// commit instead of overselling.
pub fn book(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    rules: &Rules,
    user: UserId,
    ride_id: RideId,
) -> Result<BookingOutcome, BookingError> {
    let rider = tx.user(user)?.ok_or(BookingError::ProfileIncomplete(user))?;
    if !rider.profile_completed {
        return Err(BookingError::ProfileIncomplete(user));
    }

    let ride = tx
        .ride(ride_id)?
        .ok_or(BookingError::RideNotFound(ride_id))?;
    if ride.status != RideStatus::Pending || ride.starting_time <= now {
        return Err(BookingError::RideUnavailable(ride_id));
    }

    let bookings = tx.bookings_for_ride(ride_id)?;
    if bookings.iter().any(|b| b.user == user) {
        return Err(BookingError::DuplicateBooking(ride_id, user));
    }
    let occupied = bookings.iter().filter(|b| b.status.occupies_seat()).count();
    if occupied >= ride.max_passengers as usize {
        return Err(BookingError::CapacityExceeded(
            ride_id,
            ride.max_passengers,
        ));
    }

    for booking in tx.bookings_for_user(user)? {
        if !booking.status.occupies_seat() {
            continue;
        }
        if let Some(other) = tx.ride(booking.ride)? {
            if other.status == RideStatus::Active {
                return Err(BookingError::ConcurrentActiveRide(user));
            }
        }
    }

    let vehicle_kind = match ride.vehicle {
        Some(vehicle) => tx.vehicle(vehicle)?.map(|v| v.kind),
        None => None,
    };
    let cost = rules.booking_cost(vehicle_kind);
    if !ledger::has_sufficient_spendable_balance(tx, user, cost)? {
        let spendable = ledger::balance(tx, user)?.spendable;
        return Err(ledger::LedgerError::InsufficientBalance(user, spendable, cost).into());
    }

    let booking = tx
        .insert_booking(NewRideBooking {
            ride: ride_id,
            user,
            status: BookingStatus::Confirmed,
            carbon_cost: cost,
            created_at: now,
        })
        .map_err(|e| match e {
            StorageError::UniqueViolation(_) => BookingError::DuplicateBooking(ride_id, user),
            other => other.into(),
        })?;

    let target = BookingRef {
        ride: ride_id,
        booking: booking.id,
    };
    ledger::hold(tx, now, user, target, cost)?;

    Ok(outcome(
        &booking,
        &ride,
        LedgerEffect::Hold { user, amount: cost },
    ))
}

/// The rider reports they reached the pickup point.
pub fn activate_by_rider(
    tx: &mut dyn UnitOfWork,
    rider: UserId,
    booking_id: BookingId,
) -> Result<BookingOutcome, BookingError> {
    use BookingOperation::ActivateByRider as Op;

    let (mut booking, ride) = load(tx, Op, booking_id)?;
    ensure_rider(Op, &booking, rider)?;
    ensure_status(Op, &booking, &[BookingStatus::Confirmed])?;

    booking.status = BookingStatus::Active;
    tx.update_booking(booking.clone())?;

    Ok(outcome(&booking, &ride, LedgerEffect::None))
}

/// The driver picks the rider up, no earlier than the ride's starting time.
pub fn activate_by_driver(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    driver: UserId,
    booking_id: BookingId,
) -> Result<BookingOutcome, BookingError> {
    use BookingOperation::ActivateByDriver as Op;

    let (mut booking, ride) = load(tx, Op, booking_id)?;
    ensure_driver(Op, &booking, &ride, driver)?;
    ensure_status(Op, &booking, &[BookingStatus::Confirmed])?;
    if now < ride.starting_time {
        return Err(BookingError::TooEarly(Op, ride.id));
    }

    booking.status = BookingStatus::Active;
    tx.update_booking(booking.clone())?;

    Ok(outcome(&booking, &ride, LedgerEffect::None))
}

/// Drop the rider off: settle their hold, pay the driver, award CE points.
pub fn complete(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    rules: &Rules,
    driver: UserId,
    booking_id: BookingId,
) -> Result<Completion, BookingError> {
    use BookingOperation::Complete as Op;

    let (mut booking, ride) = load(tx, Op, booking_id)?;
    ensure_driver(Op, &booking, &ride, driver)?;
    ensure_status(Op, &booking, &[BookingStatus::Active])?;

    let start = tx.location(ride.starting_location)?;
    let destination = tx.location(ride.destination_location)?;
    let (Some(start), Some(destination)) = (start, destination) else {
        return Err(BookingError::InvalidLocations(ride.id));
    };
    // one endpoint is always the organization; the other carries the distance
    let distance = if start.is_organization {
        destination.distance_from_org
    } else {
        start.distance_from_org
    };
    let reward = rules.ce_points_for(distance);

    let target = target_of(&booking);
    ledger::settle(tx, now, booking.user, target, booking.carbon_cost)?;
    ledger::credit_payout(tx, now, driver, target, booking.carbon_cost)?;

    booking.status = BookingStatus::Completed;
    booking.ce_points_earned = reward;
    tx.update_booking(booking.clone())?;

    let mut rider = tx
        .user(booking.user)?
        .ok_or(BookingError::UserNotFound(booking.user))?;
    rider.ce_points = rider
        .ce_points
        .checked_add(reward)
        .ok_or(ledger::LedgerError::Overflow(booking.user, reward))?;
    tx.update_user(rider)?;

    let effect = LedgerEffect::Settle {
        rider: booking.user,
        driver,
        amount: booking.carbon_cost,
    };
    Ok(Completion {
        outcome: outcome(&booking, &ride, effect),
        ce_points_earned: reward,
    })
}

/// The rider backs out. Releases the hold; late cancellations are fined.
pub fn cancel_by_rider(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    rules: &Rules,
    rider: UserId,
    booking_id: BookingId,
) -> Result<BookingOutcome, BookingError> {
    use BookingOperation::CancelByRider as Op;

    let (mut booking, ride) = load(tx, Op, booking_id)?;
    ensure_rider(Op, &booking, rider)?;
    ensure_status(Op, &booking, &[BookingStatus::Confirmed])?;

    let target = target_of(&booking);
    ledger::unhold(tx, now, rider, target, booking.carbon_cost)?;
    let fine = if is_late_cancellation(&ride, now, rules) {
        charge_fine(tx, now, rider, target, rules.rider_cancel_fine)?
    } else {
        None
    };

    booking.status = BookingStatus::CancelledUser;
    tx.update_booking(booking.clone())?;

    let effect = LedgerEffect::Release {
        user: rider,
        amount: booking.carbon_cost,
        fine,
    };
    Ok(outcome(&booking, &ride, effect))
}

/// The driver drops a rider on purpose. The rider's hold is released and a
/// late cancellation fines the driver.
pub fn cancel_by_driver(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    rules: &Rules,
    driver: UserId,
    booking_id: BookingId,
) -> Result<BookingOutcome, BookingError> {
    use BookingOperation::CancelByDriver as Op;

    let (mut booking, ride) = load(tx, Op, booking_id)?;
    ensure_driver(Op, &booking, &ride, driver)?;
    ensure_status(
        Op,
        &booking,
        &[BookingStatus::Confirmed, BookingStatus::Active],
    )?;

    let target = target_of(&booking);
    ledger::unhold(tx, now, booking.user, target, booking.carbon_cost)?;
    let fine = if is_late_cancellation(&ride, now, rules) {
        charge_fine(tx, now, driver, target, rules.champion_cancel_fine)?
    } else {
        None
    };

    booking.status = BookingStatus::CancelledDriver;
    tx.update_booking(booking.clone())?;

    let effect = LedgerEffect::Release {
        user: booking.user,
        amount: booking.carbon_cost,
        fine,
    };
    Ok(outcome(&booking, &ride, effect))
}

/// The rider never showed up. Allowed once the waiting window after the
/// starting time has elapsed; the rider is fined.
pub fn cancel_no_show(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    rules: &Rules,
    driver: UserId,
    booking_id: BookingId,
) -> Result<BookingOutcome, BookingError> {
    use BookingOperation::CancelNoShow as Op;

    let (mut booking, ride) = load(tx, Op, booking_id)?;
    ensure_driver(Op, &booking, &ride, driver)?;
    ensure_status(Op, &booking, &[BookingStatus::Confirmed])?;
    if now < ride.starting_time {
        return Err(BookingError::TooEarly(Op, ride.id));
    }
    if !time::has_passed_minutes(ride.starting_time, now, rules.no_show_wait_minutes) {
        return Err(BookingError::InsufficientWaitElapsed(Op, ride.id));
    }

    let target = target_of(&booking);
    ledger::unhold(tx, now, booking.user, target, booking.carbon_cost)?;
    let fine = charge_fine(tx, now, booking.user, target, rules.no_show_fine)?;

    booking.status = BookingStatus::CancelledDriver;
    tx.update_booking(booking.clone())?;

    let effect = LedgerEffect::Release {
        user: booking.user,
        amount: booking.carbon_cost,
        fine,
    };
    Ok(outcome(&booking, &ride, effect))
}

/// Release a booking because its driver called off the whole ride. No fine.
pub fn cancel_on_ride_cancel(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    driver: UserId,
    booking_id: BookingId,
) -> Result<BookingOutcome, BookingError> {
    use BookingOperation::CancelOnRideCancel as Op;

    let (booking, ride) = load(tx, Op, booking_id)?;
    ensure_driver(Op, &booking, &ride, driver)?;
    release_for_ride_cancel(tx, now, Op, booking, &ride)
}

fn release_for_ride_cancel(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    op: BookingOperation,
    mut booking: RideBooking,
    ride: &Ride,
) -> Result<BookingOutcome, BookingError> {
    ensure_status(
        op,
        &booking,
        &[BookingStatus::Confirmed, BookingStatus::Active],
    )?;

    ledger::unhold(
        tx,
        now,
        booking.user,
        target_of(&booking),
        booking.carbon_cost,
    )?;

    booking.status = BookingStatus::CancelledDriver;
    tx.update_booking(booking.clone())?;

    let effect = LedgerEffect::Release {
        user: booking.user,
        amount: booking.carbon_cost,
        fine: None,
    };
    Ok(outcome(&booking, ride, effect))
}

fn load(
    tx: &mut dyn UnitOfWork,
    op: BookingOperation,
    booking_id: BookingId,
) -> Result<(RideBooking, Ride), BookingError> {
    let booking = tx
        .booking(booking_id)?
        .ok_or(BookingError::NotFound(op, booking_id))?;
    let ride = tx
        .ride(booking.ride)?
        .ok_or(BookingError::RideNotFound(booking.ride))?;
    Ok((booking, ride))
}

fn ensure_rider(
    op: BookingOperation,
    booking: &RideBooking,
    rider: UserId,
) -> Result<(), BookingError> {
    if booking.user != rider {
        return Err(BookingError::NotAuthorized(op, booking.id, rider));
    }
    Ok(())
}

fn ensure_driver(
    op: BookingOperation,
    booking: &RideBooking,
    ride: &Ride,
    driver: UserId,
) -> Result<(), BookingError> {
    if ride.driver != driver {
        return Err(BookingError::NotAuthorized(op, booking.id, driver));
    }
    Ok(())
}

fn ensure_status(
    op: BookingOperation,
    booking: &RideBooking,
    allowed: &[BookingStatus],
) -> Result<(), BookingError> {
    if !allowed.contains(&booking.status) {
        return Err(BookingError::InvalidState(op, booking.id, booking.status));
    }
    Ok(())
}

/// Cancelling with `T` minutes or fewer left before the start is late.
fn is_late_cancellation(ride: &Ride, now: DateTime<Utc>, rules: &Rules) -> bool {
    !time::is_more_than_minutes_left(ride.starting_time, now, rules.cancel_threshold_minutes)
}

/// A configured fine of zero means no fine.
fn charge_fine(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    user: UserId,
    target: BookingRef,
    amount: Amount,
) -> Result<Option<Fine>, BookingError> {
    if !amount.is_positive() {
        return Ok(None);
    }
    ledger::apply_fine_charge(tx, now, user, target, amount)?;
    Ok(Some(Fine { user, amount }))
}

fn target_of(booking: &RideBooking) -> BookingRef {
    BookingRef {
        ride: booking.ride,
        booking: booking.id,
    }
}

fn outcome(booking: &RideBooking, ride: &Ride, ledger: LedgerEffect) -> BookingOutcome {
    BookingOutcome {
        booking: booking.id,
        ride: ride.id,
        rider: booking.user,
        driver: ride.driver,
        status: booking.status,
        ledger,
    }
}
