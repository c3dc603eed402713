//! Driver side of a ride: publish, start, call off.

use chrono::{DateTime, Utc};

use super::{BookingError, BookingOperation, BookingOutcome, release_for_ride_cancel};
use crate::model::{LocationId, Ride, RideId, RideStatus, UserId, VehicleId};
use crate::store::{StorageError, UnitOfWork};

/// A ride as offered by its driver.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRide {
    pub id: RideId,
    pub driver: UserId,
    pub starting_time: DateTime<Utc>,
    pub max_passengers: u32,
    pub starting_location: LocationId,
    pub destination_location: LocationId,
    pub vehicle: Option<VehicleId>,
}

pub fn create_ride(tx: &mut dyn UnitOfWork, new: NewRide) -> Result<Ride, BookingError> {
    if tx.user(new.driver)?.is_none() {
        return Err(BookingError::UserNotFound(new.driver));
    }
    if new.max_passengers == 0 {
        return Err(BookingError::InvalidRide(new.id, "at least one seat is required"));
    }

    let start = tx.location(new.starting_location)?;
    let destination = tx.location(new.destination_location)?;
    let (Some(start), Some(destination)) = (start, destination) else {
        return Err(BookingError::InvalidLocations(new.id));
    };
    if start.id == destination.id {
        return Err(BookingError::InvalidRide(new.id, "start and destination are the same"));
    }
    if start.is_organization == destination.is_organization {
        return Err(BookingError::InvalidRide(
            new.id,
            "exactly one endpoint must be the organization",
        ));
    }

    if let Some(vehicle_id) = new.vehicle {
        match tx.vehicle(vehicle_id)? {
            Some(vehicle) if vehicle.owner == new.driver => {}
            Some(_) => {
                return Err(BookingError::InvalidRide(
                    new.id,
                    "vehicle belongs to another user",
                ));
            }
            None => return Err(BookingError::InvalidRide(new.id, "vehicle not found")),
        }
    }

    let ride = Ride {
        id: new.id,
        driver: new.driver,
        status: RideStatus::Pending,
        starting_time: new.starting_time,
        max_passengers: new.max_passengers,
        starting_location: new.starting_location,
        destination_location: new.destination_location,
        vehicle: new.vehicle,
    };
    tx.insert_ride(ride.clone()).map_err(|e| match e {
        StorageError::UniqueViolation(_) => BookingError::RideExists(new.id),
        other => other.into(),
    })?;
    Ok(ride)
}

/// `Pending -> Active`. Bookings close once the ride is under way.
pub fn start_ride(
    tx: &mut dyn UnitOfWork,
    driver: UserId,
    ride_id: RideId,
) -> Result<Ride, BookingError> {
    let mut ride = load_driven(tx, BookingOperation::StartRide, driver, ride_id)?;
    if ride.status != RideStatus::Pending {
        return Err(BookingError::InvalidRideState(
            BookingOperation::StartRide,
            ride_id,
            ride.status,
        ));
    }
    ride.status = RideStatus::Active;
    tx.update_ride(ride.clone())?;
    Ok(ride)
}

/// Call off a pending or running ride, releasing every seat still held on it.
/// The releases and the ride's status change commit together.
pub fn cancel_ride(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    driver: UserId,
    ride_id: RideId,
) -> Result<Vec<BookingOutcome>, BookingError> {
    let mut ride = load_driven(tx, BookingOperation::CancelRide, driver, ride_id)?;
    if !matches!(ride.status, RideStatus::Pending | RideStatus::Active) {
        return Err(BookingError::InvalidRideState(
            BookingOperation::CancelRide,
            ride_id,
            ride.status,
        ));
    }

    let mut released = Vec::new();
    for booking in tx.bookings_for_ride(ride_id)? {
        if !booking.status.occupies_seat() {
            continue;
        }
        released.push(release_for_ride_cancel(
            tx,
            now,
            BookingOperation::CancelRide,
            booking,
            &ride,
        )?);
    }

    ride.status = RideStatus::Cancelled;
    tx.update_ride(ride)?;
    Ok(released)
}

fn load_driven(
    tx: &mut dyn UnitOfWork,
    op: BookingOperation,
    driver: UserId,
    ride_id: RideId,
) -> Result<Ride, BookingError> {
    let ride = tx
        .ride(ride_id)?
        .ok_or(BookingError::RideNotFound(ride_id))?;
    if ride.driver != driver {
        return Err(BookingError::NotRideDriver(op, ride_id, driver));
    }
    Ok(ride)
}
