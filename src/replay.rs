//! Scenario replay on a simulated clock.
//!
//! A scenario is an ordered list of [`Step`]s. Each step moves the clock to its
//! minute offset and runs one engine operation. Failed steps are logged and
//! skipped; they never stop the replay.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

use crate::Amount;
use crate::booking::NewRide;
use crate::clock::ManualClock;
use crate::config::Config;
use crate::engine::{Actor, CancelReason, Engine, EngineError};
use crate::ledger::WalletBalance;
use crate::model::{BookingId, Location, LocationId, RideId, User, UserId, Vehicle, VehicleKind};
use crate::store::MemoryStore;

/// Destination of every replayed ride.
pub const ORGANIZATION: LocationId = 0;

/// Scenario minutes must lie within this many minutes of the epoch (about
/// a thousand years either way).
pub const MAX_OFFSET_MINUTES: i64 = 1_000 * 366 * 24 * 60;

/// `true` when `offset` can be used as a scenario minute.
pub fn is_valid_offset(offset: i64) -> bool {
    (-MAX_OFFSET_MINUTES..=MAX_OFFSET_MINUTES).contains(&offset)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Register {
        user: UserId,
    },
    TopUp {
        user: UserId,
        amount: Amount,
    },
    /// Publish a ride from a pickup point `km` away to the organization.
    OfferRide {
        driver: UserId,
        ride: RideId,
        start: i64,
        seats: u32,
        vehicle: VehicleKind,
        km: f64,
    },
    StartRide {
        driver: UserId,
        ride: RideId,
    },
    CancelRide {
        driver: UserId,
        ride: RideId,
    },
    Book {
        rider: UserId,
        ride: RideId,
    },
    Arrive {
        rider: UserId,
        ride: RideId,
    },
    PickUp {
        driver: UserId,
        ride: RideId,
        rider: UserId,
    },
    Complete {
        driver: UserId,
        ride: RideId,
        rider: UserId,
    },
    Cancel {
        actor: UserId,
        ride: RideId,
        rider: UserId,
        reason: CancelReason,
    },
}

/// A command and the minute it happens at.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub at: i64,
    pub command: Command,
}

/// One wallet line of the replay summary.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletRow {
    pub user: UserId,
    pub balance: WalletBalance,
    pub ce_points: Amount,
}

pub struct Replay {
    engine: Engine,
    clock: Arc<ManualClock>,
    epoch: DateTime<Utc>,
}

impl Replay {
    pub async fn new(config: Config) -> Result<Self, EngineError> {
        let epoch = DateTime::UNIX_EPOCH;
        let clock = Arc::new(ManualClock::new(epoch));
        let engine = Engine::new(MemoryStore::new(), config).with_clock(clock.clone());
        engine
            .add_location(Location {
                id: ORGANIZATION,
                name: "Organization".to_string(),
                is_organization: true,
                distance_from_org: 0.0,
            })
            .await?;
        Ok(Self {
            engine,
            clock,
            epoch,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Apply every step of `stream` in order.
    pub async fn run(&self, mut stream: impl Stream<Item = Step> + Unpin) {
        while let Some(step) = stream.next().await {
            let at = step.at;
            if let Err(e) = self.apply(step).await {
                warn!(at, reason = %e, "step skipped");
            }
        }
    }

    pub async fn apply(&self, step: Step) -> Result<(), EngineError> {
        self.clock.set(self.minute(step.at)?);
        let engine = &self.engine;
        match step.command {
            Command::Register { user } => {
                let name = format!("user-{user}");
                let email = format!("user-{user}@example.com");
                engine.register_user(User::new(user, name, email)).await?;
            }
            Command::TopUp { user, amount } => {
                engine.top_up(user, amount).await?;
            }
            Command::OfferRide {
                driver,
                ride,
                start,
                seats,
                vehicle,
                km,
            } => {
                let starting_time = self.minute(start)?;
                // each ride brings its own pickup point and vehicle, keyed by ride id
                engine
                    .add_location(Location {
                        id: ride,
                        name: format!("pickup-{ride}"),
                        is_organization: false,
                        distance_from_org: km,
                    })
                    .await?;
                engine
                    .add_vehicle(Vehicle {
                        id: ride,
                        owner: driver,
                        kind: vehicle,
                    })
                    .await?;
                engine
                    .create_ride(NewRide {
                        id: ride,
                        driver,
                        starting_time,
                        max_passengers: seats,
                        starting_location: ride,
                        destination_location: ORGANIZATION,
                        vehicle: Some(ride),
                    })
                    .await?;
            }
            Command::StartRide { driver, ride } => {
                engine.start_ride(driver, ride).await?;
            }
            Command::CancelRide { driver, ride } => {
                engine.cancel_ride(driver, ride).await?;
            }
            Command::Book { rider, ride } => {
                engine.book_ride(rider, ride).await?;
            }
            Command::Arrive { rider, ride } => {
                let booking = self.booking_of(ride, rider).await?;
                engine.activate_booking(rider, booking, Actor::Rider).await?;
            }
            Command::PickUp {
                driver,
                ride,
                rider,
            } => {
                let booking = self.booking_of(ride, rider).await?;
                engine
                    .activate_booking(driver, booking, Actor::Driver)
                    .await?;
            }
            Command::Complete {
                driver,
                ride,
                rider,
            } => {
                let booking = self.booking_of(ride, rider).await?;
                engine.complete_booking(driver, booking).await?;
            }
            Command::Cancel {
                actor,
                ride,
                rider,
                reason,
            } => {
                let booking = self.booking_of(ride, rider).await?;
                engine.cancel_booking(actor, booking, reason).await?;
            }
        }
        Ok(())
    }

    /// Every wallet with its owner's CE points, ordered by user id.
    pub async fn wallets(&self) -> Result<Vec<WalletRow>, EngineError> {
        let mut rows = Vec::new();
        for user in self.engine.store().users()? {
            let balance = self.engine.get_wallet(user.id).await?;
            rows.push(WalletRow {
                user: user.id,
                balance,
                ce_points: user.ce_points,
            });
        }
        rows.sort_by_key(|row| row.user);
        Ok(rows)
    }

    fn minute(&self, offset: i64) -> Result<DateTime<Utc>, EngineError> {
        Some(offset)
            .filter(|offset| is_valid_offset(*offset))
            .and_then(TimeDelta::try_minutes)
            .and_then(|delta| self.epoch.checked_add_signed(delta))
            .ok_or_else(|| EngineError::Validation(format!("minute {offset} is out of range")))
    }

    async fn booking_of(&self, ride: RideId, rider: UserId) -> Result<BookingId, EngineError> {
        self.engine
            .find_booking(ride, rider)
            .await?
            .map(|booking| booking.id)
            .ok_or(EngineError::NoBookingOnRide(ride, rider))
    }
}
