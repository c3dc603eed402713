use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::amount::AmountParseError;
use crate::engine::CancelReason;
use crate::model::{RideId, UserId, VehicleKind};
use crate::replay::{self, Command, Step, WalletRow};
use crate::Amount;

/// Errors that can occur when reading scenarios or writing wallets
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open scenario: {0}")]
    Open(csv::Error),

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized step type '{step_type}'")]
    UnrecognizedType { line: usize, step_type: String },

    #[error("line {line}: {step_type} missing {field}")]
    MissingField {
        line: usize,
        step_type: String,
        field: &'static str,
    },

    #[error("line {line}: {source}")]
    InvalidAmount {
        line: usize,
        source: AmountParseError,
    },

    #[error("line {line}: unknown vehicle kind '{kind}'")]
    InvalidVehicle { line: usize, kind: String },

    #[error("line {line}: {field} minute {value} is out of range")]
    MinuteOutOfRange {
        line: usize,
        field: &'static str,
        value: i64,
    },

    #[error("failed to write wallets: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush wallets: {0}")]
    Flush(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    at: i64,
    user: UserId,
    ride: Option<RideId>,
    rider: Option<UserId>,
    amount: Option<String>,
    start: Option<i64>,
    seats: Option<u32>,
    vehicle: Option<String>,
    km: Option<f64>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    user: UserId,
    total: String,
    spendable: String,
    held: String,
    ce_points: String,
}

/// Read scenario steps from a csv file.
///
/// Columns: `type,at,user,ride,rider,amount,start,seats,vehicle,km`. `at` and
/// `start` are minutes from the replay epoch; `user` is the acting user.
///
/// The returned iterator owns the open file and borrows nothing from `path`,
/// so it can be moved onto another task.
pub fn read_scenario(
    path: &Path,
) -> Result<impl Iterator<Item = Result<Step, CsvError>> + use<>, CsvError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(CsvError::Open)?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            parse_row(line, row)
        }))
}

fn parse_row(line: usize, row: InputRow) -> Result<Step, CsvError> {
    let missing = |field: &'static str| CsvError::MissingField {
        line,
        step_type: row.r#type.clone(),
        field,
    };
    let minute = |field: &'static str, value: i64| {
        if replay::is_valid_offset(value) {
            Ok(value)
        } else {
            Err(CsvError::MinuteOutOfRange { line, field, value })
        }
    };
    let at = minute("at", row.at)?;
    let ride = || row.ride.ok_or_else(|| missing("ride"));
    let rider = || row.rider.ok_or_else(|| missing("rider"));
    let cancel = |reason: CancelReason| -> Result<Command, CsvError> {
        let ride = ride()?;
        // the rider cancels their own booking; drivers name the rider
        let rider = match reason {
            CancelReason::Rider => row.user,
            _ => rider()?,
        };
        Ok(Command::Cancel {
            actor: row.user,
            ride,
            rider,
            reason,
        })
    };

    let command = match row.r#type.as_str() {
        "user" => Command::Register { user: row.user },
        "topup" => {
            let raw = row.amount.as_deref().ok_or_else(|| missing("amount"))?;
            let amount = raw
                .parse::<Amount>()
                .map_err(|source| CsvError::InvalidAmount { line, source })?;
            Command::TopUp {
                user: row.user,
                amount,
            }
        }
        "ride" => {
            let kind = row.vehicle.as_deref().ok_or_else(|| missing("vehicle"))?;
            let vehicle = match kind {
                "two" | "two_wheeler" => VehicleKind::TwoWheeler,
                "four" | "four_wheeler" => VehicleKind::FourWheeler,
                other => {
                    return Err(CsvError::InvalidVehicle {
                        line,
                        kind: other.to_string(),
                    });
                }
            };
            Command::OfferRide {
                driver: row.user,
                ride: ride()?,
                start: minute("start", row.start.ok_or_else(|| missing("start"))?)?,
                seats: row.seats.ok_or_else(|| missing("seats"))?,
                vehicle,
                km: row.km.ok_or_else(|| missing("km"))?,
            }
        }
        "start_ride" => Command::StartRide {
            driver: row.user,
            ride: ride()?,
        },
        "cancel_ride" => Command::CancelRide {
            driver: row.user,
            ride: ride()?,
        },
        "book" => Command::Book {
            rider: row.user,
            ride: ride()?,
        },
        "arrive" => Command::Arrive {
            rider: row.user,
            ride: ride()?,
        },
        "pickup" => Command::PickUp {
            driver: row.user,
            ride: ride()?,
            rider: rider()?,
        },
        "complete" => Command::Complete {
            driver: row.user,
            ride: ride()?,
            rider: rider()?,
        },
        "cancel_rider" => cancel(CancelReason::Rider)?,
        "cancel_driver" => cancel(CancelReason::DriverVoluntary)?,
        "no_show" => cancel(CancelReason::DriverNoShow)?,
        other => {
            return Err(CsvError::UnrecognizedType {
                line,
                step_type: other.to_string(),
            });
        }
    };

    Ok(Step { at, command })
}

/// Write wallets in csv format
pub fn write_wallets(
    out: impl io::Write,
    wallets: impl IntoIterator<Item = WalletRow>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(out);

    for wallet in wallets {
        let row = OutputRow {
            user: wallet.user,
            total: wallet.balance.total.to_string(),
            spendable: wallet.balance.spendable.to_string(),
            held: wallet.balance.held.to_string(),
            ce_points: wallet.ce_points.to_string(),
        };
        writer.serialize(&row)?;
    }

    writer.flush()?;
    Ok(())
}
