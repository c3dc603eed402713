//! Business rules and engine tuning.
//!
//! Built with [`Default`] or loaded from environment variables with the same
//! defaults, then handed to the engine at construction.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::Amount;
use crate::model::VehicleKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse '{value}'")]
    Invalid { var: &'static str, value: String },

    #[error("{var}: {reason}")]
    OutOfRange { var: &'static str, reason: &'static str },
}

/// Upper bound for the cancellation and waiting windows (one week).
pub const MAX_WINDOW_MINUTES: i64 = 7 * 24 * 60;

/// Everything the engine needs besides its collaborators.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub rules: Rules,
    pub retry: RetryPolicy,
}

/// Pricing and penalty rules consumed as plain numbers.
#[derive(Debug, Clone)]
pub struct Rules {
    /// Booking cost on a two-wheeler.
    pub cost_two_wheeler: Amount,
    /// Booking cost on a four-wheeler, and on rides without a vehicle.
    pub cost_four_wheeler: Amount,
    /// Cancelling with this many minutes or fewer left is late (*T*).
    pub cancel_threshold_minutes: i64,
    /// How long the driver waits past start before a no-show cancel (*W*).
    pub no_show_wait_minutes: i64,
    /// Late cancellation by the rider.
    pub rider_cancel_fine: Amount,
    /// Late cancellation by the driver (champion).
    pub champion_cancel_fine: Amount,
    /// Charged to a rider who never showed up.
    pub no_show_fine: Amount,
    pub ce_points_per_km: f64,
    /// Mart currency per carbon point.
    pub mart_conversion_rate: f64,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            cost_two_wheeler: Amount::from_whole(50),
            cost_four_wheeler: Amount::from_whole(100),
            cancel_threshold_minutes: 30,
            no_show_wait_minutes: 10,
            rider_cancel_fine: Amount::from_whole(20),
            champion_cancel_fine: Amount::from_whole(30),
            no_show_fine: Amount::from_whole(20),
            ce_points_per_km: 125.0,
            mart_conversion_rate: 1.0,
        }
    }
}

impl Rules {
    pub fn booking_cost(&self, kind: Option<VehicleKind>) -> Amount {
        match kind {
            Some(VehicleKind::TwoWheeler) => self.cost_two_wheeler,
            Some(VehicleKind::FourWheeler) | None => self.cost_four_wheeler,
        }
    }

    /// CE points for a ride of `distance_km`, rounded to 2 decimals.
    pub fn ce_points_for(&self, distance_km: f64) -> Amount {
        Amount::from_float(self.ce_points_per_km * distance_km).round_dp(2)
    }

    /// Mart currency obtained for `coins` carbon points.
    pub fn mart_amount_for(&self, coins: Amount) -> Amount {
        Amount::from_float(coins.to_float() * self.mart_conversion_rate)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let costs = [
            ("RIDE_COST_TWO_WHEELER", self.cost_two_wheeler),
            ("RIDE_COST_FOUR_WHEELER", self.cost_four_wheeler),
        ];
        for (var, cost) in costs {
            if !cost.is_positive() {
                return Err(ConfigError::OutOfRange {
                    var,
                    reason: "must be positive",
                });
            }
        }
        let amounts = [
            ("RIDE_CANCEL_FINE_RIDER", self.rider_cancel_fine),
            ("RIDE_CANCEL_FINE_CHAMPION", self.champion_cancel_fine),
            ("RIDE_NO_SHOW_FINE", self.no_show_fine),
        ];
        for (var, amount) in amounts {
            if amount.is_negative() {
                return Err(ConfigError::OutOfRange {
                    var,
                    reason: "must not be negative",
                });
            }
        }
        let windows = [
            ("RIDE_THRESHOLD_MINUTES", self.cancel_threshold_minutes),
            ("RIDE_WAITING_MINUTES", self.no_show_wait_minutes),
        ];
        for (var, minutes) in windows {
            if !(0..=MAX_WINDOW_MINUTES).contains(&minutes) {
                return Err(ConfigError::OutOfRange {
                    var,
                    reason: "must be between 0 and 10080 minutes",
                });
            }
        }
        if !(self.ce_points_per_km.is_finite() && self.ce_points_per_km >= 0.0) {
            return Err(ConfigError::OutOfRange {
                var: "RIDE_CE_POINTS_PER_KM",
                reason: "must be a finite non-negative number",
            });
        }
        if !(self.mart_conversion_rate.is_finite() && self.mart_conversion_rate > 0.0) {
            return Err(ConfigError::OutOfRange {
                var: "MART_CONVERSION_RATE",
                reason: "must be positive",
            });
        }
        Ok(())
    }
}

/// Bounded retries for units of work that lost a write race.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 5,
        }
    }
}

impl RetryPolicy {
    /// Linear backoff before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

impl Config {
    /// Load from `RIDE_*`, `MART_*` and `STORE_*` variables. Missing variables
    /// fall back to defaults; malformed ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Rules::default();
        let rules = Rules {
            cost_two_wheeler: var_or("RIDE_COST_TWO_WHEELER", defaults.cost_two_wheeler)?,
            cost_four_wheeler: var_or("RIDE_COST_FOUR_WHEELER", defaults.cost_four_wheeler)?,
            cancel_threshold_minutes: var_or(
                "RIDE_THRESHOLD_MINUTES",
                defaults.cancel_threshold_minutes,
            )?,
            no_show_wait_minutes: var_or("RIDE_WAITING_MINUTES", defaults.no_show_wait_minutes)?,
            rider_cancel_fine: var_or("RIDE_CANCEL_FINE_RIDER", defaults.rider_cancel_fine)?,
            champion_cancel_fine: var_or(
                "RIDE_CANCEL_FINE_CHAMPION",
                defaults.champion_cancel_fine,
            )?,
            no_show_fine: var_or("RIDE_NO_SHOW_FINE", defaults.no_show_fine)?,
            ce_points_per_km: var_or("RIDE_CE_POINTS_PER_KM", defaults.ce_points_per_km)?,
            mart_conversion_rate: var_or("MART_CONVERSION_RATE", defaults.mart_conversion_rate)?,
        };
        rules.validate()?;

        let default_retry = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: var_or("STORE_MAX_ATTEMPTS", default_retry.max_attempts)?,
            backoff_ms: var_or("STORE_RETRY_BACKOFF_MS", default_retry.backoff_ms)?,
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                var: "STORE_MAX_ATTEMPTS",
                reason: "must be at least 1",
            });
        }

        Ok(Self { rules, retry })
    }
}

fn var_or<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => {
            let parsed = value.trim().parse();
            parsed.map_err(|_| ConfigError::Invalid { var, value })
        }
        Err(_) => Ok(default),
    }
}
