pub mod amount;
pub mod booking;
pub mod clock;
pub mod config;
pub mod csv;
pub mod engine;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod replay;
pub mod store;
pub mod time;

pub use amount::Amount;
pub use config::{Config, RetryPolicy, Rules};
pub use engine::{Actor, CancelReason, Engine, EngineError, ErrorKind};
pub use model::{BookingId, RideId, UserId};
