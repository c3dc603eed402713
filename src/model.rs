//! Core domain types for the ride wallet engine.

use chrono::{DateTime, Utc};

use crate::Amount;

/// User identifier (issued by the identity layer).
pub type UserId = u64;

/// Ride identifier (issued by the driver flow).
pub type RideId = u64;

/// Ride booking identifier (issued by the store).
pub type BookingId = u64;

/// Wallet ledger entry identifier.
pub type WalletTxId = u64;

/// External (mart) order identifier.
pub type OrderId = u64;

pub type LocationId = u64;

pub type VehicleId = u64;

/// A registered user. The wallet lives alongside it and is owned by the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub profile_completed: bool,
    /// Cumulative CE points earned over all completed bookings.
    pub ce_points: Amount,
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            email: email.into(),
            profile_completed: true,
            ce_points: Amount::ZERO,
        }
    }
}

/// Which way a ledger entry moved money relative to the wallet total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Credit,
    Debit,
    /// Funds moved between pools, total unchanged.
    Neutral,
}

/// Business reason attached to every ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    TopUp,
    BookingReserve,
    BookingRelease,
    BookingSettle,
    Payout,
    Refund,
    FineCharge,
    Promotion,
    Adjustment,
    OrderPurchase,
    OrderRefund,
}

impl Purpose {
    /// Label shown in wallet history.
    pub fn label(self) -> &'static str {
        match self {
            Purpose::TopUp => "Top Up",
            Purpose::BookingReserve => "Ride Booking Reserved",
            Purpose::BookingRelease => "Ride Booking Released",
            Purpose::BookingSettle => "Ride Booking Settled",
            Purpose::Payout => "Champion Payout",
            Purpose::Refund => "Refund",
            Purpose::FineCharge => "Fine Charged",
            Purpose::Promotion => "Promotion Bonus",
            Purpose::Adjustment => "Balance Adjustment",
            Purpose::OrderPurchase => "Mart Recharge",
            Purpose::OrderRefund => "Mart Recharge Refund",
        }
    }
}

/// Immutable, append-only wallet ledger entry.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletTransaction {
    pub id: WalletTxId,
    pub user: UserId,
    pub direction: Direction,
    pub purpose: Purpose,
    /// Always strictly positive; `direction` carries the sign.
    pub amount: Amount,
    pub ride: Option<RideId>,
    pub booking: Option<BookingId>,
    pub external_order: Option<OrderId>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A ledger entry before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWalletTransaction {
    pub user: UserId,
    pub direction: Direction,
    pub purpose: Purpose,
    pub amount: Amount,
    pub ride: Option<RideId>,
    pub booking: Option<BookingId>,
    pub external_order: Option<OrderId>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RideStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ride {
    pub id: RideId,
    pub driver: UserId,
    pub status: RideStatus,
    pub starting_time: DateTime<Utc>,
    pub max_passengers: u32,
    pub starting_location: LocationId,
    pub destination_location: LocationId,
    pub vehicle: Option<VehicleId>,
}

/// Lifecycle of a booking.
///
/// `Confirmed -> {Active, CancelledUser, CancelledDriver}`,
/// `Active -> {Completed, CancelledDriver}`. `Denied` is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingStatus {
    Confirmed,
    Active,
    Completed,
    CancelledUser,
    CancelledDriver,
    Denied,
}

impl BookingStatus {
    /// Confirmed and Active bookings occupy a seat and hold the rider's funds.
    pub fn occupies_seat(self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::Active)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed
                | BookingStatus::CancelledUser
                | BookingStatus::CancelledDriver
                | BookingStatus::Denied
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RideBooking {
    pub id: BookingId,
    pub ride: RideId,
    pub user: UserId,
    pub status: BookingStatus,
    /// Fixed at creation.
    pub carbon_cost: Amount,
    /// Set at completion.
    pub ce_points_earned: Amount,
    pub created_at: DateTime<Utc>,
}

/// A booking before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRideBooking {
    pub ride: RideId,
    pub user: UserId,
    pub status: BookingStatus,
    pub carbon_cost: Amount,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleKind {
    TwoWheeler,
    FourWheeler,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vehicle {
    pub id: VehicleId,
    pub owner: UserId,
    pub kind: VehicleKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub id: LocationId,
    pub name: String,
    pub is_organization: bool,
    /// Kilometres from the organization.
    pub distance_from_org: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

/// A mart recharge: carbon points converted into mart currency.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalOrder {
    pub id: OrderId,
    pub user: UserId,
    pub ext_order_id: String,
    /// Mart currency credited on the external side.
    pub amount: Amount,
    /// Carbon points taken from the wallet.
    pub coin_amount: Amount,
    pub conversion_rate: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewExternalOrder {
    pub user: UserId,
    pub ext_order_id: String,
    pub amount: Amount,
    pub coin_amount: Amount,
    pub conversion_rate: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}
