//! Wallet ledger primitives.
//!
//! Each primitive runs inside the caller's unit of work: it reads the wallet
//! through the unit (registering the row version), checks the relevant pool,
//! writes the new wallet and appends exactly one ledger entry. A refused
//! primitive writes nothing; the caller's unit decides whether anything else
//! it did survives.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::Amount;
use crate::model::{
    BookingId, Direction, NewWalletTransaction, OrderId, Purpose, RideId, UserId,
    WalletTransaction,
};
use crate::store::UnitOfWork;

mod wallet;
pub use wallet::{Wallet, WalletBalance};

mod error;
pub use error::LedgerError;

/// The ride and booking a ledger entry is posted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRef {
    pub ride: RideId,
    pub booking: BookingId,
}

/// What gets written next to the amount.
struct Posting {
    direction: Direction,
    purpose: Purpose,
    ride: Option<RideId>,
    booking: Option<BookingId>,
    external_order: Option<OrderId>,
}

impl Posting {
    fn booking(direction: Direction, purpose: Purpose, target: BookingRef) -> Self {
        Self {
            direction,
            purpose,
            ride: Some(target.ride),
            booking: Some(target.booking),
            external_order: None,
        }
    }

    fn order(direction: Direction, purpose: Purpose, order: OrderId) -> Self {
        Self {
            direction,
            purpose,
            ride: None,
            booking: None,
            external_order: Some(order),
        }
    }
}

/// Create the empty wallet that accompanies a new user.
pub fn open_wallet(tx: &mut dyn UnitOfWork, user: UserId) -> Result<(), LedgerError> {
    tx.insert_wallet(Wallet::new(user))?;
    Ok(())
}

pub fn balance(tx: &mut dyn UnitOfWork, user: UserId) -> Result<WalletBalance, LedgerError> {
    Ok(load(tx, user)?.balance())
}

/// Read-only check `spendable >= amount`. Only meaningful inside the same unit
/// as the mutation it guards.
pub fn has_sufficient_spendable_balance(
    tx: &mut dyn UnitOfWork,
    user: UserId,
    amount: Amount,
) -> Result<bool, LedgerError> {
    Ok(load(tx, user)?.spendable() >= amount)
}

/// Reserve `amount` for a booking: spendable to held, total unchanged.
pub fn hold(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    user: UserId,
    target: BookingRef,
    amount: Amount,
) -> Result<WalletTransaction, LedgerError> {
    let posting = Posting::booking(Direction::Neutral, Purpose::BookingReserve, target);
    post(tx, now, user, amount, posting, Wallet::hold)
}

/// Release a reservation: held back to spendable, total unchanged.
pub fn unhold(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    user: UserId,
    target: BookingRef,
    amount: Amount,
) -> Result<WalletTransaction, LedgerError> {
    let posting = Posting::booking(Direction::Neutral, Purpose::BookingRelease, target);
    post(tx, now, user, amount, posting, Wallet::release)
}

/// Turn a reservation into a permanent debit: held and total drop.
pub fn settle(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    user: UserId,
    target: BookingRef,
    amount: Amount,
) -> Result<WalletTransaction, LedgerError> {
    let posting = Posting::booking(Direction::Debit, Purpose::BookingSettle, target);
    post(tx, now, user, amount, posting, Wallet::settle)
}

/// Driver earning for a completed booking.
pub fn credit_payout(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    user: UserId,
    target: BookingRef,
    amount: Amount,
) -> Result<WalletTransaction, LedgerError> {
    let posting = Posting::booking(Direction::Credit, Purpose::Payout, target);
    post(tx, now, user, amount, posting, Wallet::credit)
}

/// Penalty drawn from spendable funds only; held funds are never touched.
pub fn apply_fine_charge(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    user: UserId,
    target: BookingRef,
    amount: Amount,
) -> Result<WalletTransaction, LedgerError> {
    let posting = Posting::booking(Direction::Debit, Purpose::FineCharge, target);
    post(tx, now, user, amount, posting, Wallet::debit)
}

pub fn top_up(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    user: UserId,
    amount: Amount,
) -> Result<WalletTransaction, LedgerError> {
    let posting = Posting {
        direction: Direction::Credit,
        purpose: Purpose::TopUp,
        ride: None,
        booking: None,
        external_order: None,
    };
    post(tx, now, user, amount, posting, Wallet::credit)
}

/// Carbon points leaving the wallet for a mart recharge.
pub fn order_purchase(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    user: UserId,
    order: OrderId,
    coins: Amount,
) -> Result<WalletTransaction, LedgerError> {
    let posting = Posting::order(Direction::Debit, Purpose::OrderPurchase, order);
    post(tx, now, user, coins, posting, Wallet::debit)
}

/// Carbon points returned for a refunded mart recharge.
pub fn order_refund(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    user: UserId,
    order: OrderId,
    coins: Amount,
) -> Result<WalletTransaction, LedgerError> {
    let posting = Posting::order(Direction::Credit, Purpose::OrderRefund, order);
    post(tx, now, user, coins, posting, Wallet::credit)
}

fn load(tx: &mut dyn UnitOfWork, user: UserId) -> Result<Wallet, LedgerError> {
    tx.wallet(user)?.ok_or(LedgerError::WalletNotFound(user))
}

fn post(
    tx: &mut dyn UnitOfWork,
    now: DateTime<Utc>,
    user: UserId,
    amount: Amount,
    posting: Posting,
    apply: impl FnOnce(&mut Wallet, Amount) -> Result<(), LedgerError>,
) -> Result<WalletTransaction, LedgerError> {
    if !amount.is_positive() {
        return Err(LedgerError::NonPositiveAmount(amount));
    }

    let mut wallet = load(tx, user)?;
    apply(&mut wallet, amount)?;
    tx.update_wallet(wallet)?;

    let entry = tx.append_transaction(NewWalletTransaction {
        user,
        direction: posting.direction,
        purpose: posting.purpose,
        amount,
        ride: posting.ride,
        booking: posting.booking,
        external_order: posting.external_order,
        description: Some(posting.purpose.label().to_string()),
        created_at: now,
    })?;

    debug!(
        user = user,
        amount = %amount,
        purpose = ?entry.purpose,
        entry = entry.id,
        "ledger entry posted"
    );
    Ok(entry)
}
