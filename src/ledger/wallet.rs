use super::LedgerError;
use crate::Amount;
use crate::model::UserId;

/// A user's wallet with its spendable and held pools.
///
/// The total is derived, so `total == spendable + held` cannot drift. Every
/// mutating method checks its pool first and leaves the wallet untouched when
/// it refuses. Credits are refused once the total would no longer fit in an
/// [`Amount`], so neither pool can overflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wallet {
    user: UserId,
    spendable: Amount,
    held: Amount,
}

/// Read-side view of a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletBalance {
    pub total: Amount,
    pub spendable: Amount,
    pub held: Amount,
}

impl Wallet {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            spendable: Amount::ZERO,
            held: Amount::ZERO,
        }
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn spendable(&self) -> Amount {
        self.spendable
    }

    pub fn held(&self) -> Amount {
        self.held
    }

    pub fn total(&self) -> Amount {
        self.spendable + self.held
    }

    pub fn balance(&self) -> WalletBalance {
        WalletBalance {
            total: self.total(),
            spendable: self.spendable,
            held: self.held,
        }
    }

    /// Move `amount` from spendable to held. Total unchanged.
    pub fn hold(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.ensure_spendable(amount)?;
        let spendable = self.checked(self.spendable.checked_sub(amount), amount)?;
        let held = self.checked(self.held.checked_add(amount), amount)?;
        self.spendable = spendable;
        self.held = held;
        Ok(())
    }

    /// Move `amount` from held back to spendable. Total unchanged.
    pub fn release(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.ensure_held(amount)?;
        let held = self.checked(self.held.checked_sub(amount), amount)?;
        let spendable = self.checked(self.spendable.checked_add(amount), amount)?;
        self.held = held;
        self.spendable = spendable;
        Ok(())
    }

    /// Remove `amount` from held for good. Total decreases.
    pub fn settle(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.ensure_held(amount)?;
        self.held = self.checked(self.held.checked_sub(amount), amount)?;
        Ok(())
    }

    /// Add to spendable. Total increases.
    pub fn credit(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.checked(self.total().checked_add(amount), amount)?;
        self.spendable = self.checked(self.spendable.checked_add(amount), amount)?;
        Ok(())
    }

    /// Remove from spendable, never touching held funds. Total decreases.
    pub fn debit(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.ensure_spendable(amount)?;
        self.spendable = self.checked(self.spendable.checked_sub(amount), amount)?;
        Ok(())
    }

    fn checked(&self, value: Option<Amount>, amount: Amount) -> Result<Amount, LedgerError> {
        value.ok_or(LedgerError::Overflow(self.user, amount))
    }

    fn ensure_spendable(&self, required: Amount) -> Result<(), LedgerError> {
        if self.spendable < required {
            return Err(LedgerError::InsufficientBalance(
                self.user,
                self.spendable,
                required,
            ));
        }
        Ok(())
    }

    fn ensure_held(&self, required: Amount) -> Result<(), LedgerError> {
        if self.held < required {
            return Err(LedgerError::InsufficientHeld(self.user, self.held, required));
        }
        Ok(())
    }
}
