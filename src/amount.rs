use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Fixed-point decimal with 4 decimal places, stored as a scaled integer.
///
/// Used for carbon points, mart currency and CE points alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

/// Error returned when a decimal string cannot be read as an [`Amount`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountParseError {
    #[error("'{0}' is not a decimal number")]
    Invalid(String),
    #[error("'{0}' has more than 4 decimal places")]
    TooPrecise(String),
}

impl Amount {
    const SCALE: i64 = 10_000;
    const DECIMALS: usize = 4;

    pub const ZERO: Amount = Amount(0);

    pub fn from_float(value: f64) -> Self {
        Amount((value * Self::SCALE as f64).round() as i64)
    }

    pub fn from_scaled(value: i64) -> Self {
        Amount(value)
    }

    pub const fn from_whole(value: i64) -> Self {
        Amount(value * Self::SCALE)
    }

    pub fn to_float(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    /// Round half away from zero to `places` decimals (at most 4).
    pub fn round_dp(self, places: u32) -> Self {
        let places = places.min(Self::DECIMALS as u32);
        let step = 10_i64.pow(Self::DECIMALS as u32 - places);
        let half = step / 2;
        let rounded = if self.0 >= 0 {
            self.0.saturating_add(half) / step * step
        } else {
            self.0.saturating_sub(half) / step * step
        };
        Amount(rounded)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        let whole = abs / Self::SCALE;
        let frac = abs % Self::SCALE;
        write!(f, "{sign}{whole}.{frac:04}")
    }
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AmountParseError::Invalid(s.to_string());
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if frac.len() > Self::DECIMALS {
            return Err(AmountParseError::TooPrecise(s.to_string()));
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let frac: i64 = if frac.is_empty() {
            0
        } else {
            let padded = format!("{frac:0<width$}", width = Self::DECIMALS);
            padded.parse().map_err(|_| invalid())?
        };
        let scaled = whole
            .checked_mul(Self::SCALE)
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(invalid)?;
        Ok(Amount(if negative { -scaled } else { scaled }))
    }
}

impl std::ops::Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Amount(self.0 - rhs.0)
    }
}

impl std::ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_float_converts_correctly() {
        assert_eq!(Amount::from_float(100.0), Amount::from_scaled(1_000_000));
        assert_eq!(Amount::from_float(1.5), Amount::from_scaled(15_000));
        assert_eq!(Amount::from_float(0.0001), Amount::from_scaled(1));
    }

    #[test]
    fn from_float_rounds_correctly() {
        assert_eq!(Amount::from_float(1.23456), Amount::from_scaled(12346));
        assert_eq!(Amount::from_float(1.23454), Amount::from_scaled(12345));
    }

    #[test]
    fn from_whole_scales() {
        assert_eq!(Amount::from_whole(500), Amount::from_scaled(5_000_000));
        assert_eq!(Amount::from_whole(0), Amount::ZERO);
    }

    #[test]
    fn display_formats_positive_and_negative() {
        assert_eq!(Amount::from_scaled(1_000_000).to_string(), "100.0000");
        assert_eq!(Amount::from_scaled(1).to_string(), "0.0001");
        assert_eq!(Amount::from_scaled(0).to_string(), "0.0000");
        assert_eq!(Amount::from_scaled(-502_500).to_string(), "-50.2500");
    }

    #[test]
    fn parse_reads_decimal_strings_exactly() {
        assert_eq!("100".parse::<Amount>(), Ok(Amount::from_whole(100)));
        assert_eq!("12.5".parse::<Amount>(), Ok(Amount::from_scaled(125_000)));
        assert_eq!(" 0.0001 ".parse::<Amount>(), Ok(Amount::from_scaled(1)));
        assert_eq!(".25".parse::<Amount>(), Ok(Amount::from_scaled(2_500)));
        assert_eq!("-3.1".parse::<Amount>(), Ok(Amount::from_scaled(-31_000)));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            "abc".parse::<Amount>(),
            Err(AmountParseError::Invalid(_))
        ));
        assert!(matches!("".parse::<Amount>(), Err(AmountParseError::Invalid(_))));
        assert!(matches!(
            "1.23456".parse::<Amount>(),
            Err(AmountParseError::TooPrecise(_))
        ));
    }

    #[test]
    fn round_dp_rounds_half_away_from_zero() {
        assert_eq!(
            Amount::from_scaled(12_345).round_dp(2),
            Amount::from_scaled(12_300)
        );
        assert_eq!(
            Amount::from_scaled(12_350).round_dp(2),
            Amount::from_scaled(12_400)
        );
        assert_eq!(
            Amount::from_scaled(-12_350).round_dp(2),
            Amount::from_scaled(-12_400)
        );
        assert_eq!(
            Amount::from_scaled(12_345).round_dp(4),
            Amount::from_scaled(12_345)
        );
    }

    #[test]
    fn arithmetic() {
        let mut a = Amount::from_scaled(100);
        a += Amount::from_scaled(50);
        assert_eq!(a, Amount::from_scaled(150));
        a -= Amount::from_scaled(30);
        assert_eq!(a, Amount::from_scaled(120));
        assert_eq!(a - Amount::from_scaled(20), Amount::from_scaled(100));
        assert_eq!(a + Amount::from_scaled(5), Amount::from_scaled(125));
    }

    #[test]
    fn checked_arithmetic_reports_overflow() {
        let max = Amount::from_scaled(i64::MAX);
        assert_eq!(max.checked_add(Amount::from_scaled(1)), None);
        assert_eq!(
            Amount::from_scaled(i64::MIN).checked_sub(Amount::from_scaled(1)),
            None
        );
        assert_eq!(
            Amount::from_whole(5).checked_sub(Amount::from_whole(2)),
            Some(Amount::from_whole(3))
        );
        assert_eq!(max.round_dp(2), Amount::from_scaled(i64::MAX / 100 * 100));
    }

    #[test]
    fn sum_of_amounts() {
        let total: Amount = [1, 2, 3].into_iter().map(Amount::from_whole).sum();
        assert_eq!(total, Amount::from_whole(6));
    }

    #[test]
    fn sign_checks() {
        assert!(Amount::from_scaled(1).is_positive());
        assert!(!Amount::ZERO.is_positive());
        assert!(Amount::from_scaled(-1).is_negative());
        assert!(Amount::from_scaled(-100) < Amount::ZERO);
    }
}
