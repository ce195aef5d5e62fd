//! Amounts in the currency's minor unit (fen/cents).
//!
//! The API only ever carries integers; conversion to and from major units
//! happens here and nowhere else, and never goes through floating point.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const CURRENCY_SYMBOL: &str = "¥";
const MINOR_PER_MAJOR: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    #[error("amount is empty")]
    Empty,
    #[error("amount '{0}' is not a number")]
    NotANumber(String),
    #[error("amount '{0}' has more than two decimal places")]
    TooPrecise(String),
    #[error("amount must not be negative")]
    Negative,
    #[error("amount is too large")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub fn from_major(major: i64) -> Option<Self> {
        major.checked_mul(MINOR_PER_MAJOR).map(Self)
    }

    /// Parses user input such as `299`, `299.5` or `¥1,299.00`.
    pub fn from_major_str(input: &str) -> Result<Self, MoneyError> {
        let cleaned: String = input
            .trim()
            .trim_start_matches(CURRENCY_SYMBOL)
            .chars()
            .filter(|c| *c != ',' && !c.is_whitespace())
            .collect();
        if cleaned.is_empty() {
            return Err(MoneyError::Empty);
        }
        if cleaned.starts_with('-') {
            return Err(MoneyError::Negative);
        }

        let (whole, fraction) = match cleaned.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (cleaned.as_str(), ""),
        };
        let is_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
        if (whole.is_empty() && fraction.is_empty()) || !is_digits(whole) || !is_digits(fraction) {
            return Err(MoneyError::NotANumber(input.to_string()));
        }
        if fraction.len() > 2 {
            return Err(MoneyError::TooPrecise(input.to_string()));
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| MoneyError::Overflow)?
        };
        let fraction: i64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().map_err(|_| MoneyError::Overflow)? * 10,
            _ => fraction.parse().map_err(|_| MoneyError::Overflow)?,
        };

        whole
            .checked_mul(MINOR_PER_MAJOR)
            .and_then(|minor| minor.checked_add(fraction))
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// `299.00` for `29900`; no currency symbol.
    pub fn major_string(self) -> String {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let per = MINOR_PER_MAJOR.unsigned_abs();
        format!("{sign}{}.{:02}", abs / per, abs % per)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let major = self.major_string();
        match major.strip_prefix('-') {
            Some(rest) => write!(f, "-{CURRENCY_SYMBOL}{rest}"),
            None => write!(f, "{CURRENCY_SYMBOL}{major}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_whole_amount_roundtrip() {
        let money = Money::from_major_str("299").unwrap();
        assert_eq!(money.minor(), 29_900);
        assert_eq!(money.to_string(), "¥299.00");
    }

    #[test]
    fn test_fractional_amounts() {
        assert_eq!(Money::from_major_str("0.5").unwrap().minor(), 50);
        assert_eq!(Money::from_major_str("12.05").unwrap().minor(), 1_205);
        assert_eq!(Money::from_major_str(".99").unwrap().minor(), 99);
        assert_eq!(Money::from_major_str("¥1,299.00").unwrap().minor(), 129_900);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert_eq!(Money::from_major_str(""), Err(MoneyError::Empty));
        assert_eq!(Money::from_major_str("-3"), Err(MoneyError::Negative));
        assert!(matches!(
            Money::from_major_str("1.005"),
            Err(MoneyError::TooPrecise(_))
        ));
        assert!(matches!(
            Money::from_major_str("abc"),
            Err(MoneyError::NotANumber(_))
        ));
        assert!(matches!(
            Money::from_major_str("."),
            Err(MoneyError::NotANumber(_))
        ));
        assert_eq!(
            Money::from_major_str("99999999999999999999"),
            Err(MoneyError::Overflow)
        );
    }

    #[test]
    fn test_negative_display() {
        assert_eq!(Money::from_minor(-150).to_string(), "-¥1.50");
    }

    #[test]
    fn test_checked_arithmetic() {
        assert_eq!(
            Money::from_minor(29_900).checked_add(Money::from_minor(5_000)),
            Some(Money::from_minor(34_900))
        );
        assert_eq!(Money::from_minor(i64::MAX).checked_add(Money::from_minor(1)), None);
    }

    proptest! {
        #[test]
        fn major_minor_roundtrip_is_exact(whole in 0i64..10_000_000, cents in 0i64..100) {
            let input = format!("{whole}.{cents:02}");
            let money = Money::from_major_str(&input).unwrap();
            prop_assert_eq!(money.minor(), whole * 100 + cents);
            prop_assert_eq!(money.major_string(), input.clone());
            prop_assert_eq!(money.to_string(), format!("¥{input}"));
        }
    }
}
