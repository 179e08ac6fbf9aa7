//! Shared primitive types used across the entire engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A stable, unique identifier for a bucket (uuid v4 text).
pub type BucketId = String;

/// Identifier of a generated remittance file (uuid v4 text).
pub type FileId = String;

/// Identifier of a bucketing rule, as configured.
pub type RuleId = String;

/// Identifier of a generation threshold, as configured.
pub type ThresholdId = String;

/// Identifier of a claim, as carried by the change event.
pub type ClaimId = String;

/// Epoch milliseconds, the storage representation of every timestamp.
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

// ── Money ──────────────────────────────────────────────────────────

/// A monetary amount held as integer cents.
///
/// Parsed from decimal text with at most two fractional digits. Serialized
/// back to the same text form so JSON config and events never go through
/// floating point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "AmountRepr", into = "String")]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    pub const fn from_dollars(dollars: i64) -> Self {
        Money(dollars * 100)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid amount '{input}': {reason}")]
pub struct MoneyParseError {
    pub input: String,
    pub reason: &'static str,
}

impl FromStr for Money {
    type Err = MoneyParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let fail = |reason| MoneyParseError {
            input: input.to_string(),
            reason,
        };
        let text = input.trim();
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(fail("no digits"));
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(fail("not a decimal number"));
        }
        if frac.len() > 2 {
            return Err(fail("more than two decimal places"));
        }
        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| fail("out of range"))?
        };
        let frac_cents: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| fail("not a decimal number"))? * 10,
            _ => frac.parse().map_err(|_| fail("not a decimal number"))?,
        };
        let cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac_cents))
            .ok_or_else(|| fail("out of range"))?;
        Ok(Money(if negative { -cents } else { cents }))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl From<Money> for String {
    fn from(money: Money) -> Self {
        money.to_string()
    }
}

/// Wire form of an amount: decimal text or a bare JSON number.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AmountRepr {
    Text(String),
    Number(serde_json::Number),
}

impl AmountRepr {
    pub fn into_text(self) -> String {
        match self {
            AmountRepr::Text(text) => text,
            AmountRepr::Number(n) => n.to_string(),
        }
    }
}

impl TryFrom<AmountRepr> for Money {
    type Error = MoneyParseError;

    fn try_from(repr: AmountRepr) -> Result<Self, Self::Error> {
        repr.into_text().parse()
    }
}

// ── Text-mapped enums ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Gives a fieldless enum a stable text form, `FromStr`, and SQLite
/// column mapping. The text form is what the store persists.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::types::UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err($crate::types::UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

pub(crate) use text_enum;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_text() {
        assert_eq!("100".parse::<Money>().unwrap(), Money::from_cents(10_000));
        assert_eq!("100.5".parse::<Money>().unwrap(), Money::from_cents(10_050));
        assert_eq!("0.07".parse::<Money>().unwrap(), Money::from_cents(7));
        assert_eq!(" 12.34 ".parse::<Money>().unwrap(), Money::from_cents(1_234));
        assert_eq!("-3.10".parse::<Money>().unwrap(), Money::from_cents(-310));
    }

    #[test]
    fn rejects_malformed_text() {
        for bad in ["", ".", "abc", "1.234", "1,000.00", "--1", "1e5"] {
            assert!(bad.parse::<Money>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn displays_two_decimals() {
        assert_eq!(Money::from_cents(50_000).to_string(), "500.00");
        assert_eq!(Money::from_cents(-5).to_string(), "-0.05");
    }

    #[test]
    fn deserializes_text_or_number() {
        let a: Money = serde_json::from_str("\"4999.99\"").unwrap();
        let b: Money = serde_json::from_str("5000").unwrap();
        let c: Money = serde_json::from_str("12.5").unwrap();
        assert_eq!(a, Money::from_cents(499_999));
        assert_eq!(b, Money::from_dollars(5_000));
        assert_eq!(c, Money::from_cents(1_250));
    }
}
