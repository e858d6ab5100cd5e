use crate::error::LedgerError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of fractional digits the ledger keeps for any monetary value.
pub const SCALE: u32 = 4;

/// Represents a monetary value with 4 decimal places precision.
///
/// This is a wrapper around `rust_decimal::Decimal` to enforce domain-specific rules
/// and provide type safety for balance arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Balance(pub Decimal);

/// A strictly positive amount moved by a single ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, LedgerError> {
        if value <= Decimal::ZERO {
            return Err(LedgerError::invalid(format!(
                "amount must be positive, got {value}"
            )));
        }
        if value.normalize().scale() > SCALE {
            return Err(LedgerError::invalid(format!(
                "amount {value} has more than {SCALE} decimal places"
            )));
        }
        Ok(Self(value.normalize()))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl From<Amount> for Balance {
    fn from(amount: Amount) -> Self {
        Self(amount.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Balance {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount.normalize())
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    /// Whether `amount` can be taken from this balance without going below zero.
    pub fn covers(&self, amount: Amount) -> bool {
        self.0 >= amount.value()
    }

    /// The balance after `delta`, or `None` when it does not fit in a `Decimal`.
    pub fn checked_add(self, delta: Delta) -> Option<Self> {
        self.0.checked_add(delta.0).map(Self)
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

/// A signed change applied to an account balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Delta(Decimal);

impl Delta {
    pub fn credit(amount: Amount) -> Self {
        Self(amount.0)
    }

    pub fn debit(amount: Amount) -> Self {
        Self(-amount.0)
    }

    /// The unsigned size of the change.
    pub fn magnitude(&self) -> Decimal {
        self.0.abs()
    }
}
