//! Monetary types for EscrowSettle.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A monetary amount with currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// The amount value (high precision decimal).
    pub value: Decimal,
    /// ISO 4217 currency code.
    pub currency: Currency,
}

impl Money {
    /// Create a new Money instance.
    pub fn new(value: Decimal, currency: Currency) -> Self {
        Self { value, currency }
    }

    /// Check if the amount is negative.
    pub fn is_negative(&self) -> bool {
        self.value < Decimal::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.currency)
    }
}

/// ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    /// Create a new currency from code.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_uppercase())
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    pub fn usd() -> Self {
        Self::new("USD")
    }

    pub fn eur() -> Self {
        Self::new("EUR")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Currency {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Platform commission rate, expressed as a fraction of the booking total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionRate(Decimal);

impl CommissionRate {
    /// The platform default: 5% of the booking total.
    pub const DEFAULT: CommissionRate = CommissionRate(Decimal::from_parts(5, 0, 0, false, 2));

    /// Create a rate from a fraction. Returns `None` outside `[0, 1)`.
    pub fn new(fraction: Decimal) -> Option<Self> {
        if fraction >= Decimal::ZERO && fraction < Decimal::ONE {
            Some(Self(fraction))
        } else {
            None
        }
    }

    /// The rate as a fraction.
    pub fn fraction(&self) -> Decimal {
        self.0
    }

    /// Commission owed on `total`.
    pub fn apply(&self, total: Decimal) -> Decimal {
        total * self.0
    }
}

impl Default for CommissionRate {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for CommissionRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0 * Decimal::ONE_HUNDRED)
    }
}
