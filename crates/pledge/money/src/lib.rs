//! Exact decimal money primitive.
//!
//! Every amount in the engine is a [`Money`]: an exact `rust_decimal`
//! amount tagged with a currency code. Arithmetic between mismatched
//! currencies is a hard error, and no floating-point representation
//! exists anywhere on this path.

#![deny(unsafe_code)]

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by money arithmetic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch { expected: Currency, found: Currency },

    #[error("invalid amount: {amount}")]
    InvalidAmount { amount: Decimal },

    #[error("invalid rate: {rate} (must be within [0, 1])")]
    InvalidRate { rate: Decimal },
}

/// Uppercase ISO-style currency code.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(pub String);

impl Currency {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_ascii_uppercase())
    }

    pub fn usd() -> Self {
        Self("USD".to_string())
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An exact decimal amount in a single currency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    /// Fail unless `other` carries the same currency tag.
    pub fn ensure_same_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                expected: self.currency.clone(),
                found: other.currency.clone(),
            });
        }
        Ok(())
    }

    pub fn add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(other)?;
        Ok(Money::new(self.amount + other.amount, self.currency.clone()))
    }

    pub fn sub(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(other)?;
        Ok(Money::new(self.amount - other.amount, self.currency.clone()))
    }

    /// Multiply by a unitless rate (APR, fee rate, share fraction).
    pub fn mul_rate(&self, rate: Decimal) -> Money {
        Money::new(self.amount * rate, self.currency.clone())
    }

    /// The smaller of two same-currency amounts.
    pub fn min(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(other)?;
        Ok(if self.amount <= other.amount {
            self.clone()
        } else {
            other.clone()
        })
    }

    /// Round to cents, midpoint away from zero.
    pub fn round_cents(&self) -> Money {
        Money::new(
            self.amount
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
            self.currency.clone(),
        )
    }

    /// Split into cent-rounded shares plus the exact remainder.
    ///
    /// Shares are `self × weight` rounded to cents; the remainder is
    /// whatever is left so that shares + remainder == self exactly. The
    /// caller decides which account absorbs the remainder.
    pub fn allocate(&self, weights: &[Decimal]) -> (Vec<Money>, Money) {
        let mut shares = Vec::with_capacity(weights.len());
        let mut allocated = Decimal::ZERO;
        for weight in weights {
            let share = self.mul_rate(*weight).round_cents();
            allocated += share.amount;
            shares.push(share);
        }
        let remainder = Money::new(self.amount - allocated, self.currency.clone());
        (shares, remainder)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}
