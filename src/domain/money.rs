use crate::error::PaymentError;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// A monetary amount in integer minor units (cents, pence, yen).
///
/// All ledger arithmetic happens on this type; providers that report major
/// units as decimal strings are converted once, at normalization time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MinorUnits(pub i64);

impl MinorUnits {
    pub const ZERO: Self = Self(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// Converts a major-unit decimal amount (`"100.00"`) into minor units for
    /// `currency`. Amounts with more precision than the currency allows are
    /// rejected instead of rounded.
    pub fn from_major(amount: Decimal, currency: &str) -> Result<Self, PaymentError> {
        if amount.is_sign_negative() {
            return Err(PaymentError::MalformedPayload(format!(
                "negative amount {amount}"
            )));
        }
        let scale = Decimal::from(10_i64.pow(currency_exponent(currency)));
        let minor = amount.checked_mul(scale).ok_or_else(|| {
            PaymentError::MalformedPayload(format!("amount {amount} overflows"))
        })?;
        if minor.fract() != Decimal::ZERO {
            return Err(PaymentError::MalformedPayload(format!(
                "amount {amount} has more precision than {currency} allows"
            )));
        }
        let value = minor.trunc().to_i64().ok_or_else(|| {
            PaymentError::MalformedPayload(format!("amount {amount} out of range"))
        })?;
        Ok(Self(value))
    }

    /// Parses a decimal string in major units, as sent by checkout platforms.
    pub fn parse_major(amount: &str, currency: &str) -> Result<Self, PaymentError> {
        let decimal: Decimal = amount.trim().parse().map_err(|e| {
            PaymentError::MalformedPayload(format!("invalid amount '{amount}': {e}"))
        })?;
        Self::from_major(decimal, currency)
    }
}

/// Number of minor-unit digits for an ISO 4217 currency code.
pub fn currency_exponent(currency: &str) -> u32 {
    match currency.to_ascii_uppercase().as_str() {
        "JPY" | "KRW" | "VND" | "CLP" | "ISK" | "UGX" => 0,
        "BHD" | "KWD" | "JOD" | "OMR" | "TND" => 3,
        _ => 2,
    }
}

impl Add for MinorUnits {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for MinorUnits {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl AddAssign for MinorUnits {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl SubAssign for MinorUnits {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

impl Neg for MinorUnits {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Self(self.0.saturating_neg())
    }
}

impl std::iter::Sum for MinorUnits {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, x| acc + x)
    }
}

impl std::fmt::Display for MinorUnits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
