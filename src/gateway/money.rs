//! Decimal <-> minor unit conversion for the processor boundary

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::GatewayError;

/// Kobo per naira, cents per dollar
const MINOR_UNITS_PER_MAJOR: i64 = 100;

/// Convert a decimal amount into processor minor units.
///
/// Amounts must be positive and carry at most two decimal places; nothing is
/// rounded here.
pub fn to_minor_units(amount: Decimal) -> Result<i64, GatewayError> {
    if amount <= Decimal::ZERO {
        return Err(GatewayError::Validation(format!(
            "amount must be positive, got {}",
            amount
        )));
    }

    let scaled = amount * Decimal::from(MINOR_UNITS_PER_MAJOR);
    if !scaled.fract().is_zero() {
        return Err(GatewayError::Validation(format!(
            "amount {} has more than two decimal places",
            amount
        )));
    }

    scaled
        .to_i64()
        .ok_or_else(|| GatewayError::Validation(format!("amount {} is out of range", amount)))
}

/// True when the amount can be represented exactly in minor units
pub fn has_minor_unit_precision(amount: Decimal) -> bool {
    amount.round_dp(2) == amount
}
