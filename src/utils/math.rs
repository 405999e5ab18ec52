use alloy::primitives::U256;
use bigdecimal::{BigDecimal, RoundingMode};
use num_bigint::{BigInt, Sign};
use num_traits::Zero;
use std::str::FromStr;
use crate::error::AppError;

/// Fractional digits kept in persisted valuations
pub const VALUATION_SCALE: i64 = 18;

/// Exact signed integer view of an unsigned chain amount
pub fn u256_to_bigint(value: U256) -> BigInt {
    BigInt::from_bytes_be(Sign::Plus, &value.to_be_bytes::<32>())
}

/// Back to a chain amount. Fails for negative values or anything wider than 256 bits.
pub fn bigint_to_u256(value: &BigInt) -> Result<U256, AppError> {
    let (sign, bytes) = value.to_bytes_be();
    if sign == Sign::Minus {
        return Err(AppError::ValidationError(format!("Negative amount: {}", value)));
    }
    U256::try_from_be_slice(&bytes)
        .ok_or_else(|| AppError::ValidationError(format!("Amount exceeds 256 bits: {}", value)))
}

pub fn u256_to_big_decimal(value: U256) -> BigDecimal {
    BigDecimal::from(u256_to_bigint(value))
}

/// Integral `NUMERIC` column value back to a chain amount
pub fn big_decimal_to_u256(value: &BigDecimal) -> Result<U256, AppError> {
    if !value.is_integer() {
        return Err(AppError::ValidationError(format!("Amount is not integral: {}", value)));
    }
    let (digits, _) = value.with_scale(0).into_bigint_and_exponent();
    bigint_to_u256(&digits)
}

/// Convert a smallest-unit balance into whole units: `balance / 10^decimals`, exactly
pub fn scale_down(balance: &BigInt, decimals: u8) -> BigDecimal {
    BigDecimal::new(balance.clone(), decimals as i64)
}

/// Value of a smallest-unit balance at a unit price
pub fn valuate(balance: &BigInt, decimals: u8, price: &BigDecimal) -> BigDecimal {
    if balance.is_zero() || price.is_zero() {
        return BigDecimal::zero();
    }
    scale_down(balance, decimals) * price
}

/// Round half-even to the persisted valuation scale
pub fn round_valuation(value: &BigDecimal) -> BigDecimal {
    value.with_scale_round(VALUATION_SCALE, RoundingMode::HalfEven)
}

pub fn parse_price(value: &str) -> Result<BigDecimal, AppError> {
    BigDecimal::from_str(value.trim())
        .map_err(|e| AppError::ValidationError(format!("Invalid price '{}': {}", value, e)))
}
