//! Unsigned 128-bit integer with checked arithmetic and fixed-size encoding.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of the fixed big-endian encoding in bytes.
pub const UINT128_BYTE_LENGTH: usize = 16;

/// Errors produced by checked arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArithmeticError {
    #[error("uint128 overflow")]
    Overflow,

    #[error("uint128 underflow")]
    Underflow,
}

/// Unsigned 128-bit amount used for balances, values and gas.
///
/// Every arithmetic operation is checked: `add`/`mul` fail with `Overflow`
/// and `sub` fails with `Underflow` instead of wrapping. Serialization is a
/// fixed 16-byte big-endian slice so encoded amounts are comparable and
/// hash-stable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uint128(u128);

impl Uint128 {
    /// Creates a value from a raw `u128`.
    pub const fn new(value: u128) -> Self {
        Uint128(value)
    }

    /// The zero value.
    pub const fn zero() -> Self {
        Uint128(0)
    }

    /// Returns true if the value is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Returns the raw `u128` value.
    pub const fn value(&self) -> u128 {
        self.0
    }

    /// Checked addition.
    pub fn add(&self, rhs: Uint128) -> Result<Uint128, ArithmeticError> {
        self.0
            .checked_add(rhs.0)
            .map(Uint128)
            .ok_or(ArithmeticError::Overflow)
    }

    /// Checked subtraction.
    pub fn sub(&self, rhs: Uint128) -> Result<Uint128, ArithmeticError> {
        self.0
            .checked_sub(rhs.0)
            .map(Uint128)
            .ok_or(ArithmeticError::Underflow)
    }

    /// Checked multiplication.
    pub fn mul(&self, rhs: Uint128) -> Result<Uint128, ArithmeticError> {
        self.0
            .checked_mul(rhs.0)
            .map(Uint128)
            .ok_or(ArithmeticError::Overflow)
    }

    /// Encodes the value as a fixed 16-byte big-endian array.
    pub fn to_fixed_bytes(&self) -> [u8; UINT128_BYTE_LENGTH] {
        self.0.to_be_bytes()
    }

    /// Decodes a value from a fixed 16-byte big-endian slice.
    ///
    /// Returns `None` if the slice length is not exactly 16 bytes.
    pub fn from_fixed_bytes(bytes: &[u8]) -> Option<Uint128> {
        let bytes: [u8; UINT128_BYTE_LENGTH] = bytes.try_into().ok()?;
        Some(Uint128(u128::from_be_bytes(bytes)))
    }
}

impl fmt::Display for Uint128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Uint128 {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u128>().map(Uint128)
    }
}

impl From<u64> for Uint128 {
    fn from(value: u64) -> Self {
        Uint128(value as u128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_checks_overflow() {
        let max = Uint128::new(u128::MAX);
        assert_eq!(max.add(Uint128::new(1)), Err(ArithmeticError::Overflow));
        assert_eq!(
            Uint128::new(40).add(Uint128::new(2)),
            Ok(Uint128::new(42))
        );
    }

    #[test]
    fn sub_checks_underflow() {
        assert_eq!(
            Uint128::zero().sub(Uint128::new(1)),
            Err(ArithmeticError::Underflow)
        );
        assert_eq!(
            Uint128::new(42).sub(Uint128::new(2)),
            Ok(Uint128::new(40))
        );
    }

    #[test]
    fn mul_checks_overflow() {
        let half = Uint128::new(1u128 << 127);
        assert_eq!(half.mul(Uint128::new(2)), Err(ArithmeticError::Overflow));
        assert_eq!(
            Uint128::new(6).mul(Uint128::new(7)),
            Ok(Uint128::new(42))
        );
    }

    #[test]
    fn fixed_bytes_are_big_endian() {
        let value = Uint128::new(0x0102);
        let bytes = value.to_fixed_bytes();
        assert_eq!(bytes.len(), UINT128_BYTE_LENGTH);
        assert_eq!(bytes[14], 0x01);
        assert_eq!(bytes[15], 0x02);
        assert!(bytes[..14].iter().all(|&b| b == 0));
    }

    #[test]
    fn fixed_bytes_roundtrip() {
        for value in [0u128, 1, 1_000_000, u128::MAX] {
            let original = Uint128::new(value);
            let decoded = Uint128::from_fixed_bytes(&original.to_fixed_bytes()).unwrap();
            assert_eq!(original, decoded);
        }
    }

    #[test]
    fn from_fixed_bytes_rejects_wrong_length() {
        assert!(Uint128::from_fixed_bytes(&[0u8; 15]).is_none());
        assert!(Uint128::from_fixed_bytes(&[0u8; 17]).is_none());
        assert!(Uint128::from_fixed_bytes(&[]).is_none());
    }

    #[test]
    fn parses_decimal_strings() {
        let parsed: Uint128 = "50000000000".parse().unwrap();
        assert_eq!(parsed, Uint128::new(50_000_000_000));
        assert_eq!(format!("{}", parsed), "50000000000");
    }
}
