//! 256-bit unsigned integer used for search boundaries.
//!
//! Wraps `ruint::aliases::U256` so callers deal in big-endian byte arrays
//! (the order boundaries travel in) and never touch the backing library.

use ruint::aliases::U256 as Ruint256;

/// A 256-bit unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct U256(Ruint256);

impl U256 {
    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(Ruint256::from_be_bytes(bytes))
    }

    pub fn to_be_bytes(self) -> [u8; 32] {
        self.0.to_be_bytes()
    }

    /// All-ones value shifted right by `bits`, i.e. a target with `bits`
    /// leading zero bits.
    pub fn max_shr(bits: usize) -> Self {
        Self(Ruint256::MAX >> bits)
    }
}
