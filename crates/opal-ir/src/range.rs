//! Value-range metadata.
//!
//! The front end may attach an inclusive signed interval to arithmetic
//! results (from its own range analysis). Narrowing uses it to classify a
//! statically-wide value as narrow when the interval fits a signed 16-bit
//! slot.

use serde::Serialize;

/// Inclusive signed interval `[min, max]` for a 32-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValueRange {
    pub min: i64,
    pub max: i64,
}

impl ValueRange {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    /// Whether every value in the interval fits a signed 16-bit slot.
    pub fn fits_short(&self) -> bool {
        self.min >= i16::MIN as i64 && self.max <= i16::MAX as i64
    }
}
