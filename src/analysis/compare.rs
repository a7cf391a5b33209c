//! Signal field predicates.

use crate::protocol::FieldValue;
use crate::wait::Matcher;
use std::fmt;

/// Accepts a strength of at least `min_strength` (inclusive).
///
/// On a frequency pair the pair's strength is compared.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompareMinStrength {
    min_strength: f64,
}

impl CompareMinStrength {
    /// Accepts strengths of at least `min_strength`.
    pub fn new(min_strength: f64) -> Self {
        Self { min_strength }
    }

    /// `min_strength <= strength`.
    pub fn accepts(&self, strength: f64) -> bool {
        self.min_strength <= strength
    }
}

impl Default for CompareMinStrength {
    fn default() -> Self {
        Self::new(0.4)
    }
}

impl Matcher for CompareMinStrength {
    fn matches(&self, value: &FieldValue) -> bool {
        match value {
            FieldValue::Scalar(strength) => self.accepts(*strength),
            FieldValue::Pair(pair) => self.accepts(pair.strength),
            FieldValue::Timestamp(_) => false,
        }
    }
}

impl fmt::Display for CompareMinStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmp_min_strength(>{})", self.min_strength)
    }
}

/// Accepts a frequency strictly inside `(reference - deviation, reference + deviation)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompareFrequency {
    reference: f64,
    deviation: f64,
}

impl CompareFrequency {
    /// Accepts frequencies within `deviation` of `reference`, bounds excluded.
    pub fn new(reference: f64, deviation: f64) -> Self {
        Self { reference, deviation }
    }

    /// Default deviation of 20 Hz.
    pub fn around(reference: f64) -> Self {
        Self::new(reference, 20.0)
    }

    /// Open interval test.
    pub fn accepts(&self, frequency: f64) -> bool {
        self.reference - self.deviation < frequency && frequency < self.reference + self.deviation
    }
}

impl Matcher for CompareFrequency {
    fn matches(&self, value: &FieldValue) -> bool {
        match value {
            FieldValue::Pair(pair) => self.accepts(pair.frequency),
            FieldValue::Scalar(frequency) => self.accepts(*frequency),
            FieldValue::Timestamp(_) => false,
        }
    }
}

impl fmt::Display for CompareFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cmp_freq({}<, >{})",
            self.reference - self.deviation,
            self.reference + self.deviation
        )
    }
}
