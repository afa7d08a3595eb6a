//! Shift-multiplier search
//!
//! Finds an integer `Mo` and shift `n` with `M ~ Mo / 2^n`, the form an
//! integer-only kernel would use in place of the float multiplier. Diagnostic
//! only; frozen layers keep multiplying by the float `M`.

use crate::error::{QuantError, Result};

/// Probe value the approximation is checked against.
pub const DEFAULT_PROBE: i64 = 7000;

/// Largest shift tried before giving up on an exact match.
pub const MAX_SHIFT: u32 = 22;

/// `M ~ mo >> n`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftMultiplier {
    pub mo: i64,
    pub n: u32,
}

impl ShiftMultiplier {
    /// `(mo * x) >> n`, the integer stand-in for `round(M * x)`.
    pub fn apply(&self, x: i64) -> i64 {
        ((self.mo as i128 * x as i128) >> self.n) as i64
    }

    pub fn as_f64(&self) -> f64 {
        self.mo as f64 / 2f64.powi(self.n as i32)
    }
}

/// Increase `n` from 1 until `(round(2^n * M) * probe) >> n` equals
/// `round(M * probe)`, or `n` reaches [`MAX_SHIFT`].
pub fn search_shift_multiplier(m: f64, probe: i64) -> Result<ShiftMultiplier> {
    if !m.is_finite() || m.abs() >= 2f64.powi(31) {
        return Err(QuantError::InvalidConfig {
            field: "multiplier",
            message: format!("{m} is not a finite value below 2^31"),
        });
    }
    if probe <= 0 {
        return Err(QuantError::InvalidConfig {
            field: "probe",
            message: format!("{probe} must be positive"),
        });
    }

    let exact = (m * probe as f64).round_ties_even() as i128;
    let mut n = 1;
    loop {
        let mo = (2f64.powi(n as i32) * m).round_ties_even() as i64;
        let candidate = ShiftMultiplier { mo, n };
        let approx = candidate.apply(probe) as i128;
        let error = approx - exact;
        tracing::debug!(n, mo, approx = approx as i64, exact = exact as i64, error = error as i64, "shift search");

        if error == 0 || n >= MAX_SHIFT {
            return Ok(candidate);
        }
        n += 1;
    }
}
