//! Quantization configuration
//!
//! Bit widths and calibration guards shared by every quantized layer of a
//! network.

use crate::error::{QuantError, Result};

/// Configuration for quantization-aware layers
#[derive(Debug, Clone, PartialEq)]
pub struct QuantConfig {
    /// Bit width of activations and weights (unsigned codes `0..2^bits`)
    pub num_bits: u32,
    /// Bit width of the requantized bias (signed, holds accumulated products)
    pub bias_bits: u32,
    /// Narrowest range a QParam will derive a scale from
    pub min_range: f32,
}

/// Activation and weight codes must fit `2..=16` bits.
pub(crate) fn check_num_bits(num_bits: u32) -> Result<()> {
    if !(2..=16).contains(&num_bits) {
        return Err(QuantError::InvalidConfig {
            field: "num_bits",
            message: format!("{num_bits} is outside 2..=16"),
        });
    }
    Ok(())
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            num_bits: 8,
            bias_bits: 32,
            min_range: 1e-6,
        }
    }
}

impl QuantConfig {
    pub fn new(num_bits: u32) -> Self {
        Self {
            num_bits,
            ..Self::default()
        }
    }

    pub fn with_bias_bits(mut self, bias_bits: u32) -> Self {
        self.bias_bits = bias_bits;
        self
    }

    pub fn with_min_range(mut self, min_range: f32) -> Self {
        self.min_range = min_range;
        self
    }

    /// Largest unsigned activation code, `2^num_bits - 1`.
    pub fn qmax(&self) -> f32 {
        2f32.powi(self.num_bits as i32) - 1.0
    }

    pub fn validate(&self) -> Result<()> {
        check_num_bits(self.num_bits)?;
        if self.bias_bits <= self.num_bits || self.bias_bits > 32 {
            return Err(QuantError::InvalidConfig {
                field: "bias_bits",
                message: format!(
                    "{} must exceed num_bits ({}) and be at most 32",
                    self.bias_bits, self.num_bits
                ),
            });
        }
        if !(self.min_range.is_finite() && self.min_range > 0.0) {
            return Err(QuantError::InvalidConfig {
                field: "min_range",
                message: format!("{} must be positive and finite", self.min_range),
            });
        }
        Ok(())
    }
}
