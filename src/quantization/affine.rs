//! Uniform affine quantization math
//!
//! `real = scale * (q - zero_point)` with unsigned codes for activations and
//! weights and signed codes for requantized biases. All rounding is
//! round-half-to-even, so `2.5 -> 2` and `3.5 -> 4`.

use crate::error::{QuantError, Result};
use crate::Tensor;

/// `(qmin, qmax)` for a bit width.
pub fn quant_range(num_bits: u32, signed: bool) -> (f32, f32) {
    if signed {
        let half = 2f64.powi(num_bits as i32 - 1);
        (-half as f32, (half - 1.0) as f32)
    } else {
        (0.0, (2f64.powi(num_bits as i32) - 1.0) as f32)
    }
}

/// Derive `(scale, zero_point)` from an observed range.
///
/// `scale = (max - min) / (qmax - qmin)`,
/// `zero_point = round(qmax - max / scale)` clamped to `[qmin, qmax]`.
pub fn calc_scale_zero_point(min: f32, max: f32, num_bits: u32) -> Result<(f32, i32)> {
    if !(min.is_finite() && max.is_finite() && max > min) {
        return Err(QuantError::DegenerateRange { min, max });
    }
    let (qmin, qmax) = quant_range(num_bits, false);
    let scale = (max - min) / (qmax - qmin);
    let zero_point = (qmax - max / scale).round_ties_even().clamp(qmin, qmax);
    Ok((scale, zero_point as i32))
}

/// `clamp(zero_point + x / scale).round()` elementwise.
///
/// The input range is clamped before rounding, so the result always lies on
/// an integer inside `[qmin, qmax]`.
pub fn quantize_tensor(x: &Tensor, scale: f32, zero_point: f32, num_bits: u32, signed: bool) -> Tensor {
    let (qmin, qmax) = quant_range(num_bits, signed);
    x.map(|v| (zero_point + v / scale).clamp(qmin, qmax).round_ties_even())
}

/// `scale * (q - zero_point)` elementwise.
pub fn dequantize_tensor(q: &Tensor, scale: f32, zero_point: f32) -> Tensor {
    q.map(|v| scale * (v - zero_point))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn unit_range_8bit() {
        let (scale, zp) = calc_scale_zero_point(0.0, 1.0, 8).unwrap();
        assert_abs_diff_eq!(scale, 1.0 / 255.0, epsilon = 1e-9);
        assert_eq!(zp, 0);
    }

    #[test]
    fn symmetric_range_8bit() {
        let (scale, zp) = calc_scale_zero_point(-1.0, 1.0, 8).unwrap();
        assert_abs_diff_eq!(scale, 0.007_843_14, epsilon = 1e-7);
        // 1 / scale rounds to 127.50001 in f32, so the zero point is 128
        assert_eq!(zp, 128);
    }

    #[test]
    fn zero_point_rounds_before_truncating() {
        // scale = 4/3, qmax - max/scale = 3 - 2.25 = 0.75 -> 1
        let (scale, zp) = calc_scale_zero_point(-1.0, 3.0, 2).unwrap();
        assert_abs_diff_eq!(scale, 4.0 / 3.0, epsilon = 1e-6);
        assert_eq!(zp, 1);
    }

    #[test]
    fn zero_point_clamps_for_one_sided_ranges() {
        let (_, zp) = calc_scale_zero_point(2.0, 4.0, 8).unwrap();
        assert_eq!(zp, 0);
        let (_, zp) = calc_scale_zero_point(-4.0, -2.0, 8).unwrap();
        assert_eq!(zp, 255);
    }

    #[test]
    fn degenerate_ranges_are_rejected() {
        assert_eq!(
            calc_scale_zero_point(1.0, 1.0, 8),
            Err(QuantError::DegenerateRange { min: 1.0, max: 1.0 })
        );
        assert!(calc_scale_zero_point(2.0, 1.0, 8).is_err());
        assert!(calc_scale_zero_point(f32::NEG_INFINITY, 1.0, 8).is_err());
    }

    #[test]
    fn signed_range_and_clamping() {
        assert_eq!(quant_range(8, true), (-128.0, 127.0));
        assert_eq!(quant_range(32, true).0, -2_147_483_648.0);
        let x = Tensor::new(vec![-1000.0, -0.6, 0.6, 1000.0], &[4]);
        let q = quantize_tensor(&x, 0.5, 0.0, 8, true);
        assert_eq!(q.to_vec(), vec![-128.0, -1.0, 1.0, 127.0]);
    }

    #[test]
    fn quantize_rounds_half_to_even() {
        let x = Tensor::new(vec![0.5, 1.5, 2.5], &[3]);
        let q = quantize_tensor(&x, 1.0, 0.0, 8, false);
        assert_eq!(q.to_vec(), vec![0.0, 2.0, 2.0]);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(200))]

        /// Dequantize(quantize(x)) stays within one step of x inside the range
        #[test]
        fn prop_round_trip_within_one_step(
            values in prop::collection::vec(-50.0f32..50.0, 2..64),
            bits in 2u32..=8,
        ) {
            let min = values.iter().copied().fold(f32::INFINITY, f32::min);
            let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            prop_assume!(max - min > 1e-3);

            let (scale, zp) = calc_scale_zero_point(min, max, bits).unwrap();
            let x = Tensor::new(values.clone(), &[values.len()]);
            let q = quantize_tensor(&x, scale, zp as f32, bits, false);
            let back = dequantize_tensor(&q, scale, zp as f32);

            let (qmin, qmax) = quant_range(bits, false);
            for (i, &v) in values.iter().enumerate() {
                let code = zp as f32 + v / scale;
                if code <= qmin || code >= qmax {
                    continue;
                }
                prop_assert!(
                    (back.data()[i] - v).abs() <= scale * 1.0001,
                    "value {} came back as {} (scale {})", v, back.data()[i], scale
                );
            }
        }

        /// Codes are integers inside the representable range
        #[test]
        fn prop_codes_are_integral_and_bounded(
            values in prop::collection::vec(-1e4f32..1e4, 1..64),
            scale in 1e-3f32..10.0,
            zp in 0i32..256,
        ) {
            let x = Tensor::new(values.clone(), &[values.len()]);
            let q = quantize_tensor(&x, scale, zp as f32, 8, false);
            for &c in q.data().iter() {
                prop_assert_eq!(c, c.round());
                prop_assert!((0.0..=255.0).contains(&c));
            }
        }
    }
}
