//! Observed quantization parameters
//!
//! A [`QParam`] accumulates the running min/max of everything it observes and
//! derives the affine `(scale, zero_point)` mapping for one tensor role. Input
//! and output QParams can be handed between adjacent layers through a
//! [`SharedQParam`] so the producer and the consumer read one object.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use super::affine::{calc_scale_zero_point, dequantize_tensor, quant_range, quantize_tensor};
use super::config::{check_num_bits, QuantConfig};
use crate::error::{QuantError, Result};
use crate::Tensor;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Affine {
    scale: f32,
    zero_point: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QParam {
    num_bits: u32,
    min_range: f32,
    min: Option<f32>,
    max: Option<f32>,
    affine: Option<Affine>,
    frozen: bool,
}

impl QParam {
    /// `num_bits` must lie in `2..=16`; anything else is reported by the
    /// first [`update`](Self::update).
    pub fn new(num_bits: u32) -> Self {
        Self {
            num_bits,
            min_range: QuantConfig::default().min_range,
            min: None,
            max: None,
            affine: None,
            frozen: false,
        }
    }

    pub fn from_config(config: &QuantConfig) -> Self {
        Self::new(config.num_bits).with_min_range(config.min_range)
    }

    pub fn with_min_range(mut self, min_range: f32) -> Self {
        self.min_range = min_range;
        self
    }

    /// Extend the observed range with `tensor` and re-derive scale/zero point.
    ///
    /// Ranges narrower than `min_range` (a constant first batch, say) are
    /// widened upwards for the derivation only; `min()`/`max()` keep what was
    /// actually seen. Far from zero the widening grows with `|min|` so it
    /// survives f32 rounding.
    pub fn update(&mut self, tensor: &Tensor) -> Result<()> {
        if self.frozen {
            return Err(QuantError::QParamFrozen);
        }
        check_num_bits(self.num_bits)?;
        let (t_min, t_max) = match (tensor.min(), tensor.max()) {
            (Some(lo), Some(hi)) => (lo, hi),
            _ => return Err(QuantError::EmptyTensor),
        };

        let min = self.min.map_or(t_min, |m| m.min(t_min));
        let max = self.max.map_or(t_max, |m| m.max(t_max));
        let widen = self.min_range.max(min.abs() * f32::EPSILON * 2.0);
        let effective_max = max.max(min + widen);
        let (scale, zero_point) = calc_scale_zero_point(min, effective_max, self.num_bits)?;

        self.min = Some(min);
        self.max = Some(max);
        self.affine = Some(Affine { scale, zero_point });
        tracing::trace!(min, max, scale, zero_point, "qparam updated");
        Ok(())
    }

    fn affine(&self) -> Result<Affine> {
        self.affine.ok_or(QuantError::Uninitialized)
    }

    pub fn scale(&self) -> Result<f32> {
        Ok(self.affine()?.scale)
    }

    pub fn zero_point(&self) -> Result<i32> {
        Ok(self.affine()?.zero_point)
    }

    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    pub fn min(&self) -> Option<f32> {
        self.min
    }

    pub fn max(&self) -> Option<f32> {
        self.max
    }

    pub fn qmin(&self) -> f32 {
        quant_range(self.num_bits, false).0
    }

    pub fn qmax(&self) -> f32 {
        quant_range(self.num_bits, false).1
    }

    pub fn is_initialized(&self) -> bool {
        self.affine.is_some()
    }

    /// Stop accepting updates. Scale and zero point are fixed from here on.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn quantize_tensor(&self, tensor: &Tensor) -> Result<Tensor> {
        let Affine { scale, zero_point } = self.affine()?;
        Ok(quantize_tensor(tensor, scale, zero_point as f32, self.num_bits, false))
    }

    pub fn dequantize_tensor(&self, q: &Tensor) -> Result<Tensor> {
        let Affine { scale, zero_point } = self.affine()?;
        Ok(dequantize_tensor(q, scale, zero_point as f32))
    }
}

impl fmt::Display for QParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.affine, self.min, self.max) {
            (Some(a), Some(min), Some(max)) => write!(
                f,
                "scale: {:.10} zp: {} min: {:.6} max: {:.6}",
                a.scale, a.zero_point, min, max
            ),
            _ => write!(f, "uninitialized (num_bits={})", self.num_bits),
        }
    }
}

/// Shared handle to a [`QParam`].
///
/// Cloning the handle shares the parameter; this is how a layer's output
/// QParam becomes the next layer's input QParam at freeze time. The producing
/// layer is the only writer.
#[derive(Debug, Clone)]
pub struct SharedQParam(Rc<RefCell<QParam>>);

impl SharedQParam {
    pub fn new(qparam: QParam) -> Self {
        Self(Rc::new(RefCell::new(qparam)))
    }

    pub fn borrow(&self) -> Ref<'_, QParam> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, QParam> {
        self.0.borrow_mut()
    }

    /// Whether both handles point at the same QParam.
    pub fn ptr_eq(&self, other: &SharedQParam) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn update(&self, tensor: &Tensor) -> Result<()> {
        self.0.borrow_mut().update(tensor)
    }

    pub fn scale(&self) -> Result<f32> {
        self.0.borrow().scale()
    }

    pub fn zero_point(&self) -> Result<i32> {
        self.0.borrow().zero_point()
    }

    pub fn freeze(&self) {
        self.0.borrow_mut().freeze();
    }
}

impl From<QParam> for SharedQParam {
    fn from(qparam: QParam) -> Self {
        SharedQParam::new(qparam)
    }
}

impl fmt::Display for SharedQParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.borrow().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn first_update_initializes_range() {
        let mut q = QParam::new(8);
        assert!(!q.is_initialized());
        q.update(&Tensor::new(vec![-1.0, 0.5, 1.0], &[3])).unwrap();
        assert_eq!(q.min(), Some(-1.0));
        assert_eq!(q.max(), Some(1.0));
        assert_abs_diff_eq!(q.scale().unwrap(), 2.0 / 255.0, epsilon = 1e-9);
    }

    #[test]
    fn updates_only_widen() {
        let mut q = QParam::new(8);
        q.update(&Tensor::new(vec![-1.0, 1.0], &[2])).unwrap();
        q.update(&Tensor::new(vec![-0.5, 0.5], &[2])).unwrap();
        assert_eq!((q.min(), q.max()), (Some(-1.0), Some(1.0)));
        q.update(&Tensor::new(vec![3.0], &[1])).unwrap();
        assert_eq!((q.min(), q.max()), (Some(-1.0), Some(3.0)));
        assert_abs_diff_eq!(q.scale().unwrap(), 4.0 / 255.0, epsilon = 1e-9);
    }

    #[test]
    fn uninitialized_use_fails_fast() {
        let q = QParam::new(8);
        let t = Tensor::new(vec![1.0], &[1]);
        assert_eq!(q.quantize_tensor(&t).unwrap_err(), QuantError::Uninitialized);
        assert_eq!(q.dequantize_tensor(&t).unwrap_err(), QuantError::Uninitialized);
        assert_eq!(q.scale().unwrap_err(), QuantError::Uninitialized);
    }

    #[test]
    fn constant_tensor_gets_minimum_range() {
        let mut q = QParam::new(8).with_min_range(1e-3);
        q.update(&Tensor::full(&[4], 0.0)).unwrap();
        assert_eq!((q.min(), q.max()), (Some(0.0), Some(0.0)));
        assert_abs_diff_eq!(q.scale().unwrap(), 1e-3 / 255.0, epsilon = 1e-12);
        assert_eq!(q.zero_point().unwrap(), 0);
    }

    #[test]
    fn constant_batches_far_from_zero_still_calibrate() {
        for v in [0.0, 32.0, 255.0, 1e6, -1e6] {
            let mut q = QParam::new(8);
            q.update(&Tensor::full(&[4], v)).unwrap();
            assert_eq!((q.min(), q.max()), (Some(v), Some(v)));
            let scale = q.scale().unwrap();
            assert!(scale.is_finite() && scale > 0.0, "scale {scale} for constant {v}");
            assert!((0..=255).contains(&q.zero_point().unwrap()));
        }
    }

    #[test]
    fn bit_width_outside_supported_range_is_rejected() {
        let t = Tensor::new(vec![0.0, 1.0], &[2]);
        for bits in [0, 1, 17] {
            let mut q = QParam::new(bits);
            let err = q.update(&t).unwrap_err();
            assert!(matches!(err, QuantError::InvalidConfig { field: "num_bits", .. }));
            assert!(!q.is_initialized());
        }
    }

    #[test]
    fn empty_and_frozen_updates_fail() {
        let mut q = QParam::new(8);
        assert_eq!(q.update(&Tensor::new(vec![], &[0])), Err(QuantError::EmptyTensor));
        q.update(&Tensor::new(vec![0.0, 1.0], &[2])).unwrap();
        q.freeze();
        let before = q.clone();
        assert_eq!(q.update(&Tensor::new(vec![5.0], &[1])), Err(QuantError::QParamFrozen));
        assert_eq!(q, before);
    }

    #[test]
    fn shared_handle_sees_producer_updates() {
        let producer = SharedQParam::new(QParam::new(8));
        let consumer = producer.clone();
        producer.update(&Tensor::new(vec![0.0, 2.0], &[2])).unwrap();
        assert!(consumer.ptr_eq(&producer));
        assert_eq!(consumer.scale().unwrap(), producer.scale().unwrap());
        assert!(!consumer.ptr_eq(&SharedQParam::new(QParam::new(8))));
    }

    #[test]
    fn display_matches_report_format() {
        let mut q = QParam::new(8);
        assert_eq!(q.to_string(), "uninitialized (num_bits=8)");
        q.update(&Tensor::new(vec![0.0, 1.0], &[2])).unwrap();
        assert_eq!(q.to_string(), "scale: 0.0039215689 zp: 0 min: 0.000000 max: 1.000000");
    }

    proptest! {
        /// min never grows, max never shrinks, scale never shrinks
        #[test]
        fn prop_range_growth_is_monotonic(
            batches in prop::collection::vec(prop::collection::vec(-100.0f32..100.0, 1..16), 1..12),
        ) {
            let mut q = QParam::new(8);
            let mut prev: Option<(f32, f32, f32)> = None;
            for batch in batches {
                q.update(&Tensor::new(batch.clone(), &[batch.len()])).unwrap();
                let cur = (q.min().unwrap(), q.max().unwrap(), q.scale().unwrap());
                if let Some((pmin, pmax, pscale)) = prev {
                    prop_assert!(cur.0 <= pmin);
                    prop_assert!(cur.1 >= pmax);
                    prop_assert!(cur.2 >= pscale);
                }
                let zp = q.zero_point().unwrap();
                prop_assert!((0..=255).contains(&zp));
                prev = Some(cur);
            }
        }
    }
}
