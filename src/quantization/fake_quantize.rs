//! Fake quantization for quantization-aware calibration
//!
//! Simulates the quantize -> dequantize round trip in the forward pass while
//! staying differentiable through a clipped straight-through estimator.

use super::affine::quant_range;
use super::qparam::QParam;
use crate::error::Result;
use crate::ops::accumulate_grad;
use crate::tape::Tape;
use crate::Tensor;

/// Stateless fake-quantize operator; all parameters come from a [`QParam`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeQuantize;

impl FakeQuantize {
    /// `dequantize(quantize(x))` using `qparam`'s current scale and zero point.
    ///
    /// Backward passes `dL/dy` through unchanged for elements whose code
    /// `zero_point + x / scale` fell inside `[qmin, qmax]` and zeroes the rest.
    pub fn apply(x: &Tensor, qparam: &QParam) -> Result<Tensor> {
        let scale = qparam.scale()?;
        let zp = qparam.zero_point()? as f32;
        let (qmin, qmax) = quant_range(qparam.num_bits(), false);

        let result: Vec<f32> = x
            .data()
            .iter()
            .map(|&v| {
                let q = (zp + v / scale).clamp(qmin, qmax).round_ties_even();
                scale * (q - zp)
            })
            .collect();
        let mut output = Tensor::new(result, x.shape());

        if x.requires_grad {
            output.requires_grad = true;
            let input = x.clone();
            let out = output.clone();

            Tape::push_unary_op(x, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let gin: Vec<f32> = gout
                        .iter()
                        .zip(input.data().iter())
                        .map(|(&g, &v)| {
                            let code = zp + v / scale;
                            if (qmin..=qmax).contains(&code) {
                                g
                            } else {
                                0.0
                            }
                        })
                        .collect();
                    accumulate_grad(&input, &gin);
                }
            });
        }

        Ok(output)
    }
}
