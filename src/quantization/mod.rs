//! Quantization-aware simulation
//!
//! Layers observe activation ranges in a float forward pass (with fake
//! quantization in the loop), then freeze into integer-only inference that
//! reproduces the float results to within a code or two.

pub mod affine;
pub mod config;
pub mod fake_quantize;
pub mod layers;
pub mod qparam;
pub mod search;

pub use affine::{calc_scale_zero_point, dequantize_tensor, quant_range, quantize_tensor};
pub use config::QuantConfig;
pub use fake_quantize::FakeQuantize;
pub use layers::{
    fold_batch_norm, LayerState, QConv2d, QConvBnReLU, QLayer, QLinear, QMaxPool2d, QModule, QReLU,
};
pub use qparam::{QParam, SharedQParam};
pub use search::{search_shift_multiplier, ShiftMultiplier, DEFAULT_PROBE};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv::ConvGeometry;
    use crate::nn::{Conv2d, MaxPool2d};
    use crate::Tensor;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_layers_wrap_into_closed_enum() {
        let config = QuantConfig::default();
        let conv = Conv2d::new_with(&mut StdRng::seed_from_u64(0), 1, 1, (1, 1), ConvGeometry::default(), true);
        let mut layers: Vec<QLayer> = vec![
            QConv2d::new(conv, config.clone(), true, true).unwrap().into(),
            QReLU::new(config.clone(), false).unwrap().into(),
            QMaxPool2d::new(MaxPool2d::new(2, 2, 0), config, false).unwrap().into(),
        ];

        let x = Tensor::new(vec![0.1, -0.4, 0.9, 0.3], &[1, 1, 2, 2]);
        let y = layers
            .iter_mut()
            .try_fold(x, |x, layer| layer.forward(&x))
            .unwrap();
        assert_eq!(y.shape(), &[1, 1, 1, 1]);

        let names: Vec<_> = layers.iter().map(|l| l.name()).collect();
        assert_eq!(names, ["conv2d", "relu", "max_pool2d"]);
        assert!(layers.iter().all(|l| !l.is_frozen()));
    }
}
