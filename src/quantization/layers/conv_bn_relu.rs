//! Conv + BatchNorm + ReLU fused into one quantized convolution.
//!
//! The batchnorm is folded into the convolution's weight and bias before the
//! weight is fake-quantized, so calibration sees the same weight that integer
//! inference will use. ReLU is applied after folding and before the output
//! QParam observes, which lets the output range start at zero.

use super::{
    bind_role, bound, integer_params, observe, owned_slot, requantize, LayerState, QModule,
};
use crate::error::{QParamRole, QuantError, Result};
use crate::nn::{BatchNorm2d, Conv2d};
use crate::quantization::{FakeQuantize, QParam, QuantConfig, SharedQParam};
use crate::Tensor;

/// Fold `bn` with explicit statistics into `(weight, bias)`.
///
/// `w' = w * gamma / std` per output channel and
/// `b' = gamma / std * (b - mean) + beta`. A non-affine batchnorm uses
/// `gamma = 1, beta = 0`; a missing conv bias counts as zero. Gradients flow
/// to `weight`, `bias`, `gamma` and `beta`; `mean`/`std` are constants.
pub fn fold_batch_norm(
    weight: &Tensor,
    bias: Option<&Tensor>,
    bn: &BatchNorm2d,
    mean: &[f32],
    std: &[f32],
) -> (Tensor, Tensor) {
    let c = bn.num_features();
    let inv_std = Tensor::new(std.iter().map(|s| 1.0 / s).collect(), &[c]);
    let factor = match &bn.weight {
        Some(gamma) => gamma * &inv_std,
        None => inv_std,
    };

    let folded_weight = weight.scale_rows(&factor);

    let mean = Tensor::new(mean.to_vec(), &[c]);
    let centered = match bias {
        Some(b) => b - &mean,
        None => mean.mul_scalar(-1.0),
    };
    let scaled = &factor * &centered;
    let folded_bias = match &bn.bias {
        Some(beta) => &scaled + beta,
        None => scaled,
    };

    (folded_weight, folded_bias)
}

/// Quantization-aware fused Conv2d -> BatchNorm2d -> ReLU.
#[derive(Debug)]
pub struct QConvBnReLU {
    conv: Conv2d,
    bn: BatchNorm2d,
    qi: Option<SharedQParam>,
    qw: QParam,
    qo: Option<SharedQParam>,
    config: QuantConfig,
    state: LayerState,
}

impl QConvBnReLU {
    pub fn new(
        conv: Conv2d,
        bn: BatchNorm2d,
        config: QuantConfig,
        with_qi: bool,
        with_qo: bool,
    ) -> Result<Self> {
        config.validate()?;
        if conv.out_channels() != bn.num_features() {
            return Err(QuantError::InvalidConfig {
                field: "bn",
                message: format!(
                    "{} batchnorm channels do not match {} conv output channels",
                    bn.num_features(),
                    conv.out_channels()
                ),
            });
        }
        Ok(Self {
            qi: owned_slot(with_qi, &config),
            qw: QParam::from_config(&config),
            qo: owned_slot(with_qo, &config),
            conv,
            bn,
            config,
            state: LayerState::Observing,
        })
    }

    /// Fold with per-batch statistics and update the running ones.
    pub fn train(&mut self) {
        self.bn.train();
    }

    /// Fold with the running statistics.
    pub fn eval(&mut self) {
        self.bn.eval();
    }

    pub fn is_training(&self) -> bool {
        self.bn.is_training()
    }

    pub fn conv(&self) -> &Conv2d {
        &self.conv
    }

    pub fn bn(&self) -> &BatchNorm2d {
        &self.bn
    }

    pub fn qw(&self) -> &QParam {
        &self.qw
    }

    fn running_stats(&self) -> (Vec<f32>, Vec<f32>) {
        let mean = self.bn.running_mean.to_vec();
        let std = self.bn.std_of(&self.bn.running_var.data());
        (mean, std)
    }

    fn fold(&self, mean: &[f32], std: &[f32]) -> (Tensor, Tensor) {
        fold_batch_norm(&self.conv.weight, self.conv.bias.as_ref(), &self.bn, mean, std)
    }
}

impl QModule for QConvBnReLU {
    fn name(&self) -> &'static str {
        "conv_bn_relu"
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        self.state.expect_observing("forward")?;
        let x = observe(self.qi.as_ref(), x)?;

        let (mean, std) = if self.bn.is_training() {
            let raw = x.detach().conv2d(
                &self.conv.weight.detach(),
                self.conv.bias.as_ref().map(Tensor::detach).as_ref(),
                self.conv.geometry,
            );
            let (mean, var) = raw.channel_mean_var();
            self.bn.update_running_stats(&mean, &var);
            let std = self.bn.std_of(&var);
            (mean, std)
        } else {
            self.running_stats()
        };

        let (weight, bias) = self.fold(&mean, &std);
        self.qw.update(&weight)?;
        let weight = FakeQuantize::apply(&weight, &self.qw)?;
        let y = x.conv2d(&weight, Some(&bias), self.conv.geometry).relu();

        observe(self.qo.as_ref(), &y)
    }

    fn freeze(&mut self, qi: Option<SharedQParam>, qo: Option<SharedQParam>) -> Result<()> {
        self.state.expect_observing("freeze")?;
        let qi = bind_role(QParamRole::Input, self.qi.as_ref(), qi)?;
        let qo = bind_role(QParamRole::Output, self.qo.as_ref(), qo)?;

        let (mean, std) = self.running_stats();
        let (weight, bias) = self.fold(&mean, &std);
        let params = integer_params(
            self.name(),
            &qi,
            &qo,
            &self.qw,
            &weight,
            Some(&bias),
            &self.config,
        )?;

        qi.freeze();
        qo.freeze();
        self.qw.freeze();
        self.qi = Some(qi);
        self.qo = Some(qo);
        self.conv.weight = params.weight;
        self.conv.bias = params.bias;
        self.bn.eval();
        self.state = LayerState::Frozen { multiplier: params.multiplier };
        Ok(())
    }

    /// Integer conv with the folded weights. The ReLU is implicit: codes
    /// below `zp_out` cannot occur because `qo` observed non-negative values.
    fn quantize_inference(&self, x: &Tensor) -> Result<Tensor> {
        let multiplier = self.state.expect_frozen("quantize_inference")?;
        let zi = bound(&self.qi, QParamRole::Input)?.zero_point()?;
        let zo = bound(&self.qo, QParamRole::Output)?.zero_point()?;

        let x = x.add_scalar(-(zi as f32));
        let acc = x.conv2d(&self.conv.weight, self.conv.bias.as_ref(), self.conv.geometry);
        Ok(requantize(&acc, multiplier, zo, self.config.num_bits))
    }

    fn qi(&self) -> Option<SharedQParam> {
        self.qi.clone()
    }

    fn qo(&self) -> Option<SharedQParam> {
        self.qo.clone()
    }

    fn state(&self) -> LayerState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv::ConvGeometry;
    use crate::nn::Module;
    use crate::Tape;
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn seeded_bn(channels: usize) -> BatchNorm2d {
        let bn = BatchNorm2d::new(channels);
        *bn.running_mean.data_mut() = vec![0.3, -0.2];
        *bn.running_var.data_mut() = vec![1.5, 0.4];
        if let Some(gamma) = &bn.weight {
            *gamma.data_mut() = vec![0.8, 1.3];
        }
        if let Some(beta) = &bn.bias {
            *beta.data_mut() = vec![0.1, -0.05];
        }
        bn
    }

    #[test]
    fn test_channel_mismatch_is_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let conv = Conv2d::new_with(&mut rng, 1, 3, (3, 3), ConvGeometry::default(), true);
        let err = QConvBnReLU::new(conv, BatchNorm2d::new(2), QuantConfig::default(), true, true).unwrap_err();
        assert!(matches!(err, QuantError::InvalidConfig { field: "bn", .. }));
    }

    #[test]
    fn test_fold_matches_conv_then_batchnorm() {
        let mut rng = StdRng::seed_from_u64(5);
        let conv = Conv2d::new_with(&mut rng, 3, 2, (3, 3), ConvGeometry::default(), true);
        let mut bn = seeded_bn(2);
        bn.eval();
        let x = Tensor::randn_with(&mut rng, &[2, 3, 5, 5]);

        let reference = bn.forward(&conv.forward(&x));
        let mean = bn.running_mean.to_vec();
        let std = bn.std_of(&bn.running_var.data());
        let (w, b) = fold_batch_norm(&conv.weight, conv.bias.as_ref(), &bn, &mean, &std);
        let folded = x.conv2d(&w, Some(&b), conv.geometry);

        for (&r, &f) in reference.data().iter().zip(folded.data().iter()) {
            assert_abs_diff_eq!(r, f, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_fold_without_affine_or_bias() {
        let weight = Tensor::full(&[2, 1, 1, 1], 2.0);
        let bn = BatchNorm2d::new(2).with_affine(false);
        let (w, b) = fold_batch_norm(&weight, None, &bn, &[1.0, -1.0], &[2.0, 4.0]);
        assert_eq!(w.to_vec(), vec![1.0, 0.5]);
        assert_eq!(b.to_vec(), vec![-0.5, 0.25]);
    }

    #[test]
    fn test_training_forward_updates_running_stats() {
        let mut rng = StdRng::seed_from_u64(8);
        let conv = Conv2d::new_with(&mut rng, 1, 2, (3, 3), ConvGeometry::default().with_padding((1, 1)), true);
        let bn = BatchNorm2d::new(2).with_momentum(0.5);
        let mut layer = QConvBnReLU::new(conv, bn, QuantConfig::default(), true, true).unwrap();
        assert!(layer.is_training());

        let x = Tensor::randn_with(&mut rng, &[4, 1, 6, 6]);
        let expected_mean = {
            let fq = FakeQuantize::apply(&x, &{
                let mut q = QParam::new(8);
                q.update(&x).unwrap();
                q
            })
            .unwrap();
            let raw = fq.conv2d(&layer.conv().weight, layer.conv().bias.as_ref(), layer.conv().geometry);
            raw.channel_mean_var().0
        };

        let y = layer.forward(&x).unwrap();
        assert!(y.data().iter().all(|&v| v >= -1e-6));
        for (&running, &batch) in layer.bn().running_mean.data().iter().zip(&expected_mean) {
            assert_abs_diff_eq!(running, 0.5 * batch, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_gradients_reach_conv_and_batchnorm_parameters() {
        Tape::reset();
        let mut rng = StdRng::seed_from_u64(13);
        let conv = Conv2d::new_with(&mut rng, 1, 2, (2, 2), ConvGeometry::default(), true);
        let mut layer = QConvBnReLU::new(conv, BatchNorm2d::new(2), QuantConfig::default(), true, true).unwrap();

        let x = Tensor::randn_with(&mut rng, &[2, 1, 4, 4]);
        layer.forward(&x).unwrap().sum().backward();

        assert!(layer.conv().weight.grad().is_some());
        assert!(layer.conv().bias.as_ref().unwrap().grad().is_some());
        assert!(layer.bn().weight.as_ref().unwrap().grad().is_some());
        assert!(layer.bn().bias.as_ref().unwrap().grad().is_some());
    }

    #[test]
    fn test_freeze_folds_running_stats() {
        let mut rng = StdRng::seed_from_u64(2);
        let conv = Conv2d::new_with(&mut rng, 3, 2, (3, 3), ConvGeometry::default(), false);
        let mut layer = QConvBnReLU::new(conv, seeded_bn(2), QuantConfig::default(), true, true).unwrap();
        layer.eval();
        layer.forward(&Tensor::randn_with(&mut rng, &[2, 3, 5, 5])).unwrap();
        layer.freeze(None, None).unwrap();

        assert!(layer.is_frozen());
        let bias = layer.conv().bias.as_ref().expect("folding always yields a bias");
        assert_eq!(bias.shape(), &[2]);
        assert!(bias.data().iter().all(|b| *b == b.round()));
    }
}
