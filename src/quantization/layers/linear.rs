use super::{
    bind_role, bound, integer_params, observe, owned_slot, requantize, LayerState, QModule,
};
use crate::error::{QParamRole, Result};
use crate::nn::Linear;
use crate::quantization::{FakeQuantize, QParam, QuantConfig, SharedQParam};
use crate::Tensor;

/// Quantization-aware fully connected layer over `[batch, features]` input.
#[derive(Debug)]
pub struct QLinear {
    fc: Linear,
    qi: Option<SharedQParam>,
    qw: QParam,
    qo: Option<SharedQParam>,
    config: QuantConfig,
    state: LayerState,
}

impl QLinear {
    pub fn new(fc: Linear, config: QuantConfig, with_qi: bool, with_qo: bool) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            qi: owned_slot(with_qi, &config),
            qw: QParam::from_config(&config),
            qo: owned_slot(with_qo, &config),
            fc,
            config,
            state: LayerState::Observing,
        })
    }

    pub fn linear(&self) -> &Linear {
        &self.fc
    }

    pub fn qw(&self) -> &QParam {
        &self.qw
    }
}

impl QModule for QLinear {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        self.state.expect_observing("forward")?;
        let x = observe(self.qi.as_ref(), x)?;

        self.qw.update(&self.fc.weight)?;
        let weight = FakeQuantize::apply(&self.fc.weight, &self.qw)?;
        let y = x.linear(&weight, self.fc.bias.as_ref());

        observe(self.qo.as_ref(), &y)
    }

    fn freeze(&mut self, qi: Option<SharedQParam>, qo: Option<SharedQParam>) -> Result<()> {
        self.state.expect_observing("freeze")?;
        let qi = bind_role(QParamRole::Input, self.qi.as_ref(), qi)?;
        let qo = bind_role(QParamRole::Output, self.qo.as_ref(), qo)?;
        let params = integer_params(
            self.name(),
            &qi,
            &qo,
            &self.qw,
            &self.fc.weight,
            self.fc.bias.as_ref(),
            &self.config,
        )?;

        qi.freeze();
        qo.freeze();
        self.qw.freeze();
        self.qi = Some(qi);
        self.qo = Some(qo);
        self.fc.weight = params.weight;
        self.fc.bias = params.bias;
        self.state = LayerState::Frozen { multiplier: params.multiplier };
        Ok(())
    }

    fn quantize_inference(&self, x: &Tensor) -> Result<Tensor> {
        let multiplier = self.state.expect_frozen("quantize_inference")?;
        let zi = bound(&self.qi, QParamRole::Input)?.zero_point()?;
        let zo = bound(&self.qo, QParamRole::Output)?.zero_point()?;

        let x = x.add_scalar(-(zi as f32));
        let acc = x.linear(&self.fc.weight, self.fc.bias.as_ref());
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
    use crate::error::QuantError;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_integer_inference_tracks_float_output() {
        let mut rng = StdRng::seed_from_u64(21);
        let fc = Linear::new_with(&mut rng, 6, 3, true);
        let mut layer = QLinear::new(fc, QuantConfig::default(), true, true).unwrap();

        let x = Tensor::uniform_with(&mut rng, &[4, 6], -1.0, 1.0);
        let y = layer.forward(&x).unwrap();
        layer.freeze(None, None).unwrap();

        let qi = layer.qi().unwrap();
        let qo = layer.qo().unwrap();
        let qx = qi.borrow().quantize_tensor(&x).unwrap();
        let qy = layer.quantize_inference(&qx).unwrap();
        let expected = qo.borrow().quantize_tensor(&y).unwrap();

        for (&got, &want) in qy.data().iter().zip(expected.data().iter()) {
            assert!((got - want).abs() <= 2.0, "code {got} vs {want}");
        }
    }

    #[test]
    fn test_supplied_input_qparam_is_bound() {
        let fc = Linear::new_with(&mut StdRng::seed_from_u64(1), 2, 2, false);
        let mut layer = QLinear::new(fc, QuantConfig::default(), false, true).unwrap();
        assert!(layer.qi().is_none());

        layer.forward(&Tensor::new(vec![0.1, 0.9, -0.3, 0.4], &[2, 2])).unwrap();
        assert_eq!(
            layer.freeze(None, None).unwrap_err(),
            QuantError::QParamMissing { role: QParamRole::Input }
        );

        let upstream = SharedQParam::new(QParam::new(8));
        upstream.update(&Tensor::new(vec![-1.0, 1.0], &[2])).unwrap();
        layer.freeze(Some(upstream.clone()), None).unwrap();
        assert!(layer.qi().unwrap().ptr_eq(&upstream));
        assert!(upstream.borrow().is_frozen());
    }
}
