use super::{
    bind_role, bound, integer_params, observe, owned_slot, requantize, LayerState, QModule,
};
use crate::error::{QParamRole, Result};
use crate::nn::Conv2d;
use crate::quantization::{FakeQuantize, QParam, QuantConfig, SharedQParam};
use crate::Tensor;

/// Quantization-aware 2D convolution.
#[derive(Debug)]
pub struct QConv2d {
    conv: Conv2d,
    qi: Option<SharedQParam>,
    qw: QParam,
    qo: Option<SharedQParam>,
    config: QuantConfig,
    state: LayerState,
}

impl QConv2d {
    /// Wrap `conv`. `with_qi`/`with_qo` decide which QParams this layer owns;
    /// the missing ones must be supplied to `freeze`.
    pub fn new(conv: Conv2d, config: QuantConfig, with_qi: bool, with_qo: bool) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            qi: owned_slot(with_qi, &config),
            qw: QParam::from_config(&config),
            qo: owned_slot(with_qo, &config),
            conv,
            config,
            state: LayerState::Observing,
        })
    }

    /// The wrapped convolution. After freeze its weight and bias hold
    /// integer codes.
    pub fn conv(&self) -> &Conv2d {
        &self.conv
    }

    pub fn qw(&self) -> &QParam {
        &self.qw
    }
}

impl QModule for QConv2d {
    fn name(&self) -> &'static str {
        "conv2d"
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        self.state.expect_observing("forward")?;
        let x = observe(self.qi.as_ref(), x)?;

        self.qw.update(&self.conv.weight)?;
        let weight = FakeQuantize::apply(&self.conv.weight, &self.qw)?;
        let y = x.conv2d(&weight, self.conv.bias.as_ref(), self.conv.geometry);

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
            &self.conv.weight,
            self.conv.bias.as_ref(),
            &self.config,
        )?;

        qi.freeze();
        qo.freeze();
        self.qw.freeze();
        self.qi = Some(qi);
        self.qo = Some(qo);
        self.conv.weight = params.weight;
        self.conv.bias = params.bias;
        self.state = LayerState::Frozen { multiplier: params.multiplier };
        Ok(())
    }

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
