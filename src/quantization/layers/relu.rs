use super::{bind_role, bound, observe, owned_slot, LayerState, QModule};
use crate::error::{QParamRole, QuantError, Result};
use crate::quantization::{QuantConfig, SharedQParam};
use crate::Tensor;

/// Quantization-aware ReLU.
///
/// ReLU does not widen the range, so the output shares the input's QParam and
/// inference only has to lift codes below the zero point up to it.
#[derive(Debug)]
pub struct QReLU {
    qi: Option<SharedQParam>,
    state: LayerState,
}

impl QReLU {
    pub fn new(config: QuantConfig, with_qi: bool) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            qi: owned_slot(with_qi, &config),
            state: LayerState::Observing,
        })
    }
}

impl QModule for QReLU {
    fn name(&self) -> &'static str {
        "relu"
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        self.state.expect_observing("forward")?;
        Ok(observe(self.qi.as_ref(), x)?.relu())
    }

    fn freeze(&mut self, qi: Option<SharedQParam>, qo: Option<SharedQParam>) -> Result<()> {
        self.state.expect_observing("freeze")?;
        if qo.is_some() {
            return Err(QuantError::UnexpectedQParam { role: QParamRole::Output });
        }
        let qi = bind_role(QParamRole::Input, self.qi.as_ref(), qi)?;
        let zi = qi.zero_point()?;
        tracing::debug!(layer = self.name(), zp_in = zi, "freezing layer");

        qi.freeze();
        self.qi = Some(qi);
        self.state = LayerState::Frozen { multiplier: 1.0 };
        Ok(())
    }

    fn quantize_inference(&self, x: &Tensor) -> Result<Tensor> {
        self.state.expect_frozen("quantize_inference")?;
        let zi = bound(&self.qi, QParamRole::Input)?.zero_point()? as f32;
        Ok(x.map(|v| v.max(zi)))
    }

    fn qi(&self) -> Option<SharedQParam> {
        self.qi.clone()
    }

    fn qo(&self) -> Option<SharedQParam> {
        self.qi.clone()
    }

    fn state(&self) -> LayerState {
        self.state
    }
}
