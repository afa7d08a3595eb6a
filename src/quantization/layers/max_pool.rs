use super::{bind_role, observe, owned_slot, LayerState, QModule};
use crate::error::{QParamRole, QuantError, Result};
use crate::nn::MaxPool2d;
use crate::quantization::{QuantConfig, SharedQParam};
use crate::Tensor;

/// Quantization-aware 2D max pooling.
///
/// Max commutes with the monotone affine map, so integer inference pools the
/// codes directly and the output keeps the input's QParam.
#[derive(Debug)]
pub struct QMaxPool2d {
    pool: MaxPool2d,
    qi: Option<SharedQParam>,
    state: LayerState,
}

impl QMaxPool2d {
    pub fn new(pool: MaxPool2d, config: QuantConfig, with_qi: bool) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pool,
            qi: owned_slot(with_qi, &config),
            state: LayerState::Observing,
        })
    }

    fn pool(&self, x: &Tensor) -> Tensor {
        x.max_pool2d(self.pool.kernel_size, self.pool.stride, self.pool.padding)
    }
}

impl QModule for QMaxPool2d {
    fn name(&self) -> &'static str {
        "max_pool2d"
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        self.state.expect_observing("forward")?;
        let x = observe(self.qi.as_ref(), x)?;
        Ok(self.pool(&x))
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
        Ok(self.pool(x))
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
