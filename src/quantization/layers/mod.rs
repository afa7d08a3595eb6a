//! Quantizable layers
//!
//! Every layer goes through the same lifecycle:
//!
//! 1. **Observing**: `forward` runs the float operator with fake-quantized
//!    input, weight and output while the QParams record activation ranges.
//! 2. **Frozen**: `freeze` fixes the QParams, binds any QParam handed over by
//!    the neighbouring layer, rewrites weight and bias as integer codes and
//!    computes the requantization multiplier `M = s_w * s_i / s_o`.
//!    `quantize_inference` then maps integer codes to integer codes.
//!
//! Layers must be frozen in execution order so each downstream `qi` can be
//! the upstream `qo` handle.

mod conv;
mod conv_bn_relu;
mod linear;
mod max_pool;
mod relu;

pub use conv::QConv2d;
pub use conv_bn_relu::{fold_batch_norm, QConvBnReLU};
pub use linear::QLinear;
pub use max_pool::QMaxPool2d;
pub use relu::QReLU;

use super::affine::{quant_range, quantize_tensor};
use super::config::QuantConfig;
use super::fake_quantize::FakeQuantize;
use super::qparam::{QParam, SharedQParam};
use crate::error::{QParamRole, QuantError, Result};
use crate::Tensor;

/// Where a layer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayerState {
    Observing,
    /// `multiplier` is `M`; layers without weights pass codes through
    /// unscaled and report `1.0`.
    Frozen { multiplier: f32 },
}

impl LayerState {
    pub fn name(&self) -> &'static str {
        match self {
            LayerState::Observing => "observing",
            LayerState::Frozen { .. } => "frozen",
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self, LayerState::Frozen { .. })
    }

    pub fn multiplier(&self) -> Option<f32> {
        match *self {
            LayerState::Frozen { multiplier } => Some(multiplier),
            LayerState::Observing => None,
        }
    }

    pub(crate) fn expect_observing(&self, op: &'static str) -> Result<()> {
        match self {
            LayerState::Observing => Ok(()),
            LayerState::Frozen { .. } => Err(QuantError::InvalidState { op, state: self.name() }),
        }
    }

    pub(crate) fn expect_frozen(&self, op: &'static str) -> Result<f32> {
        self.multiplier()
            .ok_or(QuantError::InvalidState { op, state: self.name() })
    }
}

/// Lifecycle shared by every quantizable layer.
pub trait QModule {
    /// Short operator name used in logs and reports.
    fn name(&self) -> &'static str;

    /// Observe-mode forward pass. Updates the layer's QParams.
    fn forward(&mut self, x: &Tensor) -> Result<Tensor>;

    /// Switch to integer inference.
    ///
    /// For each of `qi`/`qo`, exactly one of "owned since construction" and
    /// "supplied here" must hold. On error nothing has changed.
    fn freeze(&mut self, qi: Option<SharedQParam>, qo: Option<SharedQParam>) -> Result<()>;

    /// Integer codes in, integer codes out.
    fn quantize_inference(&self, x: &Tensor) -> Result<Tensor>;

    /// Input QParam handle, if owned or bound.
    fn qi(&self) -> Option<SharedQParam>;

    /// Output QParam handle, if owned or bound. This is what the next layer
    /// receives as its `qi`.
    fn qo(&self) -> Option<SharedQParam>;

    fn state(&self) -> LayerState;

    fn is_frozen(&self) -> bool {
        self.state().is_frozen()
    }

    fn multiplier(&self) -> Option<f32> {
        self.state().multiplier()
    }
}

/// Closed set of quantizable layers.
pub enum QLayer {
    Conv(QConv2d),
    Linear(QLinear),
    ReLU(QReLU),
    MaxPool(QMaxPool2d),
    ConvBnReLU(QConvBnReLU),
}

macro_rules! delegate {
    ($self:expr, $layer:ident => $body:expr) => {
        match $self {
            QLayer::Conv($layer) => $body,
            QLayer::Linear($layer) => $body,
            QLayer::ReLU($layer) => $body,
            QLayer::MaxPool($layer) => $body,
            QLayer::ConvBnReLU($layer) => $body,
        }
    };
}

impl QModule for QLayer {
    fn name(&self) -> &'static str {
        delegate!(self, l => l.name())
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        delegate!(self, l => l.forward(x))
    }

    fn freeze(&mut self, qi: Option<SharedQParam>, qo: Option<SharedQParam>) -> Result<()> {
        delegate!(self, l => l.freeze(qi, qo))
    }

    fn quantize_inference(&self, x: &Tensor) -> Result<Tensor> {
        delegate!(self, l => l.quantize_inference(x))
    }

    fn qi(&self) -> Option<SharedQParam> {
        delegate!(self, l => l.qi())
    }

    fn qo(&self) -> Option<SharedQParam> {
        delegate!(self, l => l.qo())
    }

    fn state(&self) -> LayerState {
        delegate!(self, l => l.state())
    }
}

macro_rules! impl_from_layer {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for QLayer {
            fn from(layer: $ty) -> Self {
                QLayer::$variant(layer)
            }
        }
    };
}

impl_from_layer!(Conv, QConv2d);
impl_from_layer!(Linear, QLinear);
impl_from_layer!(ReLU, QReLU);
impl_from_layer!(MaxPool, QMaxPool2d);
impl_from_layer!(ConvBnReLU, QConvBnReLU);

/// Fresh owned QParam slot when `present`.
pub(crate) fn owned_slot(present: bool, config: &QuantConfig) -> Option<SharedQParam> {
    present.then(|| SharedQParam::new(QParam::from_config(config)))
}

/// Resolve the handle a role will use after freeze.
pub(crate) fn bind_role(
    role: QParamRole,
    owned: Option<&SharedQParam>,
    supplied: Option<SharedQParam>,
) -> Result<SharedQParam> {
    match (owned, supplied) {
        (Some(_), Some(_)) => Err(QuantError::QParamConflict { role }),
        (None, None) => Err(QuantError::QParamMissing { role }),
        (Some(own), None) => Ok(own.clone()),
        (None, Some(given)) => Ok(given),
    }
}

/// Handle bound to `role` on a frozen layer.
pub(crate) fn bound(slot: &Option<SharedQParam>, role: QParamRole) -> Result<&SharedQParam> {
    slot.as_ref().ok_or(QuantError::QParamMissing { role })
}

/// Update `qparam` from `x` and fake-quantize it; identity without a QParam.
pub(crate) fn observe(qparam: Option<&SharedQParam>, x: &Tensor) -> Result<Tensor> {
    match qparam {
        Some(q) => {
            q.update(x)?;
            FakeQuantize::apply(x, &q.borrow())
        }
        None => Ok(x.clone()),
    }
}

/// Integer weight, bias and multiplier of a frozen weighted layer.
pub(crate) struct IntegerParams {
    pub multiplier: f32,
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

/// Requantize float weight and bias against bound input/output QParams.
///
/// `weight -> quantize(w) - zp_w`, `bias -> quantize(b, s_i * s_w, 0)` with
/// signed `bias_bits` codes. Reads only; the caller commits the result.
pub(crate) fn integer_params(
    layer: &'static str,
    qi: &SharedQParam,
    qo: &SharedQParam,
    qw: &QParam,
    weight: &Tensor,
    bias: Option<&Tensor>,
    config: &QuantConfig,
) -> Result<IntegerParams> {
    let (si, zi) = (qi.scale()?, qi.zero_point()?);
    let (so, zo) = (qo.scale()?, qo.zero_point()?);
    let (sw, zw) = (qw.scale()?, qw.zero_point()?);
    let multiplier = sw * si / so;

    let weight = qw.quantize_tensor(weight)?.add_scalar(-(zw as f32));
    let bias = bias.map(|b| quantize_tensor(b, si * sw, 0.0, config.bias_bits, true));

    tracing::debug!(
        layer,
        scale_in = si,
        zp_in = zi,
        scale_w = sw,
        zp_w = zw,
        scale_out = so,
        zp_out = zo,
        multiplier,
        "freezing layer"
    );
    Ok(IntegerParams { multiplier, weight, bias })
}

/// `clamp(round(M * acc) + zp_out, 0, qmax)`, rounded.
pub(crate) fn requantize(acc: &Tensor, multiplier: f32, zp_out: i32, num_bits: u32) -> Tensor {
    let (qmin, qmax) = quant_range(num_bits, false);
    let zp = zp_out as f32;
    acc.map(|v| ((multiplier * v).round_ties_even() + zp).clamp(qmin, qmax).round_ties_even())
}
