pub mod conv;
pub mod error;
pub mod nn;
pub mod ops;
pub mod quantization;
pub mod tape;
pub mod tensor;

pub use conv::ConvGeometry;
pub use error::{QParamRole, QuantError, Result};
pub use quantization::{
    FakeQuantize, LayerState, QConv2d, QConvBnReLU, QLayer, QLinear, QMaxPool2d, QModule, QParam, QReLU,
    QuantConfig, SharedQParam,
};
pub use tape::Tape;
pub use tensor::Tensor;
