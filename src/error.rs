//! Error types for the quantization lifecycle.

use std::fmt;
use thiserror::Error;

/// Result type alias for quantsim operations.
pub type Result<T> = std::result::Result<T, QuantError>;

/// Which QParam of a layer an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QParamRole {
    Input,
    Weight,
    Output,
}

impl fmt::Display for QParamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QParamRole::Input => "qi",
            QParamRole::Weight => "qw",
            QParamRole::Output => "qo",
        })
    }
}

/// Errors raised by quantization math and the layer lifecycle.
///
/// None of these are transient: each one is a precondition violation that
/// should surface during calibration or while wiring a network.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuantError {
    /// A QParam role is owned by the layer and was also supplied to `freeze`.
    #[error("{role} has been provided at construction; do not pass it to freeze")]
    QParamConflict { role: QParamRole },

    /// A QParam role is neither owned nor supplied to `freeze`.
    #[error("{role} does not exist on this layer and must be provided to freeze")]
    QParamMissing { role: QParamRole },

    /// The layer variant has no such role (e.g. `qo` on ReLU).
    #[error("this layer has no {role}; it must not be provided")]
    UnexpectedQParam { role: QParamRole },

    /// Scale/zero point requested before any observation.
    #[error("quantization parameters are uninitialized; call update() with calibration data first")]
    Uninitialized,

    #[error("degenerate quantization range [{min}, {max}]: max must exceed min and both must be finite")]
    DegenerateRange { min: f32, max: f32 },

    #[error("cannot observe an empty tensor")]
    EmptyTensor,

    #[error("QParam is frozen; update() is not allowed after freeze")]
    QParamFrozen,

    #[error("{op} is not valid while the layer is {state}")]
    InvalidState { op: &'static str, state: &'static str },

    #[error("invalid configuration value for '{field}': {message}")]
    InvalidConfig { field: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_role() {
        let err = QuantError::QParamConflict { role: QParamRole::Input };
        assert_eq!(
            err.to_string(),
            "qi has been provided at construction; do not pass it to freeze"
        );
        let err = QuantError::QParamMissing { role: QParamRole::Output };
        assert!(err.to_string().starts_with("qo does not exist"));
    }
}
