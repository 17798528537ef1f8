// file: src/error.rs
// description: Error taxonomy for MXFP4 scheme construction, weight loading, and dispatch.
// author: cipher-rc5

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchemeError>;

#[derive(Debug, Error)]
pub enum SchemeError {
    /// A kernel backend or quantizer backend was not resolved by the probe.
    #[error("{package} is required but was not resolved: {hint}")]
    MissingDependency { package: String, hint: String },

    /// Packing or block-size divisibility violated, or a tensor has the wrong shape.
    #[error("invalid shape: {reason}")]
    InvalidShape { reason: String },

    #[error("invalid quantization config: {reason}")]
    InvalidConfig { reason: String },

    /// Native kernel invoked without a resolved binding. Construction-time
    /// validation should make this unreachable.
    #[error("kernel `{kernel}` is not available in this process")]
    KernelUnavailable { kernel: &'static str },

    #[error("layer weights have not been processed after loading")]
    NotFinalized,

    #[error("layer weights were already processed after loading")]
    AlreadyFinalized,

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Safetensors(#[from] safetensors::SafeTensorError),
}

impl SchemeError {
    pub fn shape(reason: impl Into<String>) -> Self {
        Self::InvalidShape {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn missing(package: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingDependency {
            package: package.into(),
            hint: hint.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dependency_message_carries_hint() {
        let err = SchemeError::missing("mxfp4 gemm kernels", "enable `reference-kernels`");
        let msg = err.to_string();
        assert!(msg.contains("mxfp4 gemm kernels"));
        assert!(msg.contains("reference-kernels"));
    }

    #[test]
    fn tensor_errors_pass_through_verbatim() {
        let inner = candle_core::Error::Msg("device lost".to_string());
        let inner_msg = inner.to_string();
        let err: SchemeError = inner.into();
        assert_eq!(err.to_string(), inner_msg);
    }
}
