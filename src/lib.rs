pub mod backend;
pub mod benchmark;
pub mod config;
pub mod convert;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod loader;
pub mod memory;
pub mod mxfp4;
pub mod parameter;
pub mod platform;
pub mod quantizer;
pub mod scheme;
pub mod utils;

pub use backend::{GemmVariant, KernelRegistry, QuantizedActivation};
pub use config::{QuantSpec, QuarkConfig, SchemeConfig};
pub use convert::{write_mxfp4_checkpoint, QuantizationReport, QuantizedLinearWeights};
pub use dtype::{MxBlock, MxFp4, F8E8M0, OCP_MX_BLOCK_SIZE};
pub use error::{Result, SchemeError};
pub use layout::ScaleLayout;
pub use loader::ModelCheckpoint;
pub use memory::{MemoryManager, MemoryStats};
pub use mxfp4::{dequantize_mxfp4, quantize_mxfp4};
pub use parameter::LinearLayer;
pub use platform::{HostPlatform, Platform};
pub use scheme::{select_mode, ExecutionMode, LinearScheme, W4A4Mxfp4Scheme};

use anyhow::Context;
use candle_core::Tensor;
use std::path::Path;
use std::sync::Arc;

/// One checkpoint linear layer loaded and finalized under the W4A4 MXFP4 scheme.
pub struct LayerRuntime {
    pub scheme: W4A4Mxfp4Scheme,
    pub layer: LinearLayer,
    pub bias: Option<Tensor>,
}

impl LayerRuntime {
    pub fn from_checkpoint(
        model_path: &Path,
        prefix: &str,
        platform: Arc<dyn Platform>,
        kernels: KernelRegistry,
        config: SchemeConfig,
    ) -> anyhow::Result<Self> {
        let (weight_spec, input_spec) = if model_path.join("config.json").exists() {
            let quark = QuarkConfig::load_from_path(model_path)?;
            quark
                .specs_for_layer(prefix)
                .with_context(|| format!("layer {prefix} is not quantized as W4A4 MXFP4"))?
        } else {
            (QuantSpec::mxfp4(false), QuantSpec::mxfp4(true))
        };

        let checkpoint = ModelCheckpoint::open(model_path, platform.device())?;
        let (output_size, input_size) = checkpoint.infer_linear_shape(prefix)?;
        let device = platform.device().clone();
        let scheme = W4A4Mxfp4Scheme::new(weight_spec, input_spec, platform, kernels, config)?;

        let mut layer = LinearLayer::new(prefix, &device);
        scheme.create_weights(&mut layer, &[output_size], input_size, config.out_dtype)?;
        let bias = checkpoint.load_linear(prefix, &mut layer)?;
        scheme.process_weights_after_loading(&mut layer)?;

        Ok(Self {
            scheme,
            layer,
            bias,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.scheme.apply_weights(&self.layer, x, self.bias.as_ref())
    }
}
