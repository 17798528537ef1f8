// file: src/quantizer.rs
// description: Weight quantizer objects bound to a layer's block scales, used by the emulation path.
// author: cipher-rc5

use candle_core::{DType, Tensor};

use crate::config::QuantSpec;
use crate::error::{Result, SchemeError};
use crate::mxfp4::dequant_mxfp4;

/// Lazy dequantizer bound to one weight's raw block scales.
pub trait RealQuantizer: Send + Sync {
    fn block_size(&self) -> usize;

    fn out_dtype(&self) -> DType;

    fn scale(&self) -> &Tensor;

    /// Packed `[N, K/2]` codes to a `[N, K]` tensor in `out_dtype`.
    fn dequantize(&self, packed: &Tensor) -> Result<Tensor>;
}

/// Builds quantizers from a weight spec; resolved through the kernel probe.
pub trait QuantizerBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn build(
        &self,
        spec: &QuantSpec,
        scale: Tensor,
        out_dtype: DType,
    ) -> Result<Box<dyn RealQuantizer>>;
}

pub struct Mxfp4RealQuantizer {
    block_size: usize,
    scale: Tensor,
    out_dtype: DType,
}

impl Mxfp4RealQuantizer {
    pub fn new(spec: &QuantSpec, scale: Tensor, out_dtype: DType) -> Result<Self> {
        spec.validate("weight")?;
        if scale.dtype() != DType::U8 {
            return Err(SchemeError::shape(format!(
                "weight scale must be U8 E8M0 codes, got {:?}",
                scale.dtype()
            )));
        }
        scale.dims2()?;
        Ok(Self {
            block_size: spec.block_size(),
            scale,
            out_dtype,
        })
    }
}

impl RealQuantizer for Mxfp4RealQuantizer {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn out_dtype(&self) -> DType {
        self.out_dtype
    }

    fn scale(&self) -> &Tensor {
        &self.scale
    }

    fn dequantize(&self, packed: &Tensor) -> Result<Tensor> {
        dequant_mxfp4(packed, &self.scale, self.block_size, self.out_dtype)
    }
}

pub struct ReferenceQuantizerBackend;

impl QuantizerBackend for ReferenceQuantizerBackend {
    fn name(&self) -> &'static str {
        "reference-mxfp4-quantizer"
    }

    fn build(
        &self,
        spec: &QuantSpec,
        scale: Tensor,
        out_dtype: DType,
    ) -> Result<Box<dyn RealQuantizer>> {
        Ok(Box::new(Mxfp4RealQuantizer::new(spec, scale, out_dtype)?))
    }
}
