// file: src/backend/reference.rs
// description: CPU reference implementations of the MXFP4 activation-quant and fused GEMM kernels.
// author: cipher-rc5

use candle_core::{DType, Tensor};

use super::{ActivationQuantKernel, Mxfp4GemmKernel, QuantizedActivation};
use crate::dtype::OCP_MX_BLOCK_SIZE;
use crate::error::{Result, SchemeError};
use crate::layout::{transpose_scales, unshuffle_scales, ASM_ROW_ALIGN};
use crate::mxfp4::{dequant_mxfp4, quantize_mxfp4_tensor};

pub struct ReferenceActivationQuant {
    block_size: usize,
}

impl ReferenceActivationQuant {
    pub fn new(block_size: usize) -> Self {
        Self { block_size }
    }
}

impl Default for ReferenceActivationQuant {
    fn default() -> Self {
        Self::new(OCP_MX_BLOCK_SIZE)
    }
}

impl ActivationQuantKernel for ReferenceActivationQuant {
    fn name(&self) -> &'static str {
        "reference-dynamic-mxfp4-quant"
    }

    fn quantize(&self, x: &Tensor) -> Result<QuantizedActivation> {
        let (codes, scales) = quantize_mxfp4_tensor(x, self.block_size)?;
        QuantizedActivation::new(codes, scales)
    }
}

/// Block size implied by a packed operand and its plain-layout scales.
fn block_size_of(codes: &Tensor, scales: &Tensor, what: &str) -> Result<usize> {
    let (rows, packed_cols) = codes.dims2()?;
    let (scale_rows, scale_cols) = scales.dims2()?;
    let k = packed_cols * 2;
    if scale_rows != rows || scale_cols == 0 || k % scale_cols != 0 {
        return Err(SchemeError::shape(format!(
            "{what}: scales ({scale_rows}, {scale_cols}) incompatible with codes ({rows}, {packed_cols})"
        )));
    }
    Ok(k / scale_cols)
}

/// Dequantize both operands and multiply; all scales in plain `(rows, K/B)` layout.
fn dense_gemm(
    x_q: &Tensor,
    w_q: &Tensor,
    x_s: &Tensor,
    w_s: &Tensor,
    out_dtype: DType,
) -> Result<Tensor> {
    let (_, x_cols) = x_q.dims2()?;
    let (_, w_cols) = w_q.dims2()?;
    if x_cols != w_cols {
        return Err(SchemeError::shape(format!(
            "reduction mismatch: activation has {} features, weight has {}",
            x_cols * 2,
            w_cols * 2
        )));
    }
    let x_block = block_size_of(x_q, x_s, "activation")?;
    let w_block = block_size_of(w_q, w_s, "weight")?;
    if x_block != w_block {
        return Err(SchemeError::shape(format!(
            "activation block size {x_block} differs from weight block size {w_block}"
        )));
    }

    let x = dequant_mxfp4(x_q, x_s, x_block, DType::F32)?;
    let w = dequant_mxfp4(w_q, w_s, w_block, DType::F32)?;
    Ok(x.matmul(&w.t()?)?.to_dtype(out_dtype)?)
}

/// Default kernel: weight scales transposed to `(K/B, N)`.
pub struct ReferenceGemm;

impl Mxfp4GemmKernel for ReferenceGemm {
    fn name(&self) -> &'static str {
        "reference-gemm-afp4wfp4"
    }

    fn gemm(
        &self,
        x_q: &Tensor,
        w_q: &Tensor,
        x_s: &Tensor,
        w_s: &Tensor,
        out_dtype: DType,
    ) -> Result<Tensor> {
        let w_s = transpose_scales(w_s)?;
        dense_gemm(x_q, w_q, x_s, &w_s, out_dtype)
    }
}

/// Weight scales block-shuffled, activation scales plain.
pub struct ReferencePreshuffledGemm;

impl Mxfp4GemmKernel for ReferencePreshuffledGemm {
    fn name(&self) -> &'static str {
        "reference-gemm-afp4wfp4-preshuffled"
    }

    fn gemm(
        &self,
        x_q: &Tensor,
        w_q: &Tensor,
        x_s: &Tensor,
        w_s: &Tensor,
        out_dtype: DType,
    ) -> Result<Tensor> {
        let w_s = unshuffle_scales(w_s)?;
        dense_gemm(x_q, w_q, x_s, &w_s, out_dtype)
    }
}

/// Both scale operands block-shuffled; rows must be padded to a multiple of 256.
pub struct ReferenceAsmGemm;

impl Mxfp4GemmKernel for ReferenceAsmGemm {
    fn name(&self) -> &'static str {
        "reference-gemm-a4w4-asm"
    }

    fn gemm(
        &self,
        x_q: &Tensor,
        w_q: &Tensor,
        x_s: &Tensor,
        w_s: &Tensor,
        out_dtype: DType,
    ) -> Result<Tensor> {
        let (rows, _) = x_q.dims2()?;
        if rows % ASM_ROW_ALIGN != 0 {
            return Err(SchemeError::shape(format!(
                "asm gemm needs activation rows padded to a multiple of {ASM_ROW_ALIGN}, got {rows}"
            )));
        }
        let x_s = unshuffle_scales(x_s)?;
        let w_s = unshuffle_scales(w_s)?;
        dense_gemm(x_q, w_q, &x_s, &w_s, out_dtype)
    }
}
