// file: src/layout.rs
// description: Block-scale layouts expected by the fused GEMM kernels (transpose, 32-row shuffle) and row padding.
// author: cipher-rc5

use candle_core::Tensor;

use crate::error::{Result, SchemeError};

/// Row alignment required by the asm GEMM output buffer.
pub const ASM_ROW_ALIGN: usize = 256;

const SHUFFLE_PERM: [usize; 7] = [0, 3, 5, 2, 4, 1, 6];
const UNSHUFFLE_PERM: [usize; 7] = [0, 5, 3, 1, 4, 2, 6];

/// Layout of a weight's block-scale matrix after post-load processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleLayout {
    /// `(K/B, N)`, consumed by the default fused GEMM.
    Transposed,
    /// `(N, K/B)` regrouped into 32-row sub-tiles, consumed by the preshuffled and asm GEMMs.
    Shuffled,
}

pub fn transpose_scales(scale: &Tensor) -> Result<Tensor> {
    scale.dims2()?;
    Ok(scale.t()?.contiguous()?)
}

fn check_shuffle_dims(rows: usize, cols: usize) -> Result<()> {
    if rows % 32 != 0 || cols % 8 != 0 {
        return Err(SchemeError::shape(format!(
            "scale shuffle needs rows % 32 == 0 and cols % 8 == 0, got ({rows}, {cols})"
        )));
    }
    Ok(())
}

/// View as `(rows/32, 2, 16, cols/8, 2, 4, 1)`, permute `(0,3,5,2,4,1,6)`, flatten.
pub fn shuffle_scales(scale: &Tensor) -> Result<Tensor> {
    let (rows, cols) = scale.dims2()?;
    check_shuffle_dims(rows, cols)?;
    let view = scale
        .contiguous()?
        .reshape(vec![rows / 32, 2, 16, cols / 8, 2, 4, 1])?;
    Ok(view
        .permute(SHUFFLE_PERM.to_vec())?
        .contiguous()?
        .reshape((rows, cols))?)
}

pub fn unshuffle_scales(shuffled: &Tensor) -> Result<Tensor> {
    let (rows, cols) = shuffled.dims2()?;
    check_shuffle_dims(rows, cols)?;
    // Shape of the permuted view produced by `shuffle_scales`.
    let view = shuffled
        .contiguous()?
        .reshape(vec![rows / 32, cols / 8, 4, 16, 2, 2, 1])?;
    Ok(view
        .permute(UNSHUFFLE_PERM.to_vec())?
        .contiguous()?
        .reshape((rows, cols))?)
}

pub fn asm_padded_rows(m: usize) -> usize {
    m.div_ceil(ASM_ROW_ALIGN) * ASM_ROW_ALIGN
}

/// Zero-pad the leading dimension of a 2D tensor up to `rows`.
pub fn pad_rows(t: &Tensor, rows: usize) -> Result<Tensor> {
    let (current, _) = t.dims2()?;
    if rows < current {
        return Err(SchemeError::shape(format!(
            "cannot pad {current} rows down to {rows}"
        )));
    }
    if rows == current {
        return Ok(t.clone());
    }
    Ok(t.pad_with_zeros(0, 0, rows - current)?)
}
