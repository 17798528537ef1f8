// file: src/mxfp4.rs
// description: MXFP4 E2M1 block quantization, dequantization and quant-dequant emulation over slices and tensors.
// author: cipher-rc5

use candle_core::{DType, Tensor};

use crate::dtype::{shared_scale, F8E8M0, MxFp4};
use crate::error::{Result, SchemeError};

fn check_layout(rows: usize, cols: usize, block_size: usize) -> Result<()> {
    if block_size == 0 {
        return Err(SchemeError::shape("block_size must be non-zero"));
    }
    if cols % 2 != 0 {
        return Err(SchemeError::shape(format!(
            "cols must be even to pack two FP4 codes per byte, got {cols}"
        )));
    }
    if cols % block_size != 0 {
        return Err(SchemeError::shape(format!(
            "cols ({cols}) must be divisible by block_size ({block_size})"
        )));
    }
    if rows == 0 || cols == 0 {
        return Err(SchemeError::shape(format!(
            "empty matrix ({rows}x{cols}) cannot be quantized"
        )));
    }
    Ok(())
}

/// Quantize a row-major `rows x cols` matrix into packed codes `rows x cols/2`
/// and E8M0 scale codes `rows x cols/block_size`.
pub fn quantize_mxfp4(
    values: &[f32],
    rows: usize,
    cols: usize,
    block_size: usize,
) -> Result<(Vec<u8>, Vec<u8>)> {
    check_layout(rows, cols, block_size)?;
    if values.len() != rows * cols {
        return Err(SchemeError::shape(format!(
            "values length mismatch: expected {}, got {}",
            rows * cols,
            values.len()
        )));
    }

    let mut packed = Vec::with_capacity(rows * cols / 2);
    let mut scales = Vec::with_capacity(rows * cols / block_size);
    let mut pending: Option<MxFp4> = None;

    for block in values.chunks_exact(block_size) {
        let scale = shared_scale(block);
        let scale_f32 = scale.to_f32();
        scales.push(scale.code());

        for &value in block {
            let code = MxFp4::from_f32(value / scale_f32);
            match pending.take() {
                Some(low) => packed.push(MxFp4::pack_pair(low, code)),
                None => pending = Some(code),
            }
        }
    }

    Ok((packed, scales))
}

pub fn dequantize_mxfp4(
    blocks: &[u8],
    scales: &[u8],
    rows: usize,
    cols: usize,
    block_size: usize,
) -> Result<Vec<f32>> {
    check_layout(rows, cols, block_size)?;

    let expected_blocks = rows * cols / 2;
    if blocks.len() != expected_blocks {
        return Err(SchemeError::shape(format!(
            "blocks length mismatch: expected {expected_blocks}, got {}",
            blocks.len()
        )));
    }

    let scales_per_row = cols / block_size;
    let expected_scales = rows * scales_per_row;
    if scales.len() != expected_scales {
        return Err(SchemeError::shape(format!(
            "scales length mismatch: expected {expected_scales}, got {}",
            scales.len()
        )));
    }

    let mut out = Vec::with_capacity(rows * cols);
    for (i, &packed) in blocks.iter().enumerate() {
        let (low, high) = MxFp4::unpack_pair(packed);
        let linear = i * 2;
        for (offset, code) in [(0, low), (1, high)] {
            let idx = linear + offset;
            let scale_idx = (idx / cols) * scales_per_row + (idx % cols) / block_size;
            out.push(code.to_f32() * F8E8M0::new(scales[scale_idx]).to_f32());
        }
    }

    Ok(out)
}

/// Round-trip each block through MXFP4 without keeping the packed form.
pub fn quant_dequant_mxfp4(values: &[f32], cols: usize, block_size: usize) -> Result<Vec<f32>> {
    if block_size == 0 || cols == 0 || cols % block_size != 0 {
        return Err(SchemeError::shape(format!(
            "cols ({cols}) must be a non-zero multiple of block_size ({block_size})"
        )));
    }
    if values.len() % cols != 0 {
        return Err(SchemeError::shape(format!(
            "values length {} is not a multiple of cols {cols}",
            values.len()
        )));
    }

    let mut out = Vec::with_capacity(values.len());
    for block in values.chunks_exact(block_size) {
        let scale = shared_scale(block).to_f32();
        out.extend(
            block
                .iter()
                .map(|&v| MxFp4::from_f32(v / scale).to_f32() * scale),
        );
    }
    Ok(out)
}

fn u8_matrix(t: &Tensor, what: &str) -> Result<(usize, usize, Vec<u8>)> {
    if t.dtype() != DType::U8 {
        return Err(SchemeError::shape(format!(
            "{what} must be U8, got {:?}",
            t.dtype()
        )));
    }
    let (rows, cols) = t.dims2()?;
    let data = t.flatten_all()?.to_vec1::<u8>()?;
    Ok((rows, cols, data))
}

/// Dequantize packed `[N, K/2]` codes with `[N, K/block]` scales into a `[N, K]` tensor.
pub fn dequant_mxfp4(
    packed: &Tensor,
    scales: &Tensor,
    block_size: usize,
    dtype: DType,
) -> Result<Tensor> {
    let (rows, packed_cols, blocks) = u8_matrix(packed, "packed weight")?;
    let (scale_rows, scale_cols, scale_bytes) = u8_matrix(scales, "block scale")?;
    let cols = packed_cols * 2;
    if scale_rows != rows || scale_cols * block_size != cols {
        return Err(SchemeError::shape(format!(
            "scale shape ({scale_rows}, {scale_cols}) does not match packed ({rows}, {packed_cols}) with block_size {block_size}"
        )));
    }

    let values = dequantize_mxfp4(&blocks, &scale_bytes, rows, cols, block_size)?;
    Ok(Tensor::from_vec(values, (rows, cols), packed.device())?.to_dtype(dtype)?)
}

/// Quant-dequant emulation of a `[M, K]` activation, preserving its dtype.
pub fn quant_dequant_mxfp4_tensor(x: &Tensor, block_size: usize) -> Result<Tensor> {
    let (rows, cols) = x.dims2()?;
    let values = x.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let qdq = quant_dequant_mxfp4(&values, cols, block_size)?;
    Ok(Tensor::from_vec(qdq, (rows, cols), x.device())?.to_dtype(x.dtype())?)
}

/// Quantize a `[M, K]` tensor into packed codes `[M, K/2]` and scales `[M, K/block]`.
pub fn quantize_mxfp4_tensor(x: &Tensor, block_size: usize) -> Result<(Tensor, Tensor)> {
    let (rows, cols) = x.dims2()?;
    let values = x.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let (packed, scales) = quantize_mxfp4(&values, rows, cols, block_size)?;
    let device = x.device();
    Ok((
        Tensor::from_vec(packed, (rows, cols / 2), device)?,
        Tensor::from_vec(scales, (rows, cols / block_size), device)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::FP4_LUT;
    use candle_core::Device;

    #[test]
    fn dequantizes_known_4x64_tensor() {
        let rows = 4;
        let cols = 64;

        let nibbles: Vec<u8> = (0..rows * cols).map(|i| (i % 16) as u8).collect();
        let blocks: Vec<u8> = nibbles
            .chunks_exact(2)
            .map(|p| (p[0] & 0x0f) | ((p[1] & 0x0f) << 4))
            .collect();

        let scale_codes = [127u8, 128, 126, 129, 125, 130, 127, 124];
        let output = dequantize_mxfp4(&blocks, &scale_codes, rows, cols, 32).unwrap();
        assert_eq!(output.len(), rows * cols);

        for row in 0..rows {
            for col in 0..cols {
                let idx = row * cols + col;
                let scale = 2.0f32.powi(scale_codes[row * (cols / 32) + col / 32] as i32 - 127);
                let expected = FP4_LUT[nibbles[idx] as usize] * scale;
                assert_eq!(output[idx], expected, "mismatch at row={row}, col={col}");
            }
        }
    }

    #[test]
    fn quantize_then_dequantize_is_exact_on_representable_values() {
        // Each 4-wide block holds values on the E2M1 grid times a power of two.
        let values = [
            1.0, -0.5, 6.0, 3.0, //
            0.25, 0.125, -1.5, 0.0, //
            8.0, -12.0, 2.0, 4.0, //
            0.0, 0.0, 0.0, 0.0,
        ];
        let (packed, scales) = quantize_mxfp4(&values, 2, 8, 4).unwrap();
        assert_eq!(packed.len(), 8);
        assert_eq!(scales, vec![127, 125, 128, 0]);
        let back = dequantize_mxfp4(&packed, &scales, 2, 8, 4).unwrap();
        assert_eq!(back, values.to_vec());
    }

    #[test]
    fn quant_dequant_matches_quantize_dequantize() {
        let values: Vec<f32> = (0..64).map(|i| ((i * 37 % 23) as f32 - 11.0) * 0.37).collect();
        let qdq = quant_dequant_mxfp4(&values, 32, 32).unwrap();
        let (packed, scales) = quantize_mxfp4(&values, 2, 32, 32).unwrap();
        let dq = dequantize_mxfp4(&packed, &scales, 2, 32, 32).unwrap();
        assert_eq!(qdq, dq);
        // Quant-dequant is idempotent.
        assert_eq!(quant_dequant_mxfp4(&qdq, 32, 32).unwrap(), qdq);
    }

    #[test]
    fn rejects_bad_layouts() {
        assert!(quantize_mxfp4(&[0.0; 33], 1, 33, 32).is_err());
        assert!(quantize_mxfp4(&[0.0; 34], 1, 34, 32).is_err());
        assert!(dequantize_mxfp4(&[0u8; 15], &[127], 1, 32, 32).is_err());
        assert!(dequantize_mxfp4(&[0u8; 16], &[127, 127], 1, 32, 32).is_err());
        assert!(quant_dequant_mxfp4(&[0.0; 8], 8, 0).is_err());
    }

    #[test]
    fn tensor_dequant_identity_scales() {
        let device = Device::Cpu;
        let packed = Tensor::full(0x22u8, (4usize, 16usize), &device).unwrap();
        let scales = Tensor::full(127u8, (4usize, 1usize), &device).unwrap();
        let w = dequant_mxfp4(&packed, &scales, 32, DType::F32).unwrap();
        assert_eq!(w.dims(), &[4, 32]);
        let vals: Vec<Vec<f32>> = w.to_vec2().unwrap();
        assert!(vals.iter().flatten().all(|&v| v == 1.0));
    }

    #[test]
    fn tensor_dequant_rejects_mismatched_scales() {
        let device = Device::Cpu;
        let packed = Tensor::zeros((4usize, 16usize), DType::U8, &device).unwrap();
        let scales = Tensor::zeros((4usize, 2usize), DType::U8, &device).unwrap();
        assert!(dequant_mxfp4(&packed, &scales, 32, DType::F32).is_err());
    }

    #[test]
    fn tensor_quantize_shapes() {
        let x = Tensor::ones((3usize, 64usize), DType::F32, &Device::Cpu).unwrap();
        let (codes, scales) = quantize_mxfp4_tensor(&x, 32).unwrap();
        assert_eq!(codes.dims(), &[3, 32]);
        assert_eq!(scales.dims(), &[3, 2]);
        let qdq = quant_dequant_mxfp4_tensor(&x, 32).unwrap();
        assert_eq!(qdq.dtype(), DType::F32);
        let vals: Vec<Vec<f32>> = qdq.to_vec2().unwrap();
        assert!(vals.iter().flatten().all(|&v| v == 1.0));
    }
}
