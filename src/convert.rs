// file: src/convert.rs
// description: Dense-to-MXFP4 weight conversion, accuracy report, and safetensors checkpoint writer.
// author: cipher-rc5

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use std::path::Path;
use tracing::info;

use crate::mxfp4::{dequant_mxfp4, quantize_mxfp4_tensor};
use crate::parameter::{WEIGHT, WEIGHT_SCALE};

/// Packed weight, block scale and optional bias of one linear layer.
#[derive(Debug, Clone)]
pub struct QuantizedLinearWeights {
    pub prefix: String,
    pub weight: Tensor,
    pub weight_scale: Tensor,
    pub bias: Option<Tensor>,
    pub block_size: usize,
}

impl QuantizedLinearWeights {
    pub fn from_dense(prefix: impl Into<String>, dense: &Tensor, block_size: usize) -> crate::Result<Self> {
        let (weight, weight_scale) = quantize_linear_weight(dense, block_size)?;
        Ok(Self {
            prefix: prefix.into(),
            weight,
            weight_scale,
            bias: None,
            block_size,
        })
    }

    pub fn with_bias(mut self, bias: Tensor) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn dequantize(&self, dtype: DType) -> crate::Result<Tensor> {
        dequant_mxfp4(&self.weight, &self.weight_scale, self.block_size, dtype)
    }
}

/// Quantize a dense `[N, K]` weight into packed codes `[N, K/2]` and E8M0 scales `[N, K/block]`.
pub fn quantize_linear_weight(dense: &Tensor, block_size: usize) -> crate::Result<(Tensor, Tensor)> {
    quantize_mxfp4_tensor(dense, block_size)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizationReport {
    pub max_abs_error: f32,
    pub mean_abs_error: f32,
    pub p99_rel_error: f32,
    pub elements: usize,
}

impl QuantizationReport {
    pub fn measure(dense: &Tensor, quantized: &QuantizedLinearWeights) -> crate::Result<Self> {
        let original = dense.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let restored = quantized
            .dequantize(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        if original.len() != restored.len() {
            return Err(crate::SchemeError::shape(format!(
                "dense weight has {} elements, quantized has {}",
                original.len(),
                restored.len()
            )));
        }

        let mut max_abs_error = 0.0f32;
        let mut sum = 0.0f64;
        let mut relative = Vec::with_capacity(original.len());
        for (&orig, &recon) in original.iter().zip(&restored) {
            let abs_error = (orig - recon).abs();
            max_abs_error = max_abs_error.max(abs_error);
            sum += abs_error as f64;
            relative.push(if orig.abs() > 1e-6 {
                abs_error / orig.abs()
            } else {
                abs_error
            });
        }
        relative.sort_by(f32::total_cmp);
        let p99_rel_error = relative
            .get((relative.len() as f32 * 0.99) as usize)
            .or(relative.last())
            .copied()
            .unwrap_or(0.0);

        Ok(Self {
            max_abs_error,
            mean_abs_error: if original.is_empty() {
                0.0
            } else {
                (sum / original.len() as f64) as f32
            },
            p99_rel_error,
            elements: original.len(),
        })
    }

    pub fn print(&self) {
        info!("Accuracy Analysis ({} elements):", self.elements);
        info!("  Max absolute error: {:.6}", self.max_abs_error);
        info!("  Avg absolute error: {:.6}", self.mean_abs_error);
        info!("  99th percentile relative error: {:.4}%", self.p99_rel_error * 100.0);
    }
}

fn tensor_bytes(t: &Tensor) -> Result<(Dtype, Vec<usize>, Vec<u8>)> {
    let shape = t.dims().to_vec();
    match t.dtype() {
        DType::U8 => Ok((Dtype::U8, shape, t.flatten_all()?.to_vec1::<u8>()?)),
        _ => {
            let values = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            Ok((Dtype::F32, shape, bytemuck::cast_slice(&values).to_vec()))
        }
    }
}

/// Write layers as `{prefix}.weight`, `{prefix}.weight_scale` and `{prefix}.bias`.
pub fn write_mxfp4_checkpoint(path: &Path, layers: &[QuantizedLinearWeights]) -> Result<()> {
    let mut buffers = Vec::new();
    for layer in layers {
        buffers.push((format!("{}.{WEIGHT}", layer.prefix), tensor_bytes(&layer.weight)?));
        buffers.push((
            format!("{}.{WEIGHT_SCALE}", layer.prefix),
            tensor_bytes(&layer.weight_scale)?,
        ));
        if let Some(bias) = &layer.bias {
            buffers.push((format!("{}.bias", layer.prefix), tensor_bytes(bias)?));
        }
    }

    let views = buffers
        .iter()
        .map(|(name, (dtype, shape, data))| {
            TensorView::new(*dtype, shape.clone(), data)
                .map(|view| (name.clone(), view))
                .with_context(|| format!("invalid tensor view for {name}"))
        })
        .collect::<Result<Vec<_>>>()?;

    safetensors::serialize_to_file(views, &None, path)
        .with_context(|| format!("failed to write checkpoint {}", path.display()))?;
    info!("wrote {} layers to {}", layers.len(), path.display());
    Ok(())
}
