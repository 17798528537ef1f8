// file: src/loader.rs
// description: Memory-mapped safetensors checkpoint reader that feeds packed MXFP4 linear weights into layers.
// author: cipher-rc5

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytemuck::try_cast_slice;
use candle_core::{Device, Tensor};
use half::{bf16, f16};
use memmap2::Mmap;
use safetensors::{Dtype, SafeTensors};
use serde::Deserialize;
use tracing::{debug, info};

use crate::parameter::{LinearLayer, WEIGHT, WEIGHT_SCALE};

const SINGLE_FILE: &str = "model.safetensors";
const INDEX_FILE: &str = "model.safetensors.index.json";

#[derive(Deserialize)]
struct SafetensorsIndexFile {
    weight_map: HashMap<String, String>,
}

/// Checkpoint directory with every shard mapped once.
pub struct ModelCheckpoint {
    model_dir: PathBuf,
    device: Device,
    weight_map: HashMap<String, String>,
    shards: HashMap<String, Mmap>,
}

impl ModelCheckpoint {
    pub fn open(model_dir: &Path, device: &Device) -> Result<Self> {
        let weight_map = load_weight_map(model_dir)?;
        let mut shards = HashMap::new();
        for shard in weight_map.values() {
            if !shards.contains_key(shard) {
                shards.insert(shard.clone(), open_shard(&model_dir.join(shard))?);
            }
        }
        info!(
            "opened checkpoint {} ({} tensors, {} shards)",
            model_dir.display(),
            weight_map.len(),
            shards.len()
        );
        Ok(Self {
            model_dir: model_dir.to_path_buf(),
            device: device.clone(),
            weight_map,
            shards,
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.weight_map
            .keys()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.weight_map.contains_key(name)
    }

    /// Tensor as stored: U8 stays packed bytes, float tensors keep their dtype.
    pub fn raw_tensor(&self, name: &str) -> Result<Tensor> {
        let shard_rel = self
            .weight_map
            .get(name)
            .with_context(|| format!("tensor {name} missing from checkpoint weight_map"))?;
        let shard = self
            .shards
            .get(shard_rel)
            .with_context(|| format!("shard {shard_rel} was not mapped"))?;
        let tensors = SafeTensors::deserialize(shard).with_context(|| {
            format!(
                "failed to parse safetensors shard {}",
                self.model_dir.join(shard_rel).display()
            )
        })?;
        let view = tensors
            .tensor(name)
            .with_context(|| format!("tensor {name} missing from shard {shard_rel}"))?;
        tensor_from_raw(view.dtype(), view.shape().to_vec(), view.data(), &self.device)
            .with_context(|| format!("failed to load tensor {name}"))
    }

    /// `(output_size, input_size)` of a packed linear weight.
    pub fn infer_linear_shape(&self, prefix: &str) -> Result<(usize, usize)> {
        let name = format!("{prefix}.{WEIGHT}");
        let weight = self.raw_tensor(&name)?;
        let (rows, packed_cols) = weight
            .dims2()
            .with_context(|| format!("{name} is not a 2D packed weight"))?;
        Ok((rows, packed_cols * 2))
    }

    /// Fill a layer created by the scheme with `{prefix}.weight` and
    /// `{prefix}.weight_scale`; returns `{prefix}.bias` when present.
    pub fn load_linear(&self, prefix: &str, layer: &mut LinearLayer) -> Result<Option<Tensor>> {
        for param in [WEIGHT, WEIGHT_SCALE] {
            let name = format!("{prefix}.{param}");
            let tensor = self.raw_tensor(&name)?;
            debug!("loading {name} {:?} {:?}", tensor.dims(), tensor.dtype());
            layer
                .load_weight(param, &tensor, None)
                .with_context(|| format!("failed to load {name} into {}", layer.name()))?;
        }
        let bias_name = format!("{prefix}.bias");
        if self.contains(&bias_name) {
            return Ok(Some(self.raw_tensor(&bias_name)?));
        }
        Ok(None)
    }

    /// Prefixes of every linear layer stored as packed weight plus block scale.
    pub fn linear_prefixes(&self) -> Vec<String> {
        self.names()
            .iter()
            .filter_map(|name| name.strip_suffix(".weight_scale"))
            .filter(|prefix| self.contains(&format!("{prefix}.{WEIGHT}")))
            .map(str::to_string)
            .collect()
    }
}

fn load_weight_map(model_dir: &Path) -> Result<HashMap<String, String>> {
    let index_path = model_dir.join(INDEX_FILE);
    if index_path.exists() {
        let file = File::open(&index_path)
            .with_context(|| format!("failed to open index file {}", index_path.display()))?;
        let index: SafetensorsIndexFile = serde_json::from_reader(file)
            .with_context(|| format!("failed to parse index file {}", index_path.display()))?;
        return Ok(index.weight_map);
    }

    let single_file = model_dir.join(SINGLE_FILE);
    let shard = open_shard(&single_file)?;
    let tensors = SafeTensors::deserialize(&shard).with_context(|| {
        format!(
            "failed to parse safetensors shard {}",
            single_file.display()
        )
    })?;
    Ok(tensors
        .names()
        .into_iter()
        .map(|name| (name.to_string(), SINGLE_FILE.to_string()))
        .collect())
}

fn tensor_from_raw(dtype: Dtype, shape: Vec<usize>, data: &[u8], device: &Device) -> Result<Tensor> {
    match dtype {
        Dtype::U8 => Ok(Tensor::from_vec(data.to_vec(), shape, device)?),
        Dtype::BF16 => {
            let bits: &[u16] = try_cast_slice(data)
                .map_err(|e| anyhow::anyhow!("BF16 tensor cast to u16 failed: {e}"))?;
            let out: Vec<bf16> = bits.iter().copied().map(bf16::from_bits).collect();
            Ok(Tensor::from_vec(out, shape, device)?)
        }
        Dtype::F16 => {
            let bits: &[u16] = try_cast_slice(data)
                .map_err(|e| anyhow::anyhow!("F16 tensor cast to u16 failed: {e}"))?;
            let out: Vec<f16> = bits.iter().copied().map(f16::from_bits).collect();
            Ok(Tensor::from_vec(out, shape, device)?)
        }
        Dtype::F32 => {
            // mmap offsets are not guaranteed to be 4-byte aligned
            let out: Vec<f32> = match try_cast_slice::<u8, f32>(data) {
                Ok(vals) => vals.to_vec(),
                Err(_) => data
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            };
            Ok(Tensor::from_vec(out, shape, device)?)
        }
        other => {
            anyhow::bail!("unsupported tensor dtype {other:?} for tensor load")
        }
    }
}

fn open_shard(path: &Path) -> Result<Mmap> {
    let file =
        File::open(path).with_context(|| format!("failed to open shard {}", path.display()))?;
    // SAFETY: checkpoint files are not modified while mapped; the map lives as
    // long as the checkpoint and tensors are copied out of it.
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("failed to mmap shard {}", path.display()))?;
    Ok(mmap)
}
