// file: src/parameter.rs
// description: Layer parameter registry, packed/group-scale parameter metadata and the weight-loading callback.
// author: cipher-rc5

use candle_core::{DType, Device, Tensor};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, SchemeError};

pub const WEIGHT: &str = "weight";
pub const WEIGHT_SCALE: &str = "weight_scale";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    /// Several logical elements packed into one stored element along `packed_dim`.
    Packed {
        input_dim: usize,
        output_dim: usize,
        packed_dim: usize,
        packed_factor: usize,
    },
    /// One scale per group of input features.
    GroupScale { input_dim: usize, output_dim: usize },
}

impl ParameterKind {
    pub fn output_dim(&self) -> usize {
        match *self {
            Self::Packed { output_dim, .. } | Self::GroupScale { output_dim, .. } => output_dim,
        }
    }
}

/// Rows `[offset, offset + size)` of the output dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub offset: usize,
    pub size: usize,
}

pub type WeightLoader =
    Arc<dyn Fn(&mut Parameter, &Tensor, Option<ShardSpec>) -> Result<()> + Send + Sync>;

pub struct Parameter {
    data: Tensor,
    kind: ParameterKind,
    loader: WeightLoader,
}

impl Parameter {
    pub fn new(data: Tensor, kind: ParameterKind, loader: WeightLoader) -> Self {
        Self { data, kind, loader }
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn kind(&self) -> ParameterKind {
        self.kind
    }

    pub fn size_in_bytes(&self) -> usize {
        self.data.elem_count() * self.data.dtype().size_in_bytes()
    }

    fn load(&mut self, loaded: &Tensor, shard: Option<ShardSpec>) -> Result<()> {
        let loader = Arc::clone(&self.loader);
        loader(self, loaded, shard)
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("shape", &self.data.dims())
            .field("dtype", &self.data.dtype())
            .field("kind", &self.kind)
            .finish()
    }
}

/// Copy `loaded` into the parameter, whole or into one output shard.
pub fn default_weight_loader(
    param: &mut Parameter,
    loaded: &Tensor,
    shard: Option<ShardSpec>,
) -> Result<()> {
    if loaded.dtype() != param.data.dtype() {
        return Err(SchemeError::shape(format!(
            "loaded dtype {:?} does not match parameter dtype {:?}",
            loaded.dtype(),
            param.data.dtype()
        )));
    }
    let target = param.data.dims().to_vec();
    let out_dim = param.kind.output_dim();

    let Some(shard) = shard else {
        if loaded.dims() != target.as_slice() {
            return Err(SchemeError::shape(format!(
                "loaded shape {:?} does not match parameter shape {:?}",
                loaded.dims(),
                target
            )));
        }
        param.data = loaded.to_device(param.data.device())?;
        return Ok(());
    };

    let mut expected = target.clone();
    expected[out_dim] = shard.size;
    if loaded.dims() != expected.as_slice() || shard.offset + shard.size > target[out_dim] {
        return Err(SchemeError::shape(format!(
            "shard {:?} with shape {:?} does not fit parameter shape {:?}",
            shard,
            loaded.dims(),
            target
        )));
    }

    let total = target[out_dim];
    let tail = total - shard.offset - shard.size;
    let loaded = loaded.to_device(param.data.device())?;
    let mut parts = Vec::with_capacity(3);
    if shard.offset > 0 {
        parts.push(param.data.narrow(out_dim, 0, shard.offset)?);
    }
    parts.push(loaded);
    if tail > 0 {
        parts.push(param.data.narrow(out_dim, shard.offset + shard.size, tail)?);
    }
    param.data = Tensor::cat(&parts, out_dim)?;
    Ok(())
}

pub fn default_loader() -> WeightLoader {
    Arc::new(default_weight_loader)
}

/// Linear layer whose weight state is owned by a quantization scheme.
pub struct LinearLayer {
    name: String,
    device: Device,
    params: BTreeMap<String, Parameter>,
    pub(crate) logical_widths: Vec<usize>,
    pub(crate) input_size_per_partition: usize,
    pub(crate) output_size_per_partition: usize,
    pub(crate) params_dtype: DType,
    pub(crate) finalized: Option<crate::scheme::FinalizedWeights>,
}

impl LinearLayer {
    pub fn new(name: impl Into<String>, device: &Device) -> Self {
        Self {
            name: name.into(),
            device: device.clone(),
            params: BTreeMap::new(),
            logical_widths: Vec::new(),
            input_size_per_partition: 0,
            output_size_per_partition: 0,
            params_dtype: DType::BF16,
            finalized: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn logical_widths(&self) -> &[usize] {
        &self.logical_widths
    }

    pub fn input_size_per_partition(&self) -> usize {
        self.input_size_per_partition
    }

    pub fn output_size_per_partition(&self) -> usize {
        self.output_size_per_partition
    }

    pub fn params_dtype(&self) -> DType {
        self.params_dtype
    }

    pub fn register_parameter(&mut self, name: impl Into<String>, param: Parameter) {
        let name = name.into();
        debug!("{}: register {name} {:?}", self.name, param);
        self.params.insert(name, param);
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub(crate) fn take_parameter(&mut self, name: &str) -> Result<Parameter> {
        self.params
            .remove(name)
            .ok_or_else(|| SchemeError::config(format!("{}: no parameter named {name}", self.name)))
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    /// Feed checkpoint bytes to a registered parameter. With `shard_id`, the
    /// tensor covers only that logical output partition.
    pub fn load_weight(&mut self, name: &str, loaded: &Tensor, shard_id: Option<usize>) -> Result<()> {
        if self.finalized.is_some() {
            return Err(SchemeError::AlreadyFinalized);
        }
        let shard = match shard_id {
            None => None,
            Some(id) => {
                let size = *self.logical_widths.get(id).ok_or_else(|| {
                    SchemeError::config(format!(
                        "{}: shard {id} out of range for {} partitions",
                        self.name,
                        self.logical_widths.len()
                    ))
                })?;
                let offset = self.logical_widths[..id].iter().sum();
                Some(ShardSpec { offset, size })
            }
        };

        let layer_name = self.name.clone();
        let param = self
            .params
            .get_mut(name)
            .ok_or_else(|| SchemeError::config(format!("{layer_name}: no parameter named {name}")))?;
        param.load(loaded, shard)
    }
}

impl fmt::Debug for LinearLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearLayer")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("logical_widths", &self.logical_widths)
            .field("finalized", &self.finalized.is_some())
            .finish()
    }
}
