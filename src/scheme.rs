// file: src/scheme.rs
// description: W4A4 MXFP4 linear scheme: mode selection, weight creation, post-load processing and forward dispatch.
// author: cipher-rc5

use candle_core::{DType, Tensor};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::{GemmVariant, KernelRegistry, QuantizedActivation, KERNEL_PACKAGE};
use crate::config::{QuantSpec, SchemeConfig};
use crate::dtype::OCP_MX_BLOCK_SIZE;
use crate::error::{Result, SchemeError};
use crate::layout::{asm_padded_rows, pad_rows, shuffle_scales, transpose_scales, ScaleLayout};
use crate::mxfp4::quant_dequant_mxfp4_tensor;
use crate::parameter::{default_loader, LinearLayer, Parameter, ParameterKind, WEIGHT, WEIGHT_SCALE};
use crate::platform::Platform;
use crate::quantizer::RealQuantizer;

/// Lowest compute capability (`major * 10 + minor`) the scheme runs on.
pub const MIN_CAPABILITY: u32 = 70;

/// Batch rows above which the asm GEMM is preferred over the preshuffled one.
pub const ASM_MIN_ROWS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Dequantize weights and quant-dequantize activations, then run a dense matmul.
    Emulate,
    /// Quantize activations and call a fused MXFP4 GEMM kernel.
    Native,
}

pub fn select_mode(hardware_supports_native_mx: bool, memory_opt: bool) -> ExecutionMode {
    if !hardware_supports_native_mx || memory_opt {
        ExecutionMode::Emulate
    } else {
        ExecutionMode::Native
    }
}

pub fn is_supported(capability: u32) -> bool {
    capability >= MIN_CAPABILITY
}

/// Weight state of a layer once post-load processing ran. Exactly one
/// representation is live.
pub enum FinalizedWeights {
    /// Dequantized `[N, K]` weight; packed codes and scales were dropped.
    Dequantized { weight: Tensor },
    /// Packed `[N, K/2]` codes dequantized on every forward.
    Lazy {
        weight: Tensor,
        quantizer: Box<dyn RealQuantizer>,
    },
    /// Packed codes plus scales in the layout the selected kernels consume.
    Native {
        weight: Tensor,
        weight_scale: Tensor,
        layout: ScaleLayout,
    },
}

impl FinalizedWeights {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dequantized { .. } => "dequantized",
            Self::Lazy { .. } => "lazy",
            Self::Native { .. } => "native",
        }
    }
}

impl fmt::Debug for FinalizedWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dequantized { weight } => f
                .debug_struct("Dequantized")
                .field("weight", &weight.dims())
                .finish(),
            Self::Lazy { weight, quantizer } => f
                .debug_struct("Lazy")
                .field("weight", &weight.dims())
                .field("block_size", &quantizer.block_size())
                .finish(),
            Self::Native {
                weight,
                weight_scale,
                layout,
            } => f
                .debug_struct("Native")
                .field("weight", &weight.dims())
                .field("weight_scale", &weight_scale.dims())
                .field("layout", layout)
                .finish(),
        }
    }
}

/// Lifecycle of a quantized linear layer: create storage, load, finalize once, apply many times.
pub trait LinearScheme: Send + Sync {
    fn min_capability(&self) -> u32;

    fn create_weights(
        &self,
        layer: &mut LinearLayer,
        output_partition_sizes: &[usize],
        input_size_per_partition: usize,
        params_dtype: DType,
    ) -> Result<()>;

    fn process_weights_after_loading(&self, layer: &mut LinearLayer) -> Result<()>;

    fn apply_weights(&self, layer: &LinearLayer, x: &Tensor, bias: Option<&Tensor>) -> Result<Tensor>;
}

pub struct W4A4Mxfp4Scheme {
    weight_spec: QuantSpec,
    input_spec: QuantSpec,
    mode: ExecutionMode,
    platform: Arc<dyn Platform>,
    kernels: KernelRegistry,
    config: SchemeConfig,
}

impl W4A4Mxfp4Scheme {
    pub fn new(
        weight_spec: QuantSpec,
        input_spec: QuantSpec,
        platform: Arc<dyn Platform>,
        kernels: KernelRegistry,
        config: SchemeConfig,
    ) -> Result<Self> {
        weight_spec.validate("weight")?;
        input_spec.validate("input")?;
        if weight_spec.block_size() != input_spec.block_size() {
            return Err(SchemeError::config(format!(
                "weight block size {} differs from input block size {}",
                weight_spec.block_size(),
                input_spec.block_size()
            )));
        }

        let mode = select_mode(platform.supports_mx(), config.emu_mem_opt);
        if mode == ExecutionMode::Native {
            // Fused kernels quantize and reduce over OCP 32-element blocks only.
            if weight_spec.block_size() != OCP_MX_BLOCK_SIZE {
                return Err(SchemeError::config(format!(
                    "native MX execution needs block size {OCP_MX_BLOCK_SIZE}, got {}",
                    weight_spec.block_size()
                )));
            }
            let missing = kernels.missing_native(config.use_asm_gemm);
            if !missing.is_empty() {
                return Err(SchemeError::missing(
                    KERNEL_PACKAGE,
                    format!(
                        "native MX execution on {} needs kernels that did not resolve: {}",
                        platform.name(),
                        missing.join(", ")
                    ),
                ));
            }
        }

        info!(
            "W4A4 MXFP4 scheme on {}: mode={:?} block_size={} mem_opt={} asm_gemm={}",
            platform.name(),
            mode,
            weight_spec.block_size(),
            config.emu_mem_opt,
            config.use_asm_gemm
        );

        Ok(Self {
            weight_spec,
            input_spec,
            mode,
            platform,
            kernels,
            config,
        })
    }

    /// Scheme for the OCP MX layout: static weight, dynamic activation, block 32.
    pub fn ocp(platform: Arc<dyn Platform>, kernels: KernelRegistry, config: SchemeConfig) -> Result<Self> {
        Self::new(
            QuantSpec::mxfp4(false),
            QuantSpec::mxfp4(true),
            platform,
            kernels,
            config,
        )
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn config(&self) -> &SchemeConfig {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.weight_spec.block_size()
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Kernel for a batch of `rows` given the finalized scale layout.
    pub fn gemm_variant(&self, layout: ScaleLayout, rows: usize) -> Result<GemmVariant> {
        match layout {
            ScaleLayout::Transposed => Ok(GemmVariant::Default),
            ScaleLayout::Shuffled if rows > ASM_MIN_ROWS => Ok(GemmVariant::Asm),
            ScaleLayout::Shuffled => Ok(GemmVariant::Preshuffled),
        }
    }

    fn finalize_emulated(&self, layer: &LinearLayer) -> Result<FinalizedWeights> {
        let backend = self.kernels.quantizer()?;
        let weight = loaded(layer, WEIGHT)?;
        let scale = loaded(layer, WEIGHT_SCALE)?;
        let quantizer = backend.build(&self.weight_spec, scale.clone(), self.config.out_dtype)?;
        let memory = self.platform.memory();

        if self.config.emu_mem_opt {
            debug!("{}: keeping packed weight with lazy {}", layer.name(), backend.name());
            return Ok(FinalizedWeights::Lazy { weight, quantizer });
        }

        let dense = quantizer.dequantize(&weight)?;
        memory.record_allocation("dequantized weight", tensor_bytes(&dense));
        memory.record_release("packed weight", tensor_bytes(&weight));
        memory.record_release("weight scale", tensor_bytes(&scale));
        debug!(
            "{}: materialized dequantized weight {:?} {:?}",
            layer.name(),
            dense.dims(),
            dense.dtype()
        );
        Ok(FinalizedWeights::Dequantized { weight: dense })
    }

    fn finalize_native(&self, layer: &LinearLayer) -> Result<FinalizedWeights> {
        let weight = loaded(layer, WEIGHT)?;
        let scale = loaded(layer, WEIGHT_SCALE)?;
        let (weight_scale, layout) = if self.config.use_asm_gemm {
            (shuffle_scales(&scale)?, ScaleLayout::Shuffled)
        } else {
            (transpose_scales(&scale)?, ScaleLayout::Transposed)
        };
        let memory = self.platform.memory();
        memory.record_allocation("weight scale", tensor_bytes(&weight_scale));
        memory.record_release("weight scale", tensor_bytes(&scale));
        debug!("{}: weight scale {:?} -> {:?}", layer.name(), layout, weight_scale.dims());
        Ok(FinalizedWeights::Native {
            weight,
            weight_scale,
            layout,
        })
    }

    /// Forward pass; `x_quant` supplies precomputed activation codes and plain-layout scales.
    pub fn apply_with_activation(
        &self,
        layer: &LinearLayer,
        x: &Tensor,
        x_quant: Option<&QuantizedActivation>,
        bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        let finalized = layer.finalized.as_ref().ok_or(SchemeError::NotFinalized)?;

        let dims = x.dims().to_vec();
        let Some((&k, leading)) = dims.split_last() else {
            return Err(SchemeError::shape("activation must have at least one dimension"));
        };
        if leading.is_empty() {
            return Err(SchemeError::shape(format!(
                "activation must be at least 2D, got {dims:?}"
            )));
        }
        if k != layer.input_size_per_partition {
            return Err(SchemeError::shape(format!(
                "activation has {k} features but {} expects {}",
                layer.name(),
                layer.input_size_per_partition
            )));
        }
        let m: usize = leading.iter().product();
        let x2 = x.reshape((m, k))?;

        let y = match (self.mode, finalized) {
            (ExecutionMode::Emulate, FinalizedWeights::Dequantized { weight }) => {
                self.emulated_matmul(&x2, &weight.to_dtype(x.dtype())?)?
            }
            (ExecutionMode::Emulate, FinalizedWeights::Lazy { weight, quantizer }) => {
                let dense = quantizer.dequantize(weight)?.to_dtype(x.dtype())?;
                self.emulated_matmul(&x2, &dense)?
            }
            (
                ExecutionMode::Native,
                FinalizedWeights::Native {
                    weight,
                    weight_scale,
                    layout,
                },
            ) => self.native_gemm(&x2, x_quant, weight, weight_scale, *layout)?,
            (mode, state) => {
                return Err(SchemeError::config(format!(
                    "{} was finalized as {} but the scheme runs in {:?} mode",
                    layer.name(),
                    state.kind(),
                    mode
                )))
            }
        };

        let y = match bias {
            Some(bias) => y.broadcast_add(&bias.to_dtype(y.dtype())?)?,
            None => y,
        };

        let mut out_dims = leading.to_vec();
        out_dims.push(y.dims()[1]);
        Ok(y.reshape(out_dims)?)
    }

    fn emulated_matmul(&self, x: &Tensor, weight: &Tensor) -> Result<Tensor> {
        let x_qdq = quant_dequant_mxfp4_tensor(x, self.input_spec.block_size())?;
        Ok(x_qdq.matmul(&weight.t()?)?)
    }

    fn native_gemm(
        &self,
        x: &Tensor,
        x_quant: Option<&QuantizedActivation>,
        weight: &Tensor,
        weight_scale: &Tensor,
        layout: ScaleLayout,
    ) -> Result<Tensor> {
        let (m, k) = x.dims2()?;
        let act = match x_quant {
            Some(act) => act.clone(),
            None => self.kernels.act_quant()?.quantize(x)?,
        };
        if act.rows() != m || act.features() != k {
            return Err(SchemeError::shape(format!(
                "precomputed activation ({}, {}) does not match input ({m}, {k})",
                act.rows(),
                act.features()
            )));
        }

        let variant = self.gemm_variant(layout, m)?;
        let kernel = self.kernels.gemm_for(variant)?;
        let out_dtype = self.config.out_dtype;
        debug!("native gemm: {} rows={m} via {}", variant.as_str(), kernel.name());

        match variant {
            GemmVariant::Default | GemmVariant::Preshuffled => {
                kernel.gemm(&act.codes, weight, &act.scales, weight_scale, out_dtype)
            }
            GemmVariant::Asm => {
                let padded = asm_padded_rows(m);
                let codes = pad_rows(&act.codes, padded)?;
                let scales = shuffle_scales(&pad_rows(&act.scales, padded)?)?;
                let y = kernel.gemm(&codes, weight, &scales, weight_scale, out_dtype)?;
                Ok(y.narrow(0, 0, m)?)
            }
        }
    }
}

impl LinearScheme for W4A4Mxfp4Scheme {
    fn min_capability(&self) -> u32 {
        MIN_CAPABILITY
    }

    fn create_weights(
        &self,
        layer: &mut LinearLayer,
        output_partition_sizes: &[usize],
        input_size_per_partition: usize,
        params_dtype: DType,
    ) -> Result<()> {
        if layer.finalized.is_some() {
            return Err(SchemeError::AlreadyFinalized);
        }
        let block_size = self.block_size();
        let output_size: usize = output_partition_sizes.iter().sum();
        if output_size == 0 || input_size_per_partition == 0 {
            return Err(SchemeError::shape(format!(
                "{}: empty layer (output {output_size}, input {input_size_per_partition})",
                layer.name()
            )));
        }
        if input_size_per_partition % 2 != 0 {
            return Err(SchemeError::shape(format!(
                "{}: input size {input_size_per_partition} cannot be packed two values per byte",
                layer.name()
            )));
        }
        if input_size_per_partition % block_size != 0 {
            return Err(SchemeError::shape(format!(
                "{}: input size {input_size_per_partition} is not a multiple of block size {block_size}",
                layer.name()
            )));
        }

        let device = layer.device().clone();
        let weight = Tensor::zeros(
            (output_size, input_size_per_partition / 2),
            DType::U8,
            &device,
        )?;
        let scale = Tensor::zeros(
            (output_size, input_size_per_partition / block_size),
            DType::U8,
            &device,
        )?;
        let memory = self.platform.memory();
        memory.record_allocation("packed weight", tensor_bytes(&weight));
        memory.record_allocation("weight scale", tensor_bytes(&scale));

        layer.logical_widths = output_partition_sizes.to_vec();
        layer.input_size_per_partition = input_size_per_partition;
        layer.output_size_per_partition = output_size;
        layer.params_dtype = params_dtype;
        layer.register_parameter(
            WEIGHT,
            Parameter::new(
                weight,
                ParameterKind::Packed {
                    input_dim: 1,
                    output_dim: 0,
                    packed_dim: 1,
                    packed_factor: 2,
                },
                default_loader(),
            ),
        );
        layer.register_parameter(
            WEIGHT_SCALE,
            Parameter::new(
                scale,
                ParameterKind::GroupScale {
                    input_dim: 1,
                    output_dim: 0,
                },
                default_loader(),
            ),
        );
        Ok(())
    }

    fn process_weights_after_loading(&self, layer: &mut LinearLayer) -> Result<()> {
        if layer.finalized.is_some() {
            return Err(SchemeError::AlreadyFinalized);
        }
        let finalized = match self.mode {
            ExecutionMode::Emulate => self.finalize_emulated(layer)?,
            ExecutionMode::Native => self.finalize_native(layer)?,
        };
        layer.take_parameter(WEIGHT)?;
        layer.take_parameter(WEIGHT_SCALE)?;
        info!("{}: weights finalized as {}", layer.name(), finalized.kind());
        layer.finalized = Some(finalized);
        self.platform.empty_cache()
    }

    fn apply_weights(&self, layer: &LinearLayer, x: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        self.apply_with_activation(layer, x, None, bias)
    }
}

impl fmt::Debug for W4A4Mxfp4Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("W4A4Mxfp4Scheme")
            .field("mode", &self.mode)
            .field("block_size", &self.block_size())
            .field("platform", &self.platform.name())
            .field("config", &self.config)
            .field("kernels", &self.kernels)
            .finish()
    }
}

fn loaded(layer: &LinearLayer, name: &str) -> Result<Tensor> {
    layer
        .parameter(name)
        .map(|p| p.data().clone())
        .ok_or_else(|| {
            SchemeError::config(format!(
                "{}: {name} missing, create_weights must run before post-load processing",
                layer.name()
            ))
        })
}

fn tensor_bytes(t: &Tensor) -> usize {
    t.elem_count() * t.dtype().size_in_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::reference::ReferenceAsmGemm;
    use crate::backend::Mxfp4GemmKernel;
    use crate::mxfp4::{dequantize_mxfp4, quant_dequant_mxfp4, quantize_mxfp4, quantize_mxfp4_tensor};
    use crate::platform::HostPlatform;
    use crate::quantizer::ReferenceQuantizerBackend;
    use candle_core::Device;
    use std::sync::Mutex;

    fn dense(rows: usize, cols: usize, seed: usize) -> Vec<f32> {
        (0..rows * cols)
            .map(|i| ((i * 31 + seed * 17) % 29) as f32 / 4.0 - 3.5)
            .collect()
    }

    fn scheme(native_mx: bool, config: SchemeConfig) -> W4A4Mxfp4Scheme {
        W4A4Mxfp4Scheme::ocp(HostPlatform::new(native_mx), KernelRegistry::reference(), config)
            .unwrap()
    }

    /// Layer of `n x k` quantized from a deterministic dense weight.
    fn loaded_layer(s: &W4A4Mxfp4Scheme, n: usize, k: usize) -> LinearLayer {
        let device = Device::Cpu;
        let mut layer = LinearLayer::new("proj", &device);
        s.create_weights(&mut layer, &[n], k, DType::F32).unwrap();
        let w = Tensor::from_vec(dense(n, k, 1), (n, k), &device).unwrap();
        let (packed, scale) = quantize_mxfp4_tensor(&w, s.block_size()).unwrap();
        layer.load_weight(WEIGHT, &packed, None).unwrap();
        layer.load_weight(WEIGHT_SCALE, &scale, None).unwrap();
        layer
    }

    fn input(m: usize, k: usize) -> Tensor {
        Tensor::from_vec(dense(m, k, 7), (m, k), &Device::Cpu).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        let a = a.to_dtype(DType::F32).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.to_dtype(DType::F32).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a.len(), b.len());
        a.iter().zip(&b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn mode_selection_truth_table() {
        assert_eq!(select_mode(false, false), ExecutionMode::Emulate);
        assert_eq!(select_mode(false, true), ExecutionMode::Emulate);
        assert_eq!(select_mode(true, true), ExecutionMode::Emulate);
        assert_eq!(select_mode(true, false), ExecutionMode::Native);
        assert!(is_supported(70));
        assert!(!is_supported(61));
    }

    #[test]
    fn create_weights_registers_packed_and_scale() {
        let s = scheme(false, SchemeConfig::default());
        assert_eq!(s.min_capability(), 70);
        let mut layer = LinearLayer::new("qkv", &Device::Cpu);
        s.create_weights(&mut layer, &[64, 32, 32], 256, DType::BF16)
            .unwrap();

        let weight = layer.parameter(WEIGHT).unwrap();
        assert_eq!(weight.data().dims(), &[128, 128]);
        assert_eq!(weight.data().dtype(), DType::U8);
        assert!(matches!(
            weight.kind(),
            ParameterKind::Packed {
                packed_dim: 1,
                packed_factor: 2,
                ..
            }
        ));
        let scale = layer.parameter(WEIGHT_SCALE).unwrap();
        assert_eq!(scale.data().dims(), &[128, 8]);
        assert!(matches!(scale.kind(), ParameterKind::GroupScale { .. }));
        assert_eq!(layer.logical_widths(), &[64, 32, 32]);
        assert_eq!(layer.output_size_per_partition(), 128);
        assert_eq!(s.platform().memory().stats().current, 128 * 128 + 128 * 8);
    }

    #[test]
    fn create_weights_rejects_unpackable_inputs() {
        let s = scheme(false, SchemeConfig::default());
        for input in [33, 48, 0] {
            let mut layer = LinearLayer::new("bad", &Device::Cpu);
            let err = s.create_weights(&mut layer, &[32], input, DType::BF16);
            assert!(
                matches!(err, Err(SchemeError::InvalidShape { .. })),
                "input {input}"
            );
        }
    }

    #[test]
    fn native_construction_requires_kernels() {
        let err = W4A4Mxfp4Scheme::ocp(
            HostPlatform::new(true),
            KernelRegistry::empty(),
            SchemeConfig::default(),
        );
        assert!(matches!(err, Err(SchemeError::MissingDependency { .. })));

        // Emulation never needs the fused kernels.
        let s = W4A4Mxfp4Scheme::ocp(
            HostPlatform::new(false),
            KernelRegistry::empty(),
            SchemeConfig::default(),
        )
        .unwrap();
        assert_eq!(s.mode(), ExecutionMode::Emulate);

        let mut layer = loaded_layer(&s, 32, 64);
        let err = s.process_weights_after_loading(&mut layer);
        assert!(matches!(err, Err(SchemeError::MissingDependency { .. })));
        assert!(layer.parameter(WEIGHT).is_some());

        // Registering a quantizer backend after the fact makes the same layer finalizable.
        let s = W4A4Mxfp4Scheme::ocp(
            HostPlatform::new(false),
            KernelRegistry::empty().with_quantizer(Arc::new(ReferenceQuantizerBackend)),
            SchemeConfig::default(),
        )
        .unwrap();
        s.process_weights_after_loading(&mut layer).unwrap();
        assert!(layer.is_finalized());
    }

    #[test]
    fn native_rejects_non_ocp_block_size() {
        let specs = || {
            (
                QuantSpec::mxfp4_with_block(16, false),
                QuantSpec::mxfp4_with_block(16, true),
            )
        };
        let (w, i) = specs();
        let err = W4A4Mxfp4Scheme::new(
            w,
            i,
            HostPlatform::new(true),
            KernelRegistry::reference(),
            SchemeConfig::default(),
        );
        assert!(matches!(err, Err(SchemeError::InvalidConfig { .. })));

        // Emulation quant-dequantizes in software at any block size.
        let (w, i) = specs();
        let s = W4A4Mxfp4Scheme::new(
            w,
            i,
            HostPlatform::new(false),
            KernelRegistry::reference(),
            SchemeConfig::default().with_out_dtype(DType::F32),
        )
        .unwrap();
        let mut layer = loaded_layer(&s, 32, 64);
        s.process_weights_after_loading(&mut layer).unwrap();
        let y = s.apply_weights(&layer, &input(2, 64), None).unwrap();
        assert_eq!(y.dims(), &[2, 32]);
    }

    #[test]
    fn emulate_materializes_weight_once() {
        let config = SchemeConfig::default().with_out_dtype(DType::F32);
        let s = scheme(false, config);
        let mut layer = loaded_layer(&s, 32, 64);
        assert!(matches!(
            s.apply_weights(&layer, &input(2, 64), None),
            Err(SchemeError::NotFinalized)
        ));

        s.process_weights_after_loading(&mut layer).unwrap();
        assert!(layer.is_finalized());
        assert!(matches!(
            layer.finalized,
            Some(FinalizedWeights::Dequantized { .. })
        ));
        assert!(layer.parameter(WEIGHT).is_none());
        assert!(layer.parameter(WEIGHT_SCALE).is_none());
        let stats = s.platform().memory().stats();
        assert_eq!(stats.current, 32 * 64 * 4);
        assert_eq!(stats.cached, 0);

        assert!(matches!(
            s.process_weights_after_loading(&mut layer),
            Err(SchemeError::AlreadyFinalized)
        ));
        let fresh = Tensor::zeros((32usize, 32usize), DType::U8, &Device::Cpu).unwrap();
        assert!(layer.load_weight(WEIGHT, &fresh, None).is_err());
    }

    #[test]
    fn lazy_dequantization_is_stable() {
        let config = SchemeConfig {
            emu_mem_opt: true,
            ..SchemeConfig::default()
        };
        // Memory-opt forces emulation even on MX hardware.
        let s = scheme(true, config.with_out_dtype(DType::F32));
        assert_eq!(s.mode(), ExecutionMode::Emulate);
        let mut layer = loaded_layer(&s, 32, 64);
        s.process_weights_after_loading(&mut layer).unwrap();

        let Some(FinalizedWeights::Lazy { weight, quantizer }) = &layer.finalized else {
            panic!("expected lazy weights, got {:?}", layer.finalized);
        };
        let a: Vec<Vec<f32>> = quantizer.dequantize(weight).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = quantizer.dequantize(weight).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);

        let x = input(3, 64);
        let y1: Vec<Vec<f32>> = s.apply_weights(&layer, &x, None).unwrap().to_vec2().unwrap();
        let y2: Vec<Vec<f32>> = s.apply_weights(&layer, &x, None).unwrap().to_vec2().unwrap();
        assert_eq!(y1, y2);
    }

    #[test]
    fn emulate_matches_dense_reference() {
        let (n, k, block, m) = (4, 8, 4, 2);
        let s = W4A4Mxfp4Scheme::new(
            QuantSpec::mxfp4_with_block(block, false),
            QuantSpec::mxfp4_with_block(block, true),
            HostPlatform::new(false),
            KernelRegistry::reference(),
            SchemeConfig::default().with_out_dtype(DType::F32),
        )
        .unwrap();
        let device = Device::Cpu;

        let w = dense(n, k, 3);
        let (packed, scales) = quantize_mxfp4(&w, n, k, block).unwrap();
        let mut layer = LinearLayer::new("tiny", &device);
        s.create_weights(&mut layer, &[n], k, DType::F32).unwrap();
        layer
            .load_weight(WEIGHT, &Tensor::from_vec(packed.clone(), (n, k / 2), &device).unwrap(), None)
            .unwrap();
        layer
            .load_weight(
                WEIGHT_SCALE,
                &Tensor::from_vec(scales.clone(), (n, k / block), &device).unwrap(),
                None,
            )
            .unwrap();
        s.process_weights_after_loading(&mut layer).unwrap();

        let x = dense(m, k, 5);
        let bias = vec![0.5f32, -1.0, 0.0, 2.0];
        let y: Vec<Vec<f32>> = s
            .apply_weights(
                &layer,
                &Tensor::from_vec(x.clone(), (m, k), &device).unwrap(),
                Some(&Tensor::from_vec(bias.clone(), n, &device).unwrap()),
            )
            .unwrap()
            .to_vec2()
            .unwrap();

        let w_deq = dequantize_mxfp4(&packed, &scales, n, k, block).unwrap();
        let x_qdq = quant_dequant_mxfp4(&x, k, block).unwrap();
        for i in 0..m {
            for j in 0..n {
                let expected: f32 = (0..k).map(|c| x_qdq[i * k + c] * w_deq[j * k + c]).sum::<f32>()
                    + bias[j];
                assert!(
                    (y[i][j] - expected).abs() < 1e-4,
                    "y[{i}][{j}] = {} expected {expected}",
                    y[i][j]
                );
            }
        }
    }

    #[test]
    fn native_default_matches_emulation() {
        let f32_config = SchemeConfig::default().with_out_dtype(DType::F32);
        let native = scheme(true, f32_config);
        let emulate = scheme(false, f32_config);
        assert_eq!(native.mode(), ExecutionMode::Native);

        let mut native_layer = loaded_layer(&native, 32, 256);
        let mut emulate_layer = loaded_layer(&emulate, 32, 256);
        native.process_weights_after_loading(&mut native_layer).unwrap();
        emulate.process_weights_after_loading(&mut emulate_layer).unwrap();

        let Some(FinalizedWeights::Native { weight_scale, layout, .. }) = &native_layer.finalized else {
            panic!("expected native weights");
        };
        assert_eq!(*layout, ScaleLayout::Transposed);
        assert_eq!(weight_scale.dims(), &[8, 32]);

        let x = input(6, 256);
        let bias = Tensor::ones(32, DType::F32, &Device::Cpu).unwrap();
        let a = native.apply_weights(&native_layer, &x, Some(&bias)).unwrap();
        let b = emulate.apply_weights(&emulate_layer, &x, Some(&bias)).unwrap();
        assert_eq!(a.dims(), &[6, 32]);
        assert!(max_abs_diff(&a, &b) < 1e-2);

        // Precomputed activations skip the quant kernel and give the same result.
        let act = KernelRegistry::reference()
            .act_quant()
            .unwrap()
            .quantize(&x)
            .unwrap();
        let c = native
            .apply_with_activation(&native_layer, &x, Some(&act), Some(&bias))
            .unwrap();
        assert_eq!(max_abs_diff(&a, &c), 0.0);
    }

    #[test]
    fn leading_dimensions_are_restored() {
        let s = scheme(false, SchemeConfig::default().with_out_dtype(DType::F32));
        let mut layer = loaded_layer(&s, 32, 64);
        s.process_weights_after_loading(&mut layer).unwrap();
        let x = input(6, 64).reshape((2usize, 3usize, 64usize)).unwrap();
        let y = s.apply_weights(&layer, &x, None).unwrap();
        assert_eq!(y.dims(), &[2, 3, 32]);
        assert!(s.apply_weights(&layer, &input(2, 32), None).is_err());
    }

    struct RecordingGemm {
        inner: Arc<dyn Mxfp4GemmKernel>,
        rows: Mutex<Vec<usize>>,
    }

    impl Mxfp4GemmKernel for RecordingGemm {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn gemm(
            &self,
            x_q: &Tensor,
            w_q: &Tensor,
            x_s: &Tensor,
            w_s: &Tensor,
            out_dtype: DType,
        ) -> Result<Tensor> {
            self.rows.lock().unwrap().push(x_q.dims()[0]);
            self.inner.gemm(x_q, w_q, x_s, w_s, out_dtype)
        }
    }

    #[test]
    fn asm_gemm_pads_rows_and_truncates_output() {
        let asm = Arc::new(RecordingGemm {
            inner: Arc::new(ReferenceAsmGemm),
            rows: Mutex::new(Vec::new()),
        });
        let preshuffled = Arc::new(RecordingGemm {
            inner: KernelRegistry::reference()
                .gemm_for(GemmVariant::Preshuffled)
                .unwrap()
                .clone(),
            rows: Mutex::new(Vec::new()),
        });
        let kernels = KernelRegistry::reference()
            .with_gemm(GemmVariant::Asm, asm.clone())
            .with_gemm(GemmVariant::Preshuffled, preshuffled.clone());
        let config = SchemeConfig {
            use_asm_gemm: true,
            ..SchemeConfig::default()
        }
        .with_out_dtype(DType::F32);
        let s = W4A4Mxfp4Scheme::ocp(HostPlatform::new(true), kernels, config).unwrap();

        let mut layer = loaded_layer(&s, 32, 256);
        s.process_weights_after_loading(&mut layer).unwrap();

        let y = s.apply_weights(&layer, &input(200, 256), None).unwrap();
        assert_eq!(y.dims(), &[200, 32]);
        assert_eq!(*asm.rows.lock().unwrap(), vec![256]);

        let y = s.apply_weights(&layer, &input(128, 256), None).unwrap();
        assert_eq!(y.dims(), &[128, 32]);
        assert_eq!(*preshuffled.rows.lock().unwrap(), vec![128]);
        assert_eq!(asm.rows.lock().unwrap().len(), 1);
    }

    #[test]
    fn asm_and_default_paths_agree() {
        let f32_config = SchemeConfig::default().with_out_dtype(DType::F32);
        let default = scheme(true, f32_config);
        let asm = scheme(
            true,
            SchemeConfig {
                use_asm_gemm: true,
                ..f32_config
            },
        );
        let mut a_layer = loaded_layer(&default, 32, 256);
        let mut b_layer = loaded_layer(&asm, 32, 256);
        default.process_weights_after_loading(&mut a_layer).unwrap();
        asm.process_weights_after_loading(&mut b_layer).unwrap();

        let x = input(130, 256);
        let a = default.apply_weights(&a_layer, &x, None).unwrap();
        let b = asm.apply_weights(&b_layer, &x, None).unwrap();
        assert_eq!(b.dims(), &[130, 32]);
        assert!(max_abs_diff(&a, &b) < 1e-2);
    }
}
