// file: src/backend/mod.rs
// description: Capability probe for fused MXFP4 GEMM, activation-quant and weight-quantizer backends.
// author: cipher-rc5

pub mod reference;

use candle_core::{DType, Tensor};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::info;

use crate::error::{Result, SchemeError};
use crate::quantizer::{QuantizerBackend, ReferenceQuantizerBackend};

pub const KERNEL_PACKAGE: &str = "fused MXFP4 GEMM kernels";
pub const QUANTIZER_PACKAGE: &str = "MXFP4 weight quantizer";

/// Packed activation codes `[M, K/2]` with plain-layout scales `[M, K/B]`.
#[derive(Debug, Clone)]
pub struct QuantizedActivation {
    pub codes: Tensor,
    pub scales: Tensor,
}

impl QuantizedActivation {
    pub fn new(codes: Tensor, scales: Tensor) -> Result<Self> {
        let (rows, _) = codes.dims2()?;
        let (scale_rows, _) = scales.dims2()?;
        if codes.dtype() != DType::U8 || scales.dtype() != DType::U8 {
            return Err(SchemeError::shape(
                "quantized activation codes and scales must be U8",
            ));
        }
        if rows != scale_rows {
            return Err(SchemeError::shape(format!(
                "activation codes have {rows} rows but scales have {scale_rows}"
            )));
        }
        Ok(Self { codes, scales })
    }

    pub fn rows(&self) -> usize {
        self.codes.dims()[0]
    }

    /// Unpacked feature count `K`.
    pub fn features(&self) -> usize {
        self.codes.dims()[1] * 2
    }
}

pub trait ActivationQuantKernel: Send + Sync {
    fn name(&self) -> &'static str;

    fn quantize(&self, x: &Tensor) -> Result<QuantizedActivation>;
}

pub trait Mxfp4GemmKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// `x_q [M, K/2] @ w_q [N, K/2]^T -> [M, N]` with scales in this kernel's layout.
    fn gemm(
        &self,
        x_q: &Tensor,
        w_q: &Tensor,
        x_s: &Tensor,
        w_s: &Tensor,
        out_dtype: DType,
    ) -> Result<Tensor>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemmVariant {
    Default,
    Preshuffled,
    Asm,
}

impl GemmVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "gemm_afp4wfp4",
            Self::Preshuffled => "gemm_afp4wfp4_preshuffled_scales",
            Self::Asm => "gemm_a4w4_asm",
        }
    }
}

/// Kernel bindings resolved once; `None` means the binding is absent.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    pub act_quant: Option<Arc<dyn ActivationQuantKernel>>,
    pub gemm: Option<Arc<dyn Mxfp4GemmKernel>>,
    pub gemm_preshuffled: Option<Arc<dyn Mxfp4GemmKernel>>,
    pub gemm_asm: Option<Arc<dyn Mxfp4GemmKernel>>,
    pub quantizer: Option<Arc<dyn QuantizerBackend>>,
}

impl KernelRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every slot bound to the CPU reference implementation.
    pub fn reference() -> Self {
        Self {
            act_quant: Some(Arc::new(reference::ReferenceActivationQuant::default())),
            gemm: Some(Arc::new(reference::ReferenceGemm)),
            gemm_preshuffled: Some(Arc::new(reference::ReferencePreshuffledGemm)),
            gemm_asm: Some(Arc::new(reference::ReferenceAsmGemm)),
            quantizer: Some(Arc::new(ReferenceQuantizerBackend)),
        }
    }

    /// Resolve the bindings available to this build. Runs once per process.
    pub fn probe() -> Self {
        static PROBED: OnceLock<KernelRegistry> = OnceLock::new();
        PROBED
            .get_or_init(|| {
                let reference = Self::reference();
                let mut registry = Self::empty();
                if cfg!(feature = "reference-kernels") {
                    registry.act_quant = reference.act_quant;
                    registry.gemm = reference.gemm;
                    registry.gemm_preshuffled = reference.gemm_preshuffled;
                    registry.gemm_asm = reference.gemm_asm;
                }
                if cfg!(feature = "emulation") {
                    registry.quantizer = reference.quantizer;
                }
                info!("kernel probe: {:?}", registry);
                registry
            })
            .clone()
    }

    pub fn with_gemm(mut self, variant: GemmVariant, kernel: Arc<dyn Mxfp4GemmKernel>) -> Self {
        match variant {
            GemmVariant::Default => self.gemm = Some(kernel),
            GemmVariant::Preshuffled => self.gemm_preshuffled = Some(kernel),
            GemmVariant::Asm => self.gemm_asm = Some(kernel),
        }
        self
    }

    pub fn with_quantizer(mut self, backend: Arc<dyn QuantizerBackend>) -> Self {
        self.quantizer = Some(backend);
        self
    }

    pub fn without_quantizer(mut self) -> Self {
        self.quantizer = None;
        self
    }

    /// Names of the native-path slots that did not resolve.
    pub fn missing_native(&self, use_asm_gemm: bool) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.act_quant.is_none() {
            missing.push("dynamic_mxfp4_quant");
        }
        if self.gemm.is_none() {
            missing.push(GemmVariant::Default.as_str());
        }
        if use_asm_gemm {
            if self.gemm_preshuffled.is_none() {
                missing.push(GemmVariant::Preshuffled.as_str());
            }
            if self.gemm_asm.is_none() {
                missing.push(GemmVariant::Asm.as_str());
            }
        }
        missing
    }

    pub fn native_ready(&self, use_asm_gemm: bool) -> bool {
        self.missing_native(use_asm_gemm).is_empty()
    }

    pub fn act_quant(&self) -> Result<&Arc<dyn ActivationQuantKernel>> {
        self.act_quant
            .as_ref()
            .ok_or(SchemeError::KernelUnavailable {
                kernel: "dynamic_mxfp4_quant",
            })
    }

    pub fn gemm_for(&self, variant: GemmVariant) -> Result<&Arc<dyn Mxfp4GemmKernel>> {
        let slot = match variant {
            GemmVariant::Default => &self.gemm,
            GemmVariant::Preshuffled => &self.gemm_preshuffled,
            GemmVariant::Asm => &self.gemm_asm,
        };
        slot.as_ref().ok_or(SchemeError::KernelUnavailable {
            kernel: variant.as_str(),
        })
    }

    pub fn quantizer(&self) -> Result<&Arc<dyn QuantizerBackend>> {
        self.quantizer.as_ref().ok_or_else(|| {
            SchemeError::missing(
                QUANTIZER_PACKAGE,
                "the emulation path needs a quantizer backend; build with the `emulation` feature \
                 or register one with KernelRegistry::with_quantizer",
            )
        })
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("act_quant", &self.act_quant.as_ref().map(|k| k.name()))
            .field("gemm", &self.gemm.as_ref().map(|k| k.name()))
            .field(
                "gemm_preshuffled",
                &self.gemm_preshuffled.as_ref().map(|k| k.name()),
            )
            .field("gemm_asm", &self.gemm_asm.as_ref().map(|k| k.name()))
            .field("quantizer", &self.quantizer.as_ref().map(|q| q.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_reports_every_native_slot() {
        let registry = KernelRegistry::empty();
        assert_eq!(registry.missing_native(false).len(), 2);
        assert_eq!(registry.missing_native(true).len(), 4);
        assert!(matches!(
            registry.gemm_for(GemmVariant::Asm),
            Err(SchemeError::KernelUnavailable { kernel: "gemm_a4w4_asm" })
        ));
        assert!(matches!(
            registry.quantizer(),
            Err(SchemeError::MissingDependency { .. })
        ));
    }

    #[test]
    fn reference_registry_is_complete() {
        let registry = KernelRegistry::reference();
        assert!(registry.native_ready(true));
        assert!(registry.clone().without_quantizer().quantizer().is_err());
        assert!(registry.quantizer().is_ok());
        let dbg = format!("{registry:?}");
        assert!(dbg.contains("reference"));
    }

    #[test]
    fn probe_is_stable() {
        let a = format!("{:?}", KernelRegistry::probe());
        let b = format!("{:?}", KernelRegistry::probe());
        assert_eq!(a, b);
    }
}
