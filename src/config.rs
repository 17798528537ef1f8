use anyhow::{Context, Result};
use candle_core::DType;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::OnceLock;

use crate::dtype::OCP_MX_BLOCK_SIZE;
use crate::error::SchemeError;

pub const EMU_MEM_OPT_ENV: &str = "OXIDIZED_MXFP4_EMU_MEM_OPT";
pub const USE_ASM_GEMM_ENV: &str = "OXIDIZED_MXFP4_USE_ASM_GEMM";

/// Per-tensor quantization spec as exported by the quantization toolkit.
/// Keys this crate does not interpret are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuantSpec {
    pub dtype: String,
    #[serde(default = "default_qscheme")]
    pub qscheme: String,
    #[serde(default = "default_group_size")]
    pub group_size: Option<usize>,
    #[serde(default)]
    pub scale_format: Option<String>,
    #[serde(default)]
    pub is_dynamic: bool,
    #[serde(default)]
    pub ch_axis: Option<i64>,
    #[serde(default)]
    pub round_method: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_qscheme() -> String {
    "per_group".to_string()
}

fn default_group_size() -> Option<usize> {
    Some(OCP_MX_BLOCK_SIZE)
}

impl QuantSpec {
    pub fn mxfp4(is_dynamic: bool) -> Self {
        Self::mxfp4_with_block(OCP_MX_BLOCK_SIZE, is_dynamic)
    }

    pub fn mxfp4_with_block(block_size: usize, is_dynamic: bool) -> Self {
        Self {
            dtype: "fp4".to_string(),
            qscheme: default_qscheme(),
            group_size: Some(block_size),
            scale_format: Some("e8m0".to_string()),
            is_dynamic,
            ch_axis: Some(-1),
            round_method: Some("half_even".to_string()),
            extra: HashMap::new(),
        }
    }

    pub fn from_value(value: serde_json::Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn block_size(&self) -> usize {
        self.group_size.unwrap_or(OCP_MX_BLOCK_SIZE)
    }

    pub fn is_mxfp4(&self) -> bool {
        self.dtype.eq_ignore_ascii_case("fp4")
            && self.qscheme == "per_group"
            && self
                .scale_format
                .as_deref()
                .map_or(true, |f| f.eq_ignore_ascii_case("e8m0"))
    }

    pub fn validate(&self, role: &str) -> crate::Result<()> {
        if !self.is_mxfp4() {
            return Err(SchemeError::config(format!(
                "{role} spec is not MXFP4 (dtype={}, qscheme={}, scale_format={:?})",
                self.dtype, self.qscheme, self.scale_format
            )));
        }
        if self.block_size() == 0 || self.block_size() % 2 != 0 {
            return Err(SchemeError::config(format!(
                "{role} group_size must be a positive even number, got {}",
                self.block_size()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayerQuantConfig {
    pub weight: Option<QuantSpec>,
    pub input_tensors: Option<QuantSpec>,
    #[serde(default)]
    pub output_tensors: Option<QuantSpec>,
    #[serde(default)]
    pub bias: Option<QuantSpec>,
}

/// `quantization_config` block of a Quark-exported checkpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct QuarkConfig {
    pub quant_method: String,
    pub global_quant_config: LayerQuantConfig,
    /// Pattern overrides in file order; the first matching pattern wins.
    #[serde(default, deserialize_with = "ordered_layer_configs")]
    pub layer_quant_config: Vec<(String, LayerQuantConfig)>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn ordered_layer_configs<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<(String, LayerQuantConfig)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedVisitor;

    impl<'de> Visitor<'de> for OrderedVisitor {
        type Value = Vec<(String, LayerQuantConfig)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of layer name patterns to quantization configs")
        }

        fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry::<String, LayerQuantConfig>()? {
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_any(OrderedVisitor)
}

#[derive(Deserialize)]
struct ModelConfigFile {
    quantization_config: Option<QuarkConfig>,
}

impl QuarkConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let config_path = path.join("config.json");
        let file = File::open(&config_path)
            .with_context(|| format!("Failed to open config.json at {:?}", config_path))?;
        let config: ModelConfigFile = serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse config.json at {:?}", config_path))?;
        let quant = config
            .quantization_config
            .with_context(|| format!("config.json at {:?} has no quantization_config", config_path))?;
        anyhow::ensure!(
            quant.quant_method == "quark",
            "unsupported quant_method '{}', expected 'quark'",
            quant.quant_method
        );
        Ok(quant)
    }

    pub fn is_layer_skipped(&self, layer_name: &str) -> bool {
        self.exclude
            .iter()
            .any(|pattern| wildcard_match(pattern, layer_name))
    }

    /// Layer-specific config when a pattern matches, the global config otherwise.
    pub fn layer_config(&self, layer_name: &str) -> &LayerQuantConfig {
        self.layer_quant_config
            .iter()
            .find(|(pattern, _)| wildcard_match(pattern, layer_name))
            .map(|(_, cfg)| cfg)
            .unwrap_or(&self.global_quant_config)
    }

    /// `(weight, input)` specs for a layer, if it is quantized W4A4 MXFP4.
    pub fn specs_for_layer(&self, layer_name: &str) -> Option<(QuantSpec, QuantSpec)> {
        if self.is_layer_skipped(layer_name) {
            return None;
        }
        let cfg = self.layer_config(layer_name);
        match (&cfg.weight, &cfg.input_tensors) {
            (Some(w), Some(i)) if is_w4a4_mxfp4(w, i) => Some((w.clone(), i.clone())),
            _ => None,
        }
    }
}

/// Weight is static MXFP4 and input is dynamic MXFP4.
pub fn is_w4a4_mxfp4(weight: &QuantSpec, input: &QuantSpec) -> bool {
    weight.is_mxfp4() && input.is_mxfp4() && !weight.is_dynamic && input.is_dynamic
}

fn wildcard_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((prefix, rest)) => {
            let Some(tail) = name.strip_prefix(prefix) else {
                return false;
            };
            if rest.is_empty() {
                return true;
            }
            (0..=tail.len())
                .filter(|&i| tail.is_char_boundary(i))
                .any(|i| wildcard_match(rest, &tail[i..]))
        }
    }
}

/// Process-level switches for the scheme, fixed for the lifetime of an instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchemeConfig {
    /// Keep a lazy quantizer instead of a materialized dequantized weight.
    pub emu_mem_opt: bool,
    /// Use block-shuffled scales with the preshuffled / asm GEMM kernels.
    pub use_asm_gemm: bool,
    pub out_dtype: DType,
}

impl Default for SchemeConfig {
    fn default() -> Self {
        Self {
            emu_mem_opt: false,
            use_asm_gemm: false,
            out_dtype: DType::BF16,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

impl SchemeConfig {
    pub fn from_env() -> Self {
        Self {
            emu_mem_opt: env_flag(EMU_MEM_OPT_ENV),
            use_asm_gemm: env_flag(USE_ASM_GEMM_ENV),
            ..Self::default()
        }
    }

    /// Environment snapshot taken on first use and never re-read.
    pub fn global() -> Self {
        static CONFIG: OnceLock<SchemeConfig> = OnceLock::new();
        *CONFIG.get_or_init(Self::from_env)
    }

    pub fn with_out_dtype(mut self, out_dtype: DType) -> Self {
        self.out_dtype = out_dtype;
        self
    }
}
