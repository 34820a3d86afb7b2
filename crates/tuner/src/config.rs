//! Configuration for the tuner.
//!
//! Values are resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (`--config`, or ~/.config/gemm-tuner/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use gemm_core::{OperationKind, TuningParams, WeightFormat};
use serde::{Deserialize, Serialize};

/// A synthetic linear layer to tune.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    #[serde(default)]
    pub kind: OperationKind,
    pub input_dim: usize,
    /// Rows of the weight. For `fused_silu_ffn` this is the stacked
    /// gate and up projection, twice the written width.
    pub output_dim: usize,
    /// Routed experts; zero for a dense layer.
    #[serde(default)]
    pub num_experts: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub format: WeightFormat,
}

fn default_top_k() -> usize {
    2
}

impl LayerSpec {
    pub fn dense(name: &str, kind: OperationKind, input_dim: usize, output_dim: usize) -> Self {
        Self {
            name: name.to_string(),
            kind,
            input_dim,
            output_dim,
            num_experts: 0,
            top_k: default_top_k(),
            format: WeightFormat::Dense,
        }
    }

    pub fn routed(mut self, num_experts: usize, top_k: usize) -> Self {
        self.num_experts = num_experts;
        self.top_k = top_k;
        self
    }

    pub fn is_routed(&self) -> bool {
        self.num_experts > 0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(format!("layer {}: {msg}", self.name)));
        if self.input_dim == 0 || self.output_dim == 0 {
            return invalid("dimensions must be > 0".to_string());
        }
        if self.kind.output_width(self.output_dim).is_none() {
            return invalid(format!(
                "{} needs an even output_dim, got {}",
                self.kind, self.output_dim
            ));
        }
        if self.is_routed() && (self.top_k == 0 || self.top_k > self.num_experts) {
            return invalid(format!(
                "top_k {} must be in 1..={}",
                self.top_k, self.num_experts
            ));
        }
        Ok(())
    }
}

/// Layers tuned when the config names none: one decoder block of a small
/// model plus a routed feed-forward layer.
pub fn default_layers() -> Vec<LayerSpec> {
    vec![
        LayerSpec::dense("qkv_proj", OperationKind::Gemm, 512, 1536),
        LayerSpec::dense("o_proj", OperationKind::FusedAdd, 512, 512),
        LayerSpec::dense("gate_up_proj", OperationKind::FusedSiluFfn, 512, 2816),
        LayerSpec::dense("down_proj", OperationKind::FusedAdd, 1408, 512),
        LayerSpec::dense("experts.w13", OperationKind::FusedSiluFfn, 512, 1024).routed(8, 2),
        LayerSpec::dense("experts.w2", OperationKind::FusedAdd, 512, 512).routed(8, 2),
    ]
}

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunerConfig {
    /// Tuning cache file written by `tune` and read by `compare`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<PathBuf>,

    /// Device to tune on (cpu, cuda, cuda:N, metal).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Activation and weight dtype (bf16, fp16, fp32).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Untimed runs per candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmup_iters: Option<usize>,

    /// Timed runs per candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timed_iters: Option<usize>,

    /// Largest batch size of the default tuning sequence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_batch: Option<usize>,

    /// Explicit tuning sequence, e.g. "1,2,4,16:256:16".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<LayerSpec>,
}

impl TunerConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("gemm-tuner").join("config.toml"))
    }

    /// Default cache file location.
    pub fn default_cache_path() -> PathBuf {
        dirs::cache_dir()
            .map(|p| p.join("gemm-tuner"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gemm.tune")
    }

    /// Load from the default path, falling back to defaults.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &TunerConfig) {
        if other.cache_path.is_some() {
            self.cache_path = other.cache_path.clone();
        }
        if other.device.is_some() {
            self.device = other.device.clone();
        }
        if other.dtype.is_some() {
            self.dtype = other.dtype.clone();
        }
        if other.warmup_iters.is_some() {
            self.warmup_iters = other.warmup_iters;
        }
        if other.timed_iters.is_some() {
            self.timed_iters = other.timed_iters;
        }
        if other.max_batch.is_some() {
            self.max_batch = other.max_batch;
        }
        if other.seq.is_some() {
            self.seq = other.seq.clone();
        }
        if !other.layers.is_empty() {
            self.layers = other.layers.clone();
        }
    }

    /// Tuning parameters with unset values at their defaults.
    pub fn tuning_params(&self) -> TuningParams {
        let defaults = TuningParams::default();
        TuningParams {
            warmup_iters: self.warmup_iters.unwrap_or(defaults.warmup_iters),
            timed_iters: self.timed_iters.unwrap_or(defaults.timed_iters),
            max_batch: self.max_batch.unwrap_or(defaults.max_batch),
            seq: self.seq.clone().or(defaults.seq),
        }
    }

    /// Configured layers, or [`default_layers`] when none are set.
    pub fn layers(&self) -> Result<Vec<LayerSpec>, ConfigError> {
        let layers = if self.layers.is_empty() {
            default_layers()
        } else {
            self.layers.clone()
        };
        for layer in &layers {
            layer.validate()?;
        }
        Ok(layers)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache_path
            .clone()
            .unwrap_or_else(Self::default_cache_path)
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
    /// A value that parses but cannot be used.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
