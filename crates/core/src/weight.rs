//! Weight descriptors consumed by the dispatcher.
//!
//! The dispatcher never looks inside a weight beyond its shape, its layout
//! tag (which becomes part of the tuning key) and the matrices it hands to
//! the kernel backend.

use std::fmt;

use candle_core::{DType, IndexOp, Tensor};
use candle_nn::{linear_no_bias, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Storage format of a weight matrix.
///
/// Only used to tell otherwise identical shapes apart in the tuning cache;
/// a backend that executes quantized formats is expected to hand the
/// dispatcher the matching descriptor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WeightFormat {
    #[default]
    Dense,
    Fp8,
    Int8,
    Int4Gptq,
    Int4Awq,
    Gguf,
}

impl WeightFormat {
    pub fn code(self) -> u8 {
        match self {
            WeightFormat::Dense => 0,
            WeightFormat::Fp8 => 1,
            WeightFormat::Int8 => 2,
            WeightFormat::Int4Gptq => 3,
            WeightFormat::Int4Awq => 4,
            WeightFormat::Gguf => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(WeightFormat::Dense),
            1 => Some(WeightFormat::Fp8),
            2 => Some(WeightFormat::Int8),
            3 => Some(WeightFormat::Int4Gptq),
            4 => Some(WeightFormat::Int4Awq),
            5 => Some(WeightFormat::Gguf),
            _ => None,
        }
    }
}

impl fmt::Display for WeightFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightFormat::Dense => write!(f, "dense"),
            WeightFormat::Fp8 => write!(f, "fp8"),
            WeightFormat::Int8 => write!(f, "int8"),
            WeightFormat::Int4Gptq => write!(f, "int4-gptq"),
            WeightFormat::Int4Awq => write!(f, "int4-awq"),
            WeightFormat::Gguf => write!(f, "gguf"),
        }
    }
}

/// Dtype names in code order. Codes are persisted, so only append.
const DTYPE_NAMES: [&str; 7] = ["u8", "u32", "i64", "bf16", "f16", "f32", "f64"];
const UNKNOWN_DTYPE: u8 = u8::MAX;

/// Layout/quantization tag of a weight, part of every problem signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayoutTag {
    format: WeightFormat,
    dtype: u8,
}

impl LayoutTag {
    pub fn new(dtype: DType, format: WeightFormat) -> Self {
        let name = dtype.as_str();
        let dtype = DTYPE_NAMES
            .iter()
            .position(|&n| n == name)
            .map(|p| p as u8)
            .unwrap_or(UNKNOWN_DTYPE);
        Self { format, dtype }
    }

    pub fn dense(dtype: DType) -> Self {
        Self::new(dtype, WeightFormat::Dense)
    }

    pub fn format(&self) -> WeightFormat {
        self.format
    }

    pub fn dtype_name(&self) -> &'static str {
        DTYPE_NAMES
            .get(self.dtype as usize)
            .copied()
            .unwrap_or("unknown")
    }

    /// Packed persistent form: `format << 8 | dtype`.
    pub fn to_bits(self) -> u32 {
        (u32::from(self.format.code()) << 8) | u32::from(self.dtype)
    }

    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits >> 16 != 0 {
            return Err(DispatchError::corrupt(format!(
                "layout tag {bits:#x} has reserved bits set"
            )));
        }
        let format = WeightFormat::from_code((bits >> 8) as u8).ok_or_else(|| {
            DispatchError::corrupt(format!("unknown weight format code {}", bits >> 8))
        })?;
        Ok(Self {
            format,
            dtype: (bits & 0xff) as u8,
        })
    }
}

impl fmt::Display for LayoutTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.format, self.dtype_name())
    }
}

/// What the dispatcher needs to know about a linear layer's weight.
///
/// Matrices are returned in `[output_dim, input_dim]` orientation, the same
/// as `candle_nn::Linear`.
pub trait WeightDescriptor: Send + Sync {
    fn input_dim(&self) -> usize;

    fn output_dim(&self) -> usize;

    fn layout(&self) -> LayoutTag;

    /// Number of stacked experts. Plain linear layers have one.
    fn num_experts(&self) -> usize {
        1
    }

    /// Matrix used by non-routed `forward` calls.
    fn matrix(&self) -> Result<Tensor>;

    /// Matrix of a single expert.
    fn expert(&self, expert: usize) -> Result<Tensor>;
}

/// Weight held as a plain candle tensor, either `[out, in]` or stacked
/// experts `[num_experts, out, in]`.
#[derive(Debug, Clone)]
pub struct DenseWeight {
    weight: Tensor,
    format: WeightFormat,
}

impl DenseWeight {
    pub fn new(weight: Tensor) -> Result<Self> {
        match weight.rank() {
            2 | 3 => Ok(Self {
                weight,
                format: WeightFormat::Dense,
            }),
            r => Err(DispatchError::shape(format!(
                "weight must be [out, in] or [experts, out, in], got rank {r}"
            ))),
        }
    }

    /// Stack per-expert `[out, in]` matrices into one descriptor.
    pub fn from_experts(experts: &[Tensor]) -> Result<Self> {
        if experts.is_empty() {
            return Err(DispatchError::shape("no expert weights given"));
        }
        let stacked = Tensor::stack(experts, 0)?;
        Self::new(stacked)
    }

    /// Load an `[out, in]` weight the way `candle_nn::linear_no_bias` does.
    pub fn load(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        let linear = linear_no_bias(in_features, out_features, vb)?;
        Self::new(linear.weight().clone())
    }

    /// Tag the weight with a storage format for tuning-key purposes.
    pub fn with_format(mut self, format: WeightFormat) -> Self {
        self.format = format;
        self
    }

    pub fn tensor(&self) -> &Tensor {
        &self.weight
    }

    fn dims(&self) -> (usize, usize) {
        let dims = self.weight.dims();
        let r = dims.len();
        (dims[r - 2], dims[r - 1])
    }
}

impl WeightDescriptor for DenseWeight {
    fn input_dim(&self) -> usize {
        self.dims().1
    }

    fn output_dim(&self) -> usize {
        self.dims().0
    }

    fn layout(&self) -> LayoutTag {
        LayoutTag::new(self.weight.dtype(), self.format)
    }

    fn num_experts(&self) -> usize {
        if self.weight.rank() == 3 {
            self.weight.dims()[0]
        } else {
            1
        }
    }

    fn matrix(&self) -> Result<Tensor> {
        match self.weight.rank() {
            2 => Ok(self.weight.clone()),
            _ if self.num_experts() == 1 => Ok(self.weight.i(0)?),
            _ => Err(DispatchError::shape(format!(
                "weight stacks {} experts; use forward_moe",
                self.num_experts()
            ))),
        }
    }

    fn expert(&self, expert: usize) -> Result<Tensor> {
        if expert >= self.num_experts() {
            return Err(DispatchError::shape(format!(
                "expert {expert} out of range for {} experts",
                self.num_experts()
            )));
        }
        match self.weight.rank() {
            2 => Ok(self.weight.clone()),
            _ => Ok(self.weight.i(expert)?),
        }
    }
}
