//! Problem signatures and tuning records.

use std::fmt;

use crate::variant::{KernelVariant, OperationKind};
use crate::weight::{LayoutTag, WeightDescriptor};

/// Cache key for a tuning decision.
///
/// Two calls with equal signatures share one decision regardless of the
/// data they carry. Grouped (MoE) calls have `num_experts > 0` and use the
/// total routed token count as `batch_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProblemSignature {
    pub kind: OperationKind,
    pub batch_size: u32,
    pub input_dim: u32,
    pub output_dim: u32,
    pub layout: LayoutTag,
    pub num_experts: u32,
}

fn saturating_u32(v: usize) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

impl ProblemSignature {
    pub fn dense(kind: OperationKind, batch_size: usize, weight: &dyn WeightDescriptor) -> Self {
        Self {
            kind,
            batch_size: saturating_u32(batch_size),
            input_dim: saturating_u32(weight.input_dim()),
            output_dim: saturating_u32(weight.output_dim()),
            layout: weight.layout(),
            num_experts: 0,
        }
    }

    pub fn grouped(
        kind: OperationKind,
        routed_tokens: usize,
        num_experts: usize,
        weight: &dyn WeightDescriptor,
    ) -> Self {
        Self {
            num_experts: saturating_u32(num_experts.max(1)),
            ..Self::dense(kind, routed_tokens, weight)
        }
    }

    pub fn is_grouped(&self) -> bool {
        self.num_experts > 0
    }
}

impl fmt::Display for ProblemSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} m={} k={} n={} {}",
            self.kind, self.batch_size, self.input_dim, self.output_dim, self.layout
        )?;
        if self.is_grouped() {
            write!(f, " experts={}", self.num_experts)?;
        }
        Ok(())
    }
}

/// The best-known variant for a signature and its measured cost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningRecord {
    pub signature: ProblemSignature,
    pub variant: KernelVariant,
    /// Microseconds per execution.
    pub cost_us: f64,
}
