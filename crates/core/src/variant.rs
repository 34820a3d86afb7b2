//! Operation kinds and the closed set of kernel variants tuning chooses from.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a linear call computes, independent of how it is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// `output = x · Wᵀ`
    #[default]
    Gemm,
    /// Product is `[gate | up]`; `output = silu(gate) * up`.
    FusedSiluFfn,
    /// `output += x · Wᵀ`
    FusedAdd,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Gemm,
        OperationKind::FusedSiluFfn,
        OperationKind::FusedAdd,
    ];

    pub fn code(self) -> u8 {
        match self {
            OperationKind::Gemm => 0,
            OperationKind::FusedSiluFfn => 1,
            OperationKind::FusedAdd => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(OperationKind::Gemm),
            1 => Some(OperationKind::FusedSiluFfn),
            2 => Some(OperationKind::FusedAdd),
            _ => None,
        }
    }

    /// Width of the written output for a weight with `output_dim` rows.
    ///
    /// Returns `None` when the gated combine cannot split the product.
    pub fn output_width(self, output_dim: usize) -> Option<usize> {
        match self {
            OperationKind::Gemm | OperationKind::FusedAdd => Some(output_dim),
            OperationKind::FusedSiluFfn => {
                (output_dim % 2 == 0 && output_dim > 0).then_some(output_dim / 2)
            }
        }
    }

    /// Whether the result accumulates into the existing output.
    pub fn accumulates(self) -> bool {
        matches!(self, OperationKind::FusedAdd)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Gemm => write!(f, "gemm"),
            OperationKind::FusedSiluFfn => write!(f, "fused_silu_ffn"),
            OperationKind::FusedAdd => write!(f, "fused_add"),
        }
    }
}

/// How the epilogue is executed relative to the product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Fusion {
    /// Plain product; the epilogue runs as a separate pass.
    Unfused,
    /// Residual add folded into the product kernel.
    FusedAdd,
    /// Gated SiLU combine folded into the product kernel.
    FusedSiluFfn,
}

impl fmt::Display for Fusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fusion::Unfused => write!(f, "unfused"),
            Fusion::FusedAdd => write!(f, "fused_add"),
            Fusion::FusedSiluFfn => write!(f, "fused_silu_ffn"),
        }
    }
}

/// Row-block size the kernel processes per launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TileShape {
    Small,
    Medium,
    Large,
}

impl TileShape {
    pub fn block_m(self) -> usize {
        match self {
            TileShape::Small => 16,
            TileShape::Medium => 64,
            TileShape::Large => 128,
        }
    }
}

/// One executable strategy: an epilogue fusion and a tile shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelVariant {
    pub fusion: Fusion,
    pub tile: TileShape,
}

impl KernelVariant {
    /// Every variant in priority order. The position is the persisted
    /// variant id, so new variants are only ever appended.
    pub const ALL: [KernelVariant; 9] = [
        KernelVariant::new(Fusion::Unfused, TileShape::Small),
        KernelVariant::new(Fusion::Unfused, TileShape::Medium),
        KernelVariant::new(Fusion::Unfused, TileShape::Large),
        KernelVariant::new(Fusion::FusedAdd, TileShape::Small),
        KernelVariant::new(Fusion::FusedAdd, TileShape::Medium),
        KernelVariant::new(Fusion::FusedAdd, TileShape::Large),
        KernelVariant::new(Fusion::FusedSiluFfn, TileShape::Small),
        KernelVariant::new(Fusion::FusedSiluFfn, TileShape::Medium),
        KernelVariant::new(Fusion::FusedSiluFfn, TileShape::Large),
    ];

    /// Used on a cache miss in execute mode.
    pub const DEFAULT: KernelVariant = KernelVariant::new(Fusion::Unfused, TileShape::Medium);

    pub const fn new(fusion: Fusion, tile: TileShape) -> Self {
        Self { fusion, tile }
    }

    pub fn id(&self) -> u16 {
        Self::ALL
            .iter()
            .position(|v| v == self)
            .map(|p| p as u16)
            .unwrap_or(u16::MAX)
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    /// Whether this variant computes `kind` correctly.
    ///
    /// Grouped (MoE) calls scatter with accumulation, so the residual add is
    /// never folded into the per-expert kernel there.
    pub fn is_applicable(&self, kind: OperationKind, grouped: bool) -> bool {
        match self.fusion {
            Fusion::Unfused => true,
            Fusion::FusedAdd => kind == OperationKind::FusedAdd && !grouped,
            Fusion::FusedSiluFfn => kind == OperationKind::FusedSiluFfn,
        }
    }
}

impl Default for KernelVariant {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for KernelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/m{}", self.fusion, self.tile.block_m())
    }
}
