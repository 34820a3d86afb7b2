//! Epilogue selection and the unfused epilogue passes.
//!
//! The selector decides which [`KernelVariant`]s may serve a request and
//! prepares the (masked) LoRA delta that is added to the raw product before
//! any epilogue runs.

use candle_core::{Tensor, D};

use crate::error::{DispatchError, Result};
use crate::variant::{KernelVariant, OperationKind};

/// Optional LoRA contribution for a `forward` call.
///
/// `delta` is the precomputed low-rank product `[batch_size, output_dim]`;
/// `mask` is a 1-D tensor of length `batch_size` where a nonzero entry
/// enables the delta for that row. A delta without a mask applies to every
/// row. A mask without a delta is length-checked and otherwise ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoraInput<'a> {
    pub delta: Option<&'a Tensor>,
    pub mask: Option<&'a Tensor>,
}

impl<'a> LoraInput<'a> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all_rows(delta: &'a Tensor) -> Self {
        Self {
            delta: Some(delta),
            mask: None,
        }
    }

    pub fn masked(delta: &'a Tensor, mask: &'a Tensor) -> Self {
        Self {
            delta: Some(delta),
            mask: Some(mask),
        }
    }

    pub fn is_none(&self) -> bool {
        self.delta.is_none() && self.mask.is_none()
    }
}

/// Variants that can serve `kind`, in priority order.
pub fn candidates(kind: OperationKind, grouped: bool) -> Vec<KernelVariant> {
    KernelVariant::ALL
        .iter()
        .copied()
        .filter(|v| v.is_applicable(kind, grouped))
        .collect()
}

/// Validate the LoRA inputs and fold the mask into the delta.
///
/// Returns `None` when there is nothing to add.
pub fn prepare_lora(
    lora: LoraInput<'_>,
    batch_size: usize,
    product_width: usize,
) -> Result<Option<Tensor>> {
    if let Some(mask) = lora.mask {
        let len = mask.elem_count();
        if mask.rank() > 1 || len != batch_size {
            return Err(DispatchError::shape(format!(
                "lora mask has shape {:?}, expected [{batch_size}]",
                mask.dims()
            )));
        }
    }

    let Some(delta) = lora.delta else {
        return Ok(None);
    };
    let (rows, cols) = delta.dims2().map_err(|_| {
        DispatchError::shape(format!(
            "lora delta has shape {:?}, expected [{batch_size}, {product_width}]",
            delta.dims()
        ))
    })?;
    if rows != batch_size || cols != product_width {
        return Err(DispatchError::shape(format!(
            "lora delta is [{rows}, {cols}], expected [{batch_size}, {product_width}]"
        )));
    }

    let Some(mask) = lora.mask else {
        return Ok(Some(delta.clone()));
    };
    let keep = mask
        .flatten_all()?
        .ne(0f64)?
        .reshape((batch_size, 1))?
        .broadcast_as((batch_size, product_width))?;
    let masked = keep.where_cond(delta, &delta.zeros_like()?)?;
    Ok(Some(masked))
}

/// Add the LoRA delta to a raw product.
pub fn add_lora(raw: Tensor, delta: Option<&Tensor>) -> candle_core::Result<Tensor> {
    match delta {
        Some(d) => raw.add(&d.to_dtype(raw.dtype())?),
        None => Ok(raw),
    }
}

/// `silu(gate) * up` over a `[rows, 2h]` product split into halves.
pub fn silu_combine(raw: &Tensor) -> candle_core::Result<Tensor> {
    let width = raw.dim(D::Minus1)?;
    let half = width / 2;
    let gate = raw.narrow(1, 0, half)?;
    let up = raw.narrow(1, half, half)?;
    candle_nn::ops::silu(&gate)?.mul(&up)
}

/// Run the epilogue for `kind` as a separate pass over a raw product.
///
/// `FusedAdd` without a residual is the identity; grouped calls accumulate
/// during the scatter instead.
pub fn finish(
    kind: OperationKind,
    raw: Tensor,
    residual: Option<&Tensor>,
) -> candle_core::Result<Tensor> {
    match kind {
        OperationKind::Gemm => Ok(raw),
        OperationKind::FusedSiluFfn => silu_combine(&raw),
        OperationKind::FusedAdd => match residual {
            Some(r) => r.add(&raw),
            None => Ok(raw),
        },
    }
}
