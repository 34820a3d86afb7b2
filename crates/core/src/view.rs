//! Strided (pitched) views over input activations.
//!
//! A [`StridedView`] lets callers hand the dispatcher a slice of a larger,
//! padded activation buffer without copying it first. Row `i` of the logical
//! matrix starts at element `i * pitch` of the underlying buffer, or at
//! `i * row_len` when the pitch is zero.

use candle_core::{Tensor, D};

use crate::error::{DispatchError, Result};

/// Borrowed, read-only view of an input matrix with an optional row pitch.
#[derive(Debug, Clone, Copy)]
pub struct StridedView<'a> {
    data: &'a Tensor,
    pitch: usize,
}

impl<'a> StridedView<'a> {
    /// View with contiguous rows (`pitch == 0`).
    pub fn new(data: &'a Tensor) -> Self {
        Self { data, pitch: 0 }
    }

    /// View whose rows start `pitch` elements apart.
    ///
    /// A pitch of zero is the same as [`StridedView::new`].
    pub fn with_pitch(data: &'a Tensor, pitch: usize) -> Self {
        Self { data, pitch }
    }

    pub fn data(&self) -> &'a Tensor {
        self.data
    }

    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// Distance in elements between consecutive row starts.
    pub fn row_stride(&self, row_len: usize) -> usize {
        if self.pitch == 0 {
            row_len
        } else {
            self.pitch
        }
    }

    /// Resolve the first `batch_size` rows of length `row_len` as a
    /// `[batch_size, row_len]` tensor.
    ///
    /// When the buffer covers `batch_size` full pitches the result is a
    /// narrowed reshape of the original storage. A buffer that ends right
    /// after the last logical row (no trailing padding) is also accepted; the
    /// final row is then appended separately.
    pub fn rows(&self, batch_size: usize, row_len: usize) -> Result<Tensor> {
        if batch_size == 0 {
            return Err(DispatchError::shape("batch_size must be > 0"));
        }
        if row_len == 0 {
            return Err(DispatchError::shape("row length must be > 0"));
        }

        if self.pitch == 0 {
            if self.data.rank() >= 2 {
                let implied = self.data.dim(D::Minus1)?;
                if implied != row_len {
                    return Err(DispatchError::shape(format!(
                        "input row length {implied} does not match expected {row_len}"
                    )));
                }
            }
        } else if self.pitch < row_len {
            return Err(DispatchError::shape(format!(
                "pitch {} is smaller than row length {row_len}",
                self.pitch
            )));
        }

        let stride = self.row_stride(row_len);
        let available = self.data.elem_count();
        let last_start = (batch_size - 1).checked_mul(stride);
        let Some(needed) = last_start.and_then(|start| start.checked_add(row_len)) else {
            return Err(DispatchError::shape(format!(
                "{batch_size} rows with pitch {stride} overflow the addressable range"
            )));
        };
        if available < needed {
            return Err(DispatchError::shape(format!(
                "input holds {available} elements, {batch_size} rows with pitch {stride} need {needed}"
            )));
        }

        let flat = self.data.flatten_all()?;
        if stride == row_len {
            return Ok(flat
                .narrow(0, 0, batch_size * row_len)?
                .reshape((batch_size, row_len))?);
        }

        if needed.saturating_add(stride - row_len) <= available {
            return Ok(flat
                .narrow(0, 0, batch_size * stride)?
                .reshape((batch_size, stride))?
                .narrow(1, 0, row_len)?);
        }

        let last_start = needed - row_len;
        let tail = flat.narrow(0, last_start, row_len)?.reshape((1, row_len))?;
        if batch_size == 1 {
            return Ok(tail);
        }
        let head = flat
            .narrow(0, 0, last_start)?
            .reshape((batch_size - 1, stride))?
            .narrow(1, 0, row_len)?;
        Ok(Tensor::cat(&[&head, &tail], 0)?)
    }
}
