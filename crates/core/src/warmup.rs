//! Warm-up driver that populates the tuning cache.
//!
//! A warm-up pass switches the dispatcher into measurement mode and calls
//! back into the host once per batch size of the tuning sequence. The host
//! runs whatever layers it wants tuned; every `forward`/`forward_moe` it
//! issues records a decision.
//!
//! ```ignore
//! let stats = run_tuning_warmup(&dispatch, &WarmupConfig::default(), |batch| {
//!     let x = probe.activations(batch)?;
//!     dispatch.forward(&mut out, StridedView::new(&x), batch, &w, kind, LoraInput::none())
//! })?;
//! dispatch.export_to_path("gemm.tune")?;
//! ```

use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use tracing::{info, warn};

use crate::dispatch::LinearDispatch;
use crate::error::DispatchError;

// ─── Configuration ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WarmupConfig {
    /// Batch sizes to visit instead of the dispatcher's tuning sequence.
    pub sizes: Option<Vec<usize>>,
    /// Log every batch size as it completes.
    pub show_progress: bool,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            sizes: None,
            show_progress: true,
        }
    }
}

impl WarmupConfig {
    pub fn with_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.sizes = Some(sizes);
        self
    }

    pub fn quiet(mut self) -> Self {
        self.show_progress = false;
        self
    }
}

// ─── Statistics ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct WarmupStats {
    /// Batch sizes whose callback completed.
    pub tuned_sizes: Vec<usize>,
    /// Batch sizes whose callback returned an error.
    pub failed_sizes: Vec<usize>,
    /// One message per failed size.
    pub errors: Vec<String>,
    pub total_time_ms: u64,
    /// Cache size after the pass.
    pub records: usize,
}

impl WarmupStats {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WarmupError {
    #[error("warm-up schedule is empty")]
    EmptySchedule,

    #[error("invalid batch size {0}")]
    InvalidBatchSize(usize),

    /// No batch size completed; carries the first failure.
    #[error("all {sizes} batch sizes failed, first error: {source}")]
    AllSizesFailed {
        sizes: usize,
        #[source]
        source: DispatchError,
    },
}

/// Puts the dispatcher back into execute mode when dropped.
struct MeasureGuard<'a> {
    dispatch: &'a LinearDispatch,
}

impl<'a> MeasureGuard<'a> {
    fn enable(dispatch: &'a LinearDispatch) -> Self {
        dispatch.set_measure(true);
        Self { dispatch }
    }
}

impl Drop for MeasureGuard<'_> {
    fn drop(&mut self) {
        self.dispatch.set_measure(false);
    }
}

/// Run one measurement pass per batch size.
///
/// Failures of individual sizes are collected in the returned stats rather
/// than aborting the pass. Only when every size fails is the first error
/// returned as [`WarmupError::AllSizesFailed`]. The dispatcher is left in
/// execute mode, also when `run_batch` panics.
pub fn run_tuning_warmup<F>(
    dispatch: &LinearDispatch,
    config: &WarmupConfig,
    mut run_batch: F,
) -> Result<WarmupStats, WarmupError>
where
    F: FnMut(usize) -> crate::Result<()>,
{
    let sizes: Vec<usize> = match &config.sizes {
        Some(sizes) => {
            if let Some(&bad) = sizes.iter().find(|&&s| s == 0) {
                return Err(WarmupError::InvalidBatchSize(bad));
            }
            sizes.clone()
        }
        None => dispatch.tuning_seq().to_vec(),
    };
    if sizes.is_empty() {
        return Err(WarmupError::EmptySchedule);
    }

    let start = Instant::now();
    let mut stats = WarmupStats::default();
    let mut first_error = None;
    let total = sizes.len();
    {
        let _guard = MeasureGuard::enable(dispatch);
        for (i, &batch) in sizes.iter().enumerate() {
            match run_batch(batch) {
                Ok(()) => {
                    stats.tuned_sizes.push(batch);
                    if config.show_progress {
                        info!(batch_size = batch, progress = %format!("{}/{total}", i + 1), "Tuned batch size");
                    }
                }
                Err(e) => {
                    warn!(batch_size = batch, error = %e, "Tuning failed for batch size");
                    stats.failed_sizes.push(batch);
                    stats.errors.push(format!("batch {batch}: {e}"));
                    first_error.get_or_insert(e);
                }
            }
        }
    }

    if stats.tuned_sizes.is_empty() {
        if let Some(source) = first_error {
            return Err(WarmupError::AllSizesFailed {
                sizes: total,
                source,
            });
        }
    }

    stats.total_time_ms = start.elapsed().as_millis() as u64;
    stats.records = dispatch.cache_stats().records;
    info!(
        tuned = stats.tuned_sizes.len(),
        failed = stats.failed_sizes.len(),
        records = stats.records,
        time_ms = stats.total_time_ms,
        "Tuning warm-up complete"
    );
    Ok(stats)
}

// ─── Probe inputs ─────────────────────────────────────────────────────────

/// Deterministic activations and routing arrays for warm-up calls.
///
/// Values are fixed by position so repeated passes measure the same data.
#[derive(Debug, Clone)]
pub struct ProbeInputs {
    hidden: usize,
    dtype: DType,
    device: Device,
}

impl ProbeInputs {
    pub fn new(hidden: usize, dtype: DType, device: Device) -> Self {
        Self {
            hidden,
            dtype,
            device,
        }
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    /// `[batch_size, hidden]` activations in roughly `[-0.5, 0.5)`.
    pub fn activations(&self, batch_size: usize) -> crate::Result<Tensor> {
        let data: Vec<f32> = (0..batch_size * self.hidden)
            .map(|i| ((i * 7 + i / self.hidden.max(1) * 3) % 17) as f32 / 17.0 - 0.5)
            .collect();
        let t = Tensor::from_vec(data, (batch_size, self.hidden), &self.device)?;
        Ok(t.to_dtype(self.dtype)?)
    }

    /// Zeroed `[batch_size, width]` output buffer.
    pub fn output(&self, batch_size: usize, width: usize) -> crate::Result<Tensor> {
        Ok(Tensor::zeros((batch_size, width), self.dtype, &self.device)?)
    }

    /// Round-robin routing of every row to `top_k` distinct experts.
    ///
    /// Returns `(indexes, offsets)` in the layout `forward_moe` expects.
    pub fn routing(
        batch_size: usize,
        num_experts: usize,
        top_k: usize,
    ) -> crate::Result<(Vec<u32>, Vec<u32>)> {
        if num_experts == 0 || top_k == 0 || top_k > num_experts {
            return Err(DispatchError::routing(format!(
                "cannot route to top {top_k} of {num_experts} experts"
            )));
        }
        let mut per_expert: Vec<Vec<u32>> = vec![Vec::new(); num_experts];
        for row in 0..batch_size {
            for j in 0..top_k {
                per_expert[(row + j) % num_experts].push(row as u32);
            }
        }

        let mut indexes = Vec::with_capacity(batch_size * top_k);
        let mut offsets = Vec::with_capacity(num_experts + 1);
        offsets.push(0);
        for rows in per_expert {
            indexes.extend(rows);
            offsets.push(indexes.len() as u32);
        }
        Ok((indexes, offsets))
    }
}
