//! The linear-layer dispatch facade.
//!
//! [`LinearDispatch`] resolves every call to a [`ProblemSignature`], looks
//! the signature up in its tuning cache and runs the chosen
//! [`KernelVariant`] on the backend. In measurement mode every applicable
//! variant is benchmarked instead and the fastest one is recorded.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use candle_core::Tensor;
use tracing::{debug, info, warn};

use crate::backend::{GemmProblem, KernelBackend};
use crate::epilogue::{self, LoraInput};
use crate::error::{DispatchError, Result};
use crate::moe::{RoutingContext, RoutingPlan};
use crate::tuning::{format, ProblemSignature, TuningCache, TuningParams, TuningRecord, TuningSeq};
use crate::variant::{KernelVariant, OperationKind};
use crate::view::StridedView;
use crate::weight::WeightDescriptor;

/// Snapshot of cache usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub records: usize,
    /// Execute-mode lookups that found a usable record.
    pub hits: u64,
    /// Execute-mode lookups that fell back to the default variant.
    pub misses: u64,
    /// Signatures tuned in measurement mode.
    pub measurements: u64,
}

struct Inner {
    backend: Arc<dyn KernelBackend>,
    params: TuningParams,
    seq: TuningSeq,
    measure: AtomicBool,
    cache: RwLock<TuningCache>,
    hits: AtomicU64,
    misses: AtomicU64,
    measurements: AtomicU64,
}

/// Tuned dispatch for dense and expert-routed linear layers.
///
/// Cloning is cheap; clones share the tuning cache and the measure flag.
#[derive(Clone)]
pub struct LinearDispatch {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LinearDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearDispatch")
            .field("backend", &self.inner.backend.name())
            .field("measure", &self.is_measuring())
            .field("records", &self.read_cache().len())
            .finish()
    }
}

impl LinearDispatch {
    /// Dispatcher with default [`TuningParams`], starting in execute mode.
    pub fn new(backend: Arc<dyn KernelBackend>) -> Self {
        let params = TuningParams::default();
        let seq = TuningSeq::progression(params.max_batch);
        Self::from_parts(backend, params, seq)
    }

    /// Dispatcher with explicit tuning parameters.
    ///
    /// Fails when the parameters do not describe a usable tuning sequence.
    pub fn with_params(backend: Arc<dyn KernelBackend>, params: TuningParams) -> Result<Self> {
        let seq = params.tuning_seq()?;
        Ok(Self::from_parts(backend, params, seq))
    }

    fn from_parts(backend: Arc<dyn KernelBackend>, params: TuningParams, seq: TuningSeq) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                params,
                seq,
                measure: AtomicBool::new(false),
                cache: RwLock::new(TuningCache::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                measurements: AtomicU64::new(0),
            }),
        }
    }

    /// Backend that executes every product.
    pub fn backend(&self) -> &dyn KernelBackend {
        self.inner.backend.as_ref()
    }

    /// Parameters the dispatcher was built with.
    pub fn params(&self) -> &TuningParams {
        &self.inner.params
    }

    /// Switch between measurement (`true`) and execute (`false`) mode.
    pub fn set_measure(&self, measure: bool) {
        let was = self.inner.measure.swap(measure, Ordering::SeqCst);
        if was != measure {
            debug!(measure, "Tuning mode changed");
        }
    }

    /// Whether calls currently benchmark candidates.
    pub fn is_measuring(&self) -> bool {
        self.inner.measure.load(Ordering::SeqCst)
    }

    /// Batch sizes a warm-up pass should visit.
    pub fn tuning_seq(&self) -> TuningSeq {
        self.inner.seq.clone()
    }

    /// `output = epilogue(input · weightᵀ + lora)` for the first
    /// `batch_size` rows.
    ///
    /// `output` must be `[batch_size, width]` where `width` is the weight's
    /// `output_dim`, or half of it for [`OperationKind::FusedSiluFfn`]. It is
    /// replaced by the result; for [`OperationKind::FusedAdd`] the result
    /// includes its previous contents.
    pub fn forward(
        &self,
        output: &mut Tensor,
        input: StridedView<'_>,
        batch_size: usize,
        weight: &dyn WeightDescriptor,
        kind: OperationKind,
        lora: LoraInput<'_>,
    ) -> Result<()> {
        let (product_width, width) = widths(kind, weight)?;
        let x = input.rows(batch_size, weight.input_dim())?;
        check_output(output, batch_size, width)?;
        let delta = epilogue::prepare_lora(lora, batch_size, product_width)?;
        let w = weight.matrix()?;

        let residual = if kind.accumulates() {
            Some(output.to_dtype(x.dtype())?)
        } else {
            None
        };
        let problem = GemmProblem::new(&x, &w, kind)
            .with_residual(residual.as_ref())
            .with_lora(delta.as_ref());

        let signature = ProblemSignature::dense(kind, batch_size, weight);
        let backend = self.backend();
        let result = self.run(signature, false, |variant, timed| {
            if timed {
                Ok(backend.benchmark(variant, &problem)?)
            } else {
                Ok((backend.execute(variant, &problem)?, 0.0))
            }
        })?;

        *output = result.to_dtype(output.dtype())?;
        Ok(())
    }

    /// Expert-routed product.
    ///
    /// Rows `indexes[offsets[e]..offsets[e + 1]]` of the input are multiplied
    /// by expert `e` and written to the same rows of `output`. Rows routed
    /// to several experts receive the sum of their contributions; rows
    /// routed nowhere (or only to non-resident experts) keep their value.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_moe(
        &self,
        output: &mut Tensor,
        input: StridedView<'_>,
        indexes: &[u32],
        offsets: &[u32],
        batch_size: usize,
        weight: &dyn WeightDescriptor,
        kind: OperationKind,
        context: &RoutingContext,
    ) -> Result<()> {
        let (_, width) = widths(kind, weight)?;
        let x = input.rows(batch_size, weight.input_dim())?.contiguous()?;
        check_output(output, batch_size, width)?;
        let plan = RoutingPlan::new(indexes, offsets, batch_size, weight.num_experts(), context)?;
        if plan.is_empty() {
            debug!(batch_size, "No resident expert has routed rows");
            return Ok(());
        }

        let signature =
            ProblemSignature::grouped(kind, plan.routed_tokens(), plan.num_experts(), weight);
        let backend = self.backend();
        let contributions = self.run(signature, true, |variant, timed| {
            plan.execute(backend, variant, &x, weight, kind, timed)
        })?;

        *output = plan.merge(kind, output, &contributions)?;
        Ok(())
    }

    /// Execute-mode variant choice for `signature`, without running it.
    pub fn select(&self, signature: &ProblemSignature) -> KernelVariant {
        let grouped = signature.is_grouped();
        let cached = self.read_cache().get(signature).map(|r| r.variant);
        match cached {
            Some(variant)
                if variant.is_applicable(signature.kind, grouped)
                    && self.inner.backend.supports(variant) =>
            {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                variant
            }
            Some(variant) => {
                warn!(
                    %signature,
                    %variant,
                    "Cached variant cannot serve this call, using default"
                );
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                KernelVariant::DEFAULT
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                KernelVariant::DEFAULT
            }
        }
    }

    fn run<F>(&self, signature: ProblemSignature, grouped: bool, mut exec: F) -> Result<Tensor>
    where
        F: FnMut(KernelVariant, bool) -> Result<(Tensor, f64)>,
    {
        if self.is_measuring() {
            return self.measure(signature, grouped, &mut exec);
        }
        let variant = self.select(&signature);
        let (output, _) = exec(variant, false)?;
        Ok(output)
    }

    /// Benchmark every applicable variant, record the fastest and return
    /// its output.
    fn measure<F>(&self, signature: ProblemSignature, grouped: bool, exec: &mut F) -> Result<Tensor>
    where
        F: FnMut(KernelVariant, bool) -> Result<(Tensor, f64)>,
    {
        let params = &self.inner.params;
        let timed_iters = params.effective_timed_iters();
        let candidates: Vec<KernelVariant> = epilogue::candidates(signature.kind, grouped)
            .into_iter()
            .filter(|v| self.inner.backend.supports(*v))
            .collect();

        let mut best: Option<(KernelVariant, Tensor, f64)> = None;
        let mut first_error: Option<DispatchError> = None;

        'candidates: for variant in candidates {
            for _ in 0..params.warmup_iters {
                if let Err(e) = exec(variant, false) {
                    warn!(%signature, %variant, error = %e, "Candidate failed during warm-up");
                    first_error.get_or_insert(e);
                    continue 'candidates;
                }
            }

            let mut total = 0.0;
            let mut last = None;
            for _ in 0..timed_iters {
                match exec(variant, true) {
                    Ok((out, cost)) => {
                        total += cost;
                        last = Some(out);
                    }
                    Err(e) => {
                        warn!(%signature, %variant, error = %e, "Candidate failed");
                        first_error.get_or_insert(e);
                        continue 'candidates;
                    }
                }
            }
            let Some(out) = last else {
                continue;
            };
            let cost = total / timed_iters as f64;
            if !cost.is_finite() || cost < 0.0 {
                warn!(%signature, %variant, cost_us = cost, "Candidate reported an invalid cost");
                first_error.get_or_insert_with(|| {
                    candle_core::Error::Msg(format!("variant {variant} reported cost {cost}")).into()
                });
                continue;
            }
            debug!(%signature, %variant, cost_us = cost, "Measured candidate");

            if best.as_ref().map_or(true, |(_, _, c)| cost < *c) {
                best = Some((variant, out, cost));
            }
        }

        let Some((variant, output, cost_us)) = best else {
            return Err(first_error.unwrap_or_else(|| {
                candle_core::Error::Msg(format!(
                    "backend {} supports no variant for {signature}",
                    self.inner.backend.name()
                ))
                .into()
            }));
        };

        self.write_cache().insert(TuningRecord {
            signature,
            variant,
            cost_us,
        });
        self.inner.measurements.fetch_add(1, Ordering::Relaxed);
        debug!(%signature, %variant, cost_us, "Recorded tuning decision");
        Ok(output)
    }

    /// Write every tuning record to `writer`. Returns the record count.
    pub fn export<W: Write>(&self, writer: &mut W) -> Result<usize> {
        self.read_cache().export(writer)
    }

    /// Merge records from `reader`, overwriting equal signatures.
    ///
    /// The whole stream is parsed before anything is applied, so a corrupt
    /// stream leaves the cache unchanged.
    pub fn import<R: Read>(&self, reader: &mut R) -> Result<usize> {
        let records = format::read_records(reader)?;
        Ok(self.write_cache().extend(records))
    }

    /// Write the tuning cache to a file, replacing it.
    pub fn export_to_path(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        let count = self.export(&mut writer)?;
        writer.flush()?;
        info!(path = %path.display(), records = count, "Exported tuning cache");
        Ok(count)
    }

    /// Merge records from a file written by [`LinearDispatch::export_to_path`].
    pub fn import_from_path(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);
        let count = self.import(&mut reader)?;
        info!(path = %path.display(), records = count, "Imported tuning cache");
        Ok(count)
    }

    /// Cached record for `signature`, if any. Does not touch the hit counters.
    pub fn lookup(&self, signature: &ProblemSignature) -> Option<TuningRecord> {
        self.read_cache().get(signature).copied()
    }

    /// All records, sorted by signature.
    pub fn records(&self) -> Vec<TuningRecord> {
        self.read_cache().records().into_iter().copied().collect()
    }

    /// Drop every record. Counters are kept.
    pub fn clear_cache(&self) {
        self.write_cache().clear();
    }

    /// Snapshot of the record count and lookup counters.
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            records: self.read_cache().len(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            measurements: self.inner.measurements.load(Ordering::Relaxed),
        }
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, TuningCache> {
        self.inner.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, TuningCache> {
        self.inner.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `(product width, written width)` for `kind` against `weight`.
fn widths(kind: OperationKind, weight: &dyn WeightDescriptor) -> Result<(usize, usize)> {
    let n = weight.output_dim();
    let width = kind.output_width(n).ok_or_else(|| {
        DispatchError::shape(format!(
            "{kind} needs an even, non-zero output_dim, weight has {n}"
        ))
    })?;
    Ok((n, width))
}

fn check_output(output: &Tensor, batch_size: usize, width: usize) -> Result<()> {
    if output.dims() != [batch_size, width] {
        return Err(DispatchError::shape(format!(
            "output is {:?}, expected [{batch_size}, {width}]",
            output.dims()
        )));
    }
    Ok(())
}
