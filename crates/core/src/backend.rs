//! Kernel backend abstraction.
//!
//! A backend executes one matrix product with a chosen [`KernelVariant`].
//! Everything device specific lives behind this trait; the dispatcher only
//! decides which variant to run.

use std::time::Instant;

use candle_core::{Device, Result, Tensor};

use crate::epilogue;
use crate::variant::{Fusion, KernelVariant, OperationKind};

/// One matrix product plus its epilogue inputs.
#[derive(Debug, Clone, Copy)]
pub struct GemmProblem<'a> {
    /// `[m, k]` activations.
    pub input: &'a Tensor,
    /// `[n, k]` weight.
    pub weight: &'a Tensor,
    pub kind: OperationKind,
    /// Existing output rows for `FusedAdd`. Grouped calls leave this empty
    /// and accumulate during the scatter.
    pub residual: Option<&'a Tensor>,
    /// Masked `[m, n]` LoRA delta, added before the epilogue.
    pub lora_delta: Option<&'a Tensor>,
}

impl<'a> GemmProblem<'a> {
    pub fn new(input: &'a Tensor, weight: &'a Tensor, kind: OperationKind) -> Self {
        Self {
            input,
            weight,
            kind,
            residual: None,
            lora_delta: None,
        }
    }

    pub fn with_residual(mut self, residual: Option<&'a Tensor>) -> Self {
        self.residual = residual;
        self
    }

    pub fn with_lora(mut self, delta: Option<&'a Tensor>) -> Self {
        self.lora_delta = delta;
        self
    }

    pub fn rows(&self) -> usize {
        self.input.dims().first().copied().unwrap_or(0)
    }
}

/// Executes matrix products.
///
/// `execute` returns the final, epilogue-applied result. Implementations
/// may enqueue work asynchronously; `synchronize` must block until all
/// previously enqueued work has finished.
pub trait KernelBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this backend implements `variant`.
    fn supports(&self, _variant: KernelVariant) -> bool {
        true
    }

    fn execute(&self, variant: KernelVariant, problem: &GemmProblem<'_>) -> Result<Tensor>;

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    /// Execute once and report the elapsed cost in microseconds.
    fn benchmark(
        &self,
        variant: KernelVariant,
        problem: &GemmProblem<'_>,
    ) -> Result<(Tensor, f64)> {
        self.synchronize()?;
        let start = Instant::now();
        let output = self.execute(variant, problem)?;
        self.synchronize()?;
        Ok((output, start.elapsed().as_secs_f64() * 1e6))
    }
}

/// Reference backend built on candle's matmul.
///
/// Tile shapes are realised as row blocks; fused variants fold the
/// epilogue into the per-block computation.
#[derive(Debug, Clone)]
pub struct CandleBackend {
    device: Device,
}

impl CandleBackend {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn cpu() -> Self {
        Self::new(Device::Cpu)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn execute_block(
        &self,
        fusion: Fusion,
        problem: &GemmProblem<'_>,
        start: usize,
        len: usize,
    ) -> Result<Tensor> {
        let x = problem.input.narrow(0, start, len)?.contiguous()?;
        let delta = problem
            .lora_delta
            .map(|d| d.narrow(0, start, len))
            .transpose()?;
        let residual = problem
            .residual
            .map(|r| r.narrow(0, start, len))
            .transpose()?;

        match fusion {
            Fusion::Unfused => {
                let raw = matmul_nt(&x, problem.weight)?;
                let raw = epilogue::add_lora(raw, delta.as_ref())?;
                epilogue::finish(problem.kind, raw, residual.as_ref())
            }
            Fusion::FusedAdd => {
                let raw = epilogue::add_lora(matmul_nt(&x, problem.weight)?, delta.as_ref())?;
                match residual {
                    Some(r) => r.add(&raw),
                    None => Ok(raw),
                }
            }
            Fusion::FusedSiluFfn => {
                let n = problem.weight.dims()[0];
                let half = n / 2;
                let gate_w = problem.weight.narrow(0, 0, half)?;
                let up_w = problem.weight.narrow(0, half, half)?;
                let (gate_d, up_d) = match &delta {
                    Some(d) => (Some(d.narrow(1, 0, half)?), Some(d.narrow(1, half, half)?)),
                    None => (None, None),
                };
                let gate = epilogue::add_lora(matmul_nt(&x, &gate_w)?, gate_d.as_ref())?;
                let up = epilogue::add_lora(matmul_nt(&x, &up_w)?, up_d.as_ref())?;
                candle_nn::ops::silu(&gate)?.mul(&up)
            }
        }
    }
}

fn matmul_nt(x: &Tensor, w: &Tensor) -> Result<Tensor> {
    x.matmul(&w.t()?)
}

impl KernelBackend for CandleBackend {
    fn name(&self) -> &str {
        "candle"
    }

    fn execute(&self, variant: KernelVariant, problem: &GemmProblem<'_>) -> Result<Tensor> {
        let m = problem.rows();
        let block = variant.tile.block_m();
        if m <= block {
            return self.execute_block(variant.fusion, problem, 0, m);
        }

        let mut parts = Vec::with_capacity(m.div_ceil(block));
        let mut start = 0;
        while start < m {
            let len = block.min(m - start);
            parts.push(self.execute_block(variant.fusion, problem, start, len)?);
            start += len;
        }
        Tensor::cat(&parts, 0)
    }

    fn synchronize(&self) -> Result<()> {
        self.device.synchronize()
    }
}
