//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use candle_core::{DType, Device, Tensor};
use gemm_core::{CandleBackend, DenseWeight, GemmProblem, KernelBackend, KernelVariant};

/// Default cost for variants without a scripted cost.
pub const UNSCRIPTED_COST_US: f64 = 100.0;

/// CPU backend whose benchmark costs are scripted per variant.
///
/// Results are computed by [`CandleBackend`], so numerics are real; only the
/// reported timings and failures are fake.
pub struct MockBackend {
    inner: CandleBackend,
    costs: HashMap<KernelVariant, f64>,
    failing: Vec<KernelVariant>,
    unsupported: Vec<KernelVariant>,
    executions: AtomicUsize,
    executed: Mutex<Vec<KernelVariant>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            inner: CandleBackend::cpu(),
            costs: HashMap::new(),
            failing: Vec::new(),
            unsupported: Vec::new(),
            executions: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_cost(mut self, variant: KernelVariant, cost_us: f64) -> Self {
        self.costs.insert(variant, cost_us);
        self
    }

    pub fn with_failure(mut self, variant: KernelVariant) -> Self {
        self.failing.push(variant);
        self
    }

    pub fn without(mut self, variant: KernelVariant) -> Self {
        self.unsupported.push(variant);
        self
    }

    pub fn cost_of(&self, variant: KernelVariant) -> f64 {
        self.costs
            .get(&variant)
            .copied()
            .unwrap_or(UNSCRIPTED_COST_US)
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Variants passed to `execute`, in call order.
    pub fn executed(&self) -> Vec<KernelVariant> {
        self.executed.lock().unwrap().clone()
    }

    pub fn reset_counters(&self) {
        self.executions.store(0, Ordering::SeqCst);
        self.executed.lock().unwrap().clear();
    }
}

impl KernelBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports(&self, variant: KernelVariant) -> bool {
        !self.unsupported.contains(&variant)
    }

    fn execute(
        &self,
        variant: KernelVariant,
        problem: &GemmProblem<'_>,
    ) -> candle_core::Result<Tensor> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().unwrap().push(variant);
        if self.failing.contains(&variant) {
            candle_core::bail!("scripted failure for {variant}");
        }
        self.inner.execute(variant, problem)
    }

    fn benchmark(
        &self,
        variant: KernelVariant,
        problem: &GemmProblem<'_>,
    ) -> candle_core::Result<(Tensor, f64)> {
        let out = self.execute(variant, problem)?;
        Ok((out, self.cost_of(variant)))
    }
}

/// Deterministic `[rows, cols]` tensor.
pub fn det(rows: usize, cols: usize, seed: usize) -> Tensor {
    let data: Vec<f32> = (0..rows * cols)
        .map(|i| (((i + seed * 31) * 13 % 29) as f32 - 14.0) / 16.0)
        .collect();
    Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap()
}

pub fn zeros(rows: usize, cols: usize) -> Tensor {
    Tensor::zeros((rows, cols), DType::F32, &Device::Cpu).unwrap()
}

pub fn dense_weight(out: usize, inp: usize, seed: usize) -> DenseWeight {
    DenseWeight::new(det(out, inp, seed)).unwrap()
}

pub fn expert_weight(num_experts: usize, out: usize, inp: usize) -> DenseWeight {
    let experts: Vec<Tensor> = (0..num_experts).map(|e| det(out, inp, e + 1)).collect();
    DenseWeight::from_experts(&experts).unwrap()
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

pub fn rows(t: &Tensor) -> Vec<Vec<f32>> {
    t.to_vec2().unwrap()
}

/// `x · wᵀ` for a single row.
pub fn reference_row(x: &Tensor, w: &Tensor) -> Vec<f32> {
    x.matmul(&w.t().unwrap())
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap()
}
