//! Synthetic layers driven through the dispatcher during tuning.

use candle_core::{DType, Device, Tensor};
use gemm_core::{
    DenseWeight, LinearDispatch, LoraInput, ProbeInputs, ProblemSignature, RoutingContext,
    StridedView,
};

use crate::config::LayerSpec;

/// A layer with deterministic weights and matching probe inputs.
pub struct SyntheticLayer {
    spec: LayerSpec,
    weight: DenseWeight,
    probe: ProbeInputs,
    context: Option<RoutingContext>,
}

fn matrix(rows: usize, cols: usize, seed: usize, dtype: DType, device: &Device) -> gemm_core::Result<Tensor> {
    let scale = 1.0 / (cols as f32).sqrt();
    let data: Vec<f32> = (0..rows * cols)
        .map(|i| (((i + seed * 7919) as f32) * 0.37).sin() * scale)
        .collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?.to_dtype(dtype)?)
}

impl SyntheticLayer {
    pub fn build(spec: &LayerSpec, dtype: DType, device: &Device) -> gemm_core::Result<Self> {
        let (weight, context) = if spec.is_routed() {
            let experts = (0..spec.num_experts)
                .map(|e| matrix(spec.output_dim, spec.input_dim, e + 1, dtype, device))
                .collect::<gemm_core::Result<Vec<_>>>()?;
            (
                DenseWeight::from_experts(&experts)?,
                Some(RoutingContext::all_local(spec.num_experts)),
            )
        } else {
            let w = matrix(spec.output_dim, spec.input_dim, 0, dtype, device)?;
            (DenseWeight::new(w)?, None)
        };
        Ok(Self {
            spec: spec.clone(),
            weight: weight.with_format(spec.format),
            probe: ProbeInputs::new(spec.input_dim, dtype, device.clone()),
            context,
        })
    }

    pub fn spec(&self) -> &LayerSpec {
        &self.spec
    }

    pub fn output_width(&self) -> usize {
        self.spec
            .kind
            .output_width(self.spec.output_dim)
            .unwrap_or(self.spec.output_dim)
    }

    /// Cache key a `run` at `batch_size` resolves to.
    pub fn signature(&self, batch_size: usize) -> ProblemSignature {
        if self.spec.is_routed() {
            ProblemSignature::grouped(
                self.spec.kind,
                batch_size * self.spec.top_k,
                self.spec.num_experts,
                &self.weight,
            )
        } else {
            ProblemSignature::dense(self.spec.kind, batch_size, &self.weight)
        }
    }

    /// One forward pass over `batch_size` probe rows.
    pub fn run(&self, dispatch: &LinearDispatch, batch_size: usize) -> gemm_core::Result<()> {
        let x = self.probe.activations(batch_size)?;
        let mut out = self.probe.output(batch_size, self.output_width())?;
        match &self.context {
            Some(ctx) => {
                let (indexes, offsets) =
                    ProbeInputs::routing(batch_size, self.spec.num_experts, self.spec.top_k)?;
                dispatch.forward_moe(
                    &mut out,
                    StridedView::new(&x),
                    &indexes,
                    &offsets,
                    batch_size,
                    &self.weight,
                    self.spec.kind,
                    ctx,
                )
            }
            None => dispatch.forward(
                &mut out,
                StridedView::new(&x),
                batch_size,
                &self.weight,
                self.spec.kind,
                LoraInput::none(),
            ),
        }
    }
}

pub fn build_all(specs: &[LayerSpec], dtype: DType, device: &Device) -> gemm_core::Result<Vec<SyntheticLayer>> {
    specs
        .iter()
        .map(|spec| SyntheticLayer::build(spec, dtype, device))
        .collect()
}
