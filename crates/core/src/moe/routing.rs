//! Row routing for grouped (MoE) products.
//!
//! Follows the permute / compute / unpermute pattern: rows routed to an
//! expert are gathered, multiplied against that expert's weight and
//! scattered back to their destination rows with accumulation.

use candle_core::{Device, Tensor};

use super::context::RoutingContext;
use crate::backend::{GemmProblem, KernelBackend};
use crate::error::{DispatchError, Result};
use crate::variant::{KernelVariant, OperationKind};
use crate::weight::WeightDescriptor;

/// Rows routed to one resident expert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpertGroup {
    /// Global expert id.
    pub expert: usize,
    /// Index into the stacked local weight.
    pub local: usize,
    /// Destination rows, in routing order.
    pub rows: Vec<u32>,
}

/// Validated routing arrays, split per resident expert.
#[derive(Debug, Clone)]
pub struct RoutingPlan {
    groups: Vec<ExpertGroup>,
    touched: Vec<u8>,
    routed_tokens: usize,
    num_experts: usize,
    batch_size: usize,
}

impl RoutingPlan {
    /// Validate `indexes`/`offsets` and group them by expert.
    ///
    /// `offsets` has one range per global expert: rows
    /// `indexes[offsets[e]..offsets[e + 1]]` go to expert `e`.
    /// `weight_experts` is the number of experts stacked in the weight and
    /// must equal the context's resident expert count.
    pub fn new(
        indexes: &[u32],
        offsets: &[u32],
        batch_size: usize,
        weight_experts: usize,
        context: &RoutingContext,
    ) -> Result<Self> {
        let num_experts = offsets.len().checked_sub(1).ok_or_else(|| {
            DispatchError::routing("offsets must have one entry per expert plus one")
        })?;
        if num_experts != context.num_experts() {
            return Err(DispatchError::routing(format!(
                "offsets describe {num_experts} experts, routing context has {}",
                context.num_experts()
            )));
        }
        if weight_experts != context.local_num_experts() {
            return Err(DispatchError::routing(format!(
                "weight stacks {weight_experts} experts, {} are resident",
                context.local_num_experts()
            )));
        }
        if offsets[0] != 0 {
            return Err(DispatchError::routing(format!(
                "offsets start at {}, expected 0",
                offsets[0]
            )));
        }
        if let Some(e) = offsets.windows(2).position(|w| w[1] < w[0]) {
            return Err(DispatchError::routing(format!(
                "offsets decrease at expert {e}: {} > {}",
                offsets[e],
                offsets[e + 1]
            )));
        }
        let end = offsets[num_experts] as usize;
        if end != indexes.len() {
            return Err(DispatchError::routing(format!(
                "offsets end at {end}, but {} indexes were given",
                indexes.len()
            )));
        }
        if let Some(&bad) = indexes.iter().find(|&&i| i as usize >= batch_size) {
            return Err(DispatchError::routing(format!(
                "index {bad} out of range for batch size {batch_size}"
            )));
        }

        let mut groups = Vec::new();
        let mut touched = vec![0u8; batch_size];
        let mut routed_tokens = 0;
        for (expert, range) in offsets.windows(2).enumerate() {
            let (start, stop) = (range[0] as usize, range[1] as usize);
            if start == stop {
                continue;
            }
            let Some(local) = context.local_index(expert) else {
                continue;
            };
            let rows = indexes[start..stop].to_vec();
            for &row in &rows {
                touched[row as usize] = 1;
            }
            routed_tokens += rows.len();
            groups.push(ExpertGroup {
                expert,
                local,
                rows,
            });
        }

        Ok(Self {
            groups,
            touched,
            routed_tokens,
            num_experts,
            batch_size,
        })
    }

    pub fn groups(&self) -> &[ExpertGroup] {
        &self.groups
    }

    /// Rows (with multiplicity) handled on this rank.
    pub fn routed_tokens(&self) -> usize {
        self.routed_tokens
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Whether `row` receives at least one contribution on this rank.
    pub fn is_touched(&self, row: usize) -> bool {
        self.touched.get(row).is_some_and(|&t| t != 0)
    }

    /// Run every group with `variant` and scatter-add the results into a
    /// zeroed `[batch_size, width]` tensor.
    ///
    /// With `timed` set each group is benchmarked and the summed cost in
    /// microseconds is returned alongside; otherwise the cost is zero.
    pub(crate) fn execute(
        &self,
        backend: &dyn KernelBackend,
        variant: KernelVariant,
        input: &Tensor,
        weight: &dyn WeightDescriptor,
        kind: OperationKind,
        timed: bool,
    ) -> Result<(Tensor, f64)> {
        let device = input.device();
        let mut acc: Option<Tensor> = None;
        let mut cost = 0.0;

        for group in &self.groups {
            let idx = Tensor::from_slice(&group.rows, group.rows.len(), device)?;
            let x = input.index_select(&idx, 0)?;
            let w = weight.expert(group.local)?;
            let problem = GemmProblem::new(&x, &w, kind);
            let out = if timed {
                let (out, us) = backend.benchmark(variant, &problem)?;
                cost += us;
                out
            } else {
                backend.execute(variant, &problem)?
            };
            let out = out.contiguous()?;

            let base = match acc.take() {
                Some(t) => t,
                None => zeros_like_rows(&out, self.batch_size, device)?,
            };
            acc = Some(base.index_add(&idx, &out, 0)?);
        }

        let acc = acc.ok_or_else(|| DispatchError::routing("no resident expert has routed rows"))?;
        Ok((acc, cost))
    }

    /// Combine scattered contributions with the existing output.
    ///
    /// Accumulating kinds add onto every row; overwrite kinds replace the
    /// touched rows and keep the rest.
    pub fn merge(&self, kind: OperationKind, output: &Tensor, contributions: &Tensor) -> Result<Tensor> {
        let contributions = contributions.to_dtype(output.dtype())?;
        if kind.accumulates() {
            return Ok(output.add(&contributions)?);
        }
        let (rows, width) = output.dims2()?;
        let mask = Tensor::from_slice(&self.touched, (rows, 1), output.device())?
            .broadcast_as((rows, width))?;
        Ok(mask.where_cond(&contributions, output)?)
    }
}

fn zeros_like_rows(template: &Tensor, rows: usize, device: &Device) -> Result<Tensor> {
    let width = template.dims().last().copied().unwrap_or(0);
    Ok(Tensor::zeros((rows, width), template.dtype(), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CandleBackend;
    use crate::moe::expert_map::ExpertPlacement;
    use crate::weight::DenseWeight;

    fn ctx(n: usize) -> RoutingContext {
        RoutingContext::all_local(n)
    }

    #[test]
    fn test_plan_groups_rows_by_expert() {
        let plan = RoutingPlan::new(&[3, 1, 0, 4, 2], &[0, 2, 5], 5, 2, &ctx(2)).unwrap();
        assert_eq!(plan.groups().len(), 2);
        assert_eq!(plan.groups()[0].rows, vec![3, 1]);
        assert_eq!(plan.groups()[1].rows, vec![0, 4, 2]);
        assert_eq!(plan.routed_tokens(), 5);
        assert!((0..5).all(|r| plan.is_touched(r)));
    }

    #[test]
    fn test_empty_ranges_are_skipped() {
        let plan = RoutingPlan::new(&[0, 2], &[0, 0, 2, 2], 4, 3, &ctx(3)).unwrap();
        assert_eq!(plan.groups().len(), 1);
        assert_eq!(plan.groups()[0].expert, 1);
        assert!(!plan.is_touched(1));
        assert!(!plan.is_touched(3));
    }

    #[test]
    fn test_non_resident_experts_are_skipped() {
        let ctx = RoutingContext::expert_parallel(4, 2, 1, ExpertPlacement::Linear).unwrap();
        let plan = RoutingPlan::new(&[0, 1, 2, 3], &[0, 1, 2, 3, 4], 4, 2, &ctx).unwrap();
        let experts: Vec<usize> = plan.groups().iter().map(|g| g.expert).collect();
        let locals: Vec<usize> = plan.groups().iter().map(|g| g.local).collect();
        assert_eq!(experts, vec![2, 3]);
        assert_eq!(locals, vec![0, 1]);
        assert_eq!(plan.routed_tokens(), 2);
    }

    #[test]
    fn test_routing_errors() {
        let routing = |r: Result<RoutingPlan>| matches!(r, Err(DispatchError::RoutingInconsistency(_)));
        // Decreasing offsets.
        assert!(routing(RoutingPlan::new(&[0, 1], &[0, 2, 1], 2, 2, &ctx(2))));
        // Does not start at zero.
        assert!(routing(RoutingPlan::new(&[0, 1], &[1, 2, 2], 2, 2, &ctx(2))));
        // Does not end at indexes.len().
        assert!(routing(RoutingPlan::new(&[0, 1], &[0, 1, 1], 2, 2, &ctx(2))));
        // Index out of range.
        assert!(routing(RoutingPlan::new(&[0, 5], &[0, 1, 2], 2, 2, &ctx(2))));
        // Expert count disagrees with the context.
        assert!(routing(RoutingPlan::new(&[0, 1], &[0, 1, 2], 2, 2, &ctx(3))));
        // Weight expert count disagrees.
        assert!(routing(RoutingPlan::new(&[0, 1], &[0, 1, 2], 2, 3, &ctx(2))));
        // No offsets at all.
        assert!(routing(RoutingPlan::new(&[], &[], 2, 0, &ctx(0))));
    }

    #[test]
    fn test_execute_and_merge() {
        let device = Device::Cpu;
        // Expert 0 doubles, expert 1 triples a 2-wide row.
        let e0 = Tensor::new(&[[2f32, 0.], [0., 2.]], &device).unwrap();
        let e1 = Tensor::new(&[[3f32, 0.], [0., 3.]], &device).unwrap();
        let weight = DenseWeight::from_experts(&[e0, e1]).unwrap();
        let input = Tensor::new(&[[1f32, 1.], [2., 2.], [5., 5.]], &device).unwrap();

        // Row 0 goes to both experts, row 1 to expert 1, row 2 nowhere.
        let plan = RoutingPlan::new(&[0, 0, 1], &[0, 1, 3], 3, 2, &ctx(2)).unwrap();
        let backend = CandleBackend::cpu();
        let (acc, cost) = plan
            .execute(&backend, KernelVariant::DEFAULT, &input, &weight, OperationKind::Gemm, false)
            .unwrap();
        assert_eq!(cost, 0.0);
        let rows: Vec<Vec<f32>> = acc.to_vec2().unwrap();
        assert_eq!(rows, vec![vec![5., 5.], vec![6., 6.], vec![0., 0.]]);

        let existing = Tensor::full(-1f32, (3, 2), &device).unwrap();
        let merged: Vec<Vec<f32>> = plan
            .merge(OperationKind::Gemm, &existing, &acc)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(merged, vec![vec![5., 5.], vec![6., 6.], vec![-1., -1.]]);

        let added: Vec<Vec<f32>> = plan
            .merge(OperationKind::FusedAdd, &existing, &acc)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(added, vec![vec![4., 4.], vec![5., 5.], vec![-1., -1.]]);
    }
}
