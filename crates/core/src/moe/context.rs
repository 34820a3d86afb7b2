use super::expert_map::{ExpertMap, ExpertPlacement};
use crate::error::Result;

/// Expert residency consulted by `forward_moe`.
///
/// Experts that are not resident on this rank are skipped; their routed
/// rows are left for the owning rank to fill.
#[derive(Debug, Clone)]
pub struct RoutingContext {
    expert_map: ExpertMap,
}

impl RoutingContext {
    pub fn new(expert_map: ExpertMap) -> Self {
        Self { expert_map }
    }

    /// Single-rank context where every expert is resident.
    pub fn all_local(num_experts: usize) -> Self {
        Self::new(ExpertMap::single_rank(num_experts))
    }

    /// Context for one rank of an expert-parallel group.
    pub fn expert_parallel(
        num_experts: usize,
        ep_size: usize,
        ep_rank: usize,
        placement: ExpertPlacement,
    ) -> Result<Self> {
        Ok(Self::new(ExpertMap::new(
            num_experts,
            ep_size,
            ep_rank,
            placement,
        )?))
    }

    pub fn expert_map(&self) -> &ExpertMap {
        &self.expert_map
    }

    /// Global expert count, i.e. the number of routing ranges.
    pub fn num_experts(&self) -> usize {
        self.expert_map.num_experts()
    }

    /// Experts stacked in the weight handed to `forward_moe`.
    pub fn local_num_experts(&self) -> usize {
        self.expert_map.local_num_experts()
    }

    pub fn is_local(&self, expert: usize) -> bool {
        self.expert_map.is_local(expert)
    }

    /// Position of a global expert inside the stacked local weight.
    pub fn local_index(&self, expert: usize) -> Option<usize> {
        self.expert_map.to_local(expert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_local() {
        let ctx = RoutingContext::all_local(4);
        assert_eq!(ctx.num_experts(), 4);
        assert_eq!(ctx.local_num_experts(), 4);
        assert_eq!(ctx.local_index(2), Some(2));
    }

    #[test]
    fn test_expert_parallel_rank() {
        let ctx = RoutingContext::expert_parallel(4, 2, 1, ExpertPlacement::Linear).unwrap();
        assert_eq!(ctx.local_num_experts(), 2);
        assert!(!ctx.is_local(0));
        assert_eq!(ctx.local_index(3), Some(1));
    }
}
