//! Expert residency across expert-parallel ranks.
//!
//! Routing arrays always use global expert ids. A rank only stores a subset
//! of experts; their weights are stacked in local-id order.

use crate::error::{DispatchError, Result};

/// How experts are spread across expert-parallel ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpertPlacement {
    /// Rank `r` owns the contiguous block `[r * n / ep, (r + 1) * n / ep)`.
    #[default]
    Linear,
    /// Rank `r` owns `r, r + ep, r + 2 * ep, ...`.
    RoundRobin,
}

/// Global/local expert id mapping for one rank.
#[derive(Debug, Clone)]
pub struct ExpertMap {
    global_to_local: Vec<Option<usize>>,
    local_to_global: Vec<usize>,
    ep_rank: usize,
    ep_size: usize,
    placement: ExpertPlacement,
}

impl ExpertMap {
    /// Map for `ep_rank` out of `ep_size` ranks.
    ///
    /// `num_experts` must divide evenly across the ranks.
    pub fn new(
        num_experts: usize,
        ep_size: usize,
        ep_rank: usize,
        placement: ExpertPlacement,
    ) -> Result<Self> {
        if ep_size == 0 {
            return Err(DispatchError::routing("expert-parallel size must be > 0"));
        }
        if ep_rank >= ep_size {
            return Err(DispatchError::routing(format!(
                "expert-parallel rank {ep_rank} out of range for size {ep_size}"
            )));
        }
        if num_experts % ep_size != 0 {
            return Err(DispatchError::routing(format!(
                "{num_experts} experts cannot be split evenly over {ep_size} ranks"
            )));
        }

        let per_rank = num_experts / ep_size;
        let local_to_global: Vec<usize> = match placement {
            ExpertPlacement::Linear => (0..per_rank).map(|l| ep_rank * per_rank + l).collect(),
            ExpertPlacement::RoundRobin => (0..per_rank).map(|l| ep_rank + l * ep_size).collect(),
        };
        let mut global_to_local = vec![None; num_experts];
        for (local, &global) in local_to_global.iter().enumerate() {
            global_to_local[global] = Some(local);
        }

        Ok(Self {
            global_to_local,
            local_to_global,
            ep_rank,
            ep_size,
            placement,
        })
    }

    /// Every expert is resident; local and global ids coincide.
    pub fn single_rank(num_experts: usize) -> Self {
        Self {
            global_to_local: (0..num_experts).map(Some).collect(),
            local_to_global: (0..num_experts).collect(),
            ep_rank: 0,
            ep_size: 1,
            placement: ExpertPlacement::Linear,
        }
    }

    #[inline]
    pub fn is_local(&self, global_id: usize) -> bool {
        self.to_local(global_id).is_some()
    }

    #[inline]
    pub fn to_local(&self, global_id: usize) -> Option<usize> {
        self.global_to_local.get(global_id).copied().flatten()
    }

    #[inline]
    pub fn to_global(&self, local_id: usize) -> Option<usize> {
        self.local_to_global.get(local_id).copied()
    }

    /// Rank that stores `global_id`.
    pub fn owner_rank(&self, global_id: usize) -> Option<usize> {
        if global_id >= self.num_experts() {
            return None;
        }
        Some(match self.placement {
            ExpertPlacement::Linear => global_id / self.local_num_experts().max(1),
            ExpertPlacement::RoundRobin => global_id % self.ep_size,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.global_to_local.len()
    }

    pub fn local_num_experts(&self) -> usize {
        self.local_to_global.len()
    }

    pub fn ep_rank(&self) -> usize {
        self.ep_rank
    }

    pub fn ep_size(&self) -> usize {
        self.ep_size
    }

    pub fn placement(&self) -> ExpertPlacement {
        self.placement
    }

    /// Global ids stored on this rank, in local-id order.
    pub fn local_global_ids(&self) -> &[usize] {
        &self.local_to_global
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_placement() {
        let map = ExpertMap::new(8, 2, 1, ExpertPlacement::Linear).unwrap();
        assert_eq!(map.local_num_experts(), 4);
        assert_eq!(map.local_global_ids(), &[4, 5, 6, 7]);
        assert!(!map.is_local(3));
        assert_eq!(map.to_local(4), Some(0));
        assert_eq!(map.to_local(7), Some(3));
        assert_eq!(map.to_global(2), Some(6));
    }

    #[test]
    fn test_round_robin_placement() {
        let map = ExpertMap::new(8, 4, 1, ExpertPlacement::RoundRobin).unwrap();
        assert_eq!(map.local_global_ids(), &[1, 5]);
        assert_eq!(map.to_local(5), Some(1));
        assert_eq!(map.to_local(2), None);
    }

    #[test]
    fn test_every_expert_has_one_owner() {
        for placement in [ExpertPlacement::Linear, ExpertPlacement::RoundRobin] {
            let maps: Vec<ExpertMap> = (0..4)
                .map(|r| ExpertMap::new(16, 4, r, placement).unwrap())
                .collect();
            for expert in 0..16 {
                let owners: Vec<usize> = maps
                    .iter()
                    .filter(|m| m.is_local(expert))
                    .map(|m| m.ep_rank())
                    .collect();
                assert_eq!(owners.len(), 1, "expert {expert} under {placement:?}");
                assert_eq!(maps[0].owner_rank(expert), Some(owners[0]));
            }
        }
    }

    #[test]
    fn test_single_rank_is_identity() {
        let map = ExpertMap::single_rank(3);
        assert_eq!(map.num_experts(), 3);
        assert_eq!(map.ep_size(), 1);
        assert!((0..3).all(|e| map.to_local(e) == Some(e)));
        assert_eq!(map.to_local(3), None);
        assert_eq!(map.owner_rank(3), None);
    }

    #[test]
    fn test_invalid_configurations() {
        assert!(ExpertMap::new(8, 0, 0, ExpertPlacement::Linear).is_err());
        assert!(ExpertMap::new(8, 2, 2, ExpertPlacement::Linear).is_err());
        assert!(ExpertMap::new(7, 2, 0, ExpertPlacement::RoundRobin).is_err());
    }
}
