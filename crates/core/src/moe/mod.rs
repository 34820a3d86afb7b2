//! Mixture-of-experts row routing.

mod context;
mod expert_map;
mod routing;

pub use context::RoutingContext;
pub use expert_map::{ExpertMap, ExpertPlacement};
pub use routing::{ExpertGroup, RoutingPlan};
