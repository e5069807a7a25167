//! Scatter/exchange engine: reusable plans between two index sets.

pub mod exec;
pub mod plan;

pub use exec::{Direction, ScatterHandle};
pub use plan::{IndexSpace, PeerLeg, PlanStats, ScatterPlan};
