//! Fault injection for kubefault
//!
//! Revertible disruptions against live cluster resources:
//! - Node taint and node cordon+drain
//! - Pod deletion
//! - Deployment and StatefulSet scaling
//! - Rollout restart and rollout status checks

mod engine;
pub mod strategies;
mod types;

pub use engine::ActionEngine;
pub use strategies::{Progress, StrategyContext};
pub use types::*;
