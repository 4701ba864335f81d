//! Shared utilities: convergence tracking and solve statistics.

pub mod convergence;
pub use convergence::{Convergence, SolveStats, StopReason};
