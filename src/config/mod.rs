//! Configuration surface for the coordination layer.

pub mod options;
pub use options::{SolverOptions, Tolerances};
