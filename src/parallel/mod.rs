//! Process-level parallelism seams: reductions and halo staging.
//!
//! The coordination layer is single-threaded per rank; its only concurrency
//! surfaces are the collective reductions used by the iterative backends and
//! the halo exchange that must complete before distributed assembly. Both are
//! behind traits so serial, shared-memory, and MPI builds share one code
//! path.

use crate::core::traits::InnerProduct;
use crate::core::wrappers::LocalInnerProduct;
use crate::error::LsError;

pub trait Comm {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn barrier(&self);
    /// Sum `x` across all ranks.
    fn all_reduce(&self, x: f64) -> f64;

    /// Globally consistent dot product over rank-local slices.
    fn dot(&self, a: &[f64], b: &[f64]) -> f64 {
        self.all_reduce(LocalInnerProduct.dot(a, b))
    }

    /// Globally consistent Euclidean norm over rank-local slices.
    fn norm(&self, a: &[f64]) -> f64 {
        self.all_reduce(LocalInnerProduct.dot(a, a)).sqrt()
    }
}

/// Single-process communicator.
pub struct SerialComm;

impl Comm for SerialComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn barrier(&self) {}
    fn all_reduce(&self, x: f64) -> f64 {
        x
    }
}

/// Halo-exchange collaborator. Implementations capture their mesh context
/// and data descriptor; `stage` posts the exchange, and with `wait = true`
/// blocks until every locally-needed remote value has arrived. A non-blocking
/// post leaves completion a caller obligation.
pub trait ParallelStaging {
    fn stage(&mut self, wait: bool) -> Result<(), LsError>;
}

/// No-op staging for single-process runs.
pub struct NoStaging;

impl ParallelStaging for NoStaging {
    fn stage(&mut self, _wait: bool) -> Result<(), LsError> {
        Ok(())
    }
}

#[cfg(feature = "rayon")]
pub mod rayon_comm;
#[cfg(feature = "rayon")]
pub use rayon_comm::RayonComm;

#[cfg(feature = "mpi")]
pub mod mpi_comm;
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;
