//! Solver configuration resolved once at construction.
//!
//! All knobs recognized by the coordination layer live here: iterative
//! tolerances, the shared-matrix aliasing flag, the symbolic-refactorization
//! workaround toggle, and the distributed preallocation hints. Platform
//! workarounds are ordinary options on this struct, never process globals.

use crate::utils::convergence::Convergence;

/// Iterative solve tolerances.
///
/// Only the iterative backends consult these; direct backends ignore them.
#[derive(Copy, Clone, Debug)]
pub struct Tolerances {
    /// Relative decrease of the residual norm required for convergence.
    pub reltol: f64,
    /// Absolute residual norm required for convergence.
    pub abstol: f64,
    /// Divergence guard: stop once the residual grows past `dtol * ||r0||`.
    pub dtol: f64,
    /// Iteration limit.
    pub itermax: usize,
}

impl Default for Tolerances {
    fn default() -> Self {
        Tolerances { reltol: 1e-8, abstol: 1e-14, dtol: 1e5, itermax: 1000 }
    }
}

impl Tolerances {
    /// Update tolerances with the sentinel convention: any argument `<= 0`
    /// leaves the corresponding field unchanged.
    pub fn update(&mut self, reltol: f64, abstol: f64, dtol: f64, itermax: i64) {
        if reltol > 0.0 {
            self.reltol = reltol;
        }
        if abstol > 0.0 {
            self.abstol = abstol;
        }
        if dtol > 0.0 {
            self.dtol = dtol;
        }
        if itermax > 0 {
            self.itermax = itermax as usize;
        }
    }

    pub(crate) fn as_convergence(&self) -> Convergence {
        Convergence {
            reltol: self.reltol,
            abstol: self.abstol,
            dtol: self.dtol,
            itermax: self.itermax,
        }
    }
}

/// Options for the linear solver coordination layer.
#[derive(Clone, Debug)]
pub struct SolverOptions {
    /// Iterative tolerances (see [`Tolerances`]).
    pub tolerances: Tolerances,
    /// Preconditioner and operator alias the same underlying matrix.
    pub shared_mat: bool,
    /// Force a symbolic re-factorization before every numeric one.
    /// Workaround for platforms where reusing the symbolic phase misbehaves.
    pub symbolic_refactor_always: bool,
    /// Drop matrix contributions that fall outside the preallocated pattern
    /// instead of growing the pattern dynamically.
    pub ignore_off_process_entries: bool,
    /// GMRES restart length.
    pub restart: usize,
}

impl SolverOptions {
    pub fn new() -> Self {
        SolverOptions {
            tolerances: Tolerances::default(),
            shared_mat: false,
            symbolic_refactor_always: false,
            ignore_off_process_entries: false,
            restart: 30,
        }
    }
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self::new()
    }
}
