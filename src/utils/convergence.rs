//! Convergence tracking & tolerance checks for iterative solves.

/// Why a solve stopped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Residual dropped below `reltol * ||r0||`.
    ConvergedRtol,
    /// Residual dropped below `abstol`.
    ConvergedAtol,
    /// Residual grew past `dtol * ||r0||`.
    DivergedDtol,
    /// Iteration limit reached without convergence.
    DivergedMaxIts,
    /// Direct factorization backend; no iteration took place.
    DirectSolve,
}

impl StopReason {
    pub fn is_converged(self) -> bool {
        matches!(
            self,
            StopReason::ConvergedRtol | StopReason::ConvergedAtol | StopReason::DirectSolve
        )
    }
}

/// Stopping criteria for the iterative backends.
#[derive(Copy, Clone, Debug)]
pub struct Convergence {
    pub reltol: f64,
    pub abstol: f64,
    pub dtol: f64,
    pub itermax: usize,
}

/// Outcome of a single solve.
#[derive(Clone, Debug)]
pub struct SolveStats {
    pub iterations: usize,
    pub final_residual: f64,
    pub converged: bool,
    pub reason: StopReason,
}

impl SolveStats {
    /// Stats for a completed direct solve.
    pub fn direct() -> Self {
        SolveStats {
            iterations: 1,
            final_residual: 0.0,
            converged: true,
            reason: StopReason::DirectSolve,
        }
    }
}

impl Convergence {
    /// Returns `Some(reason)` once the solve should stop at iteration `i`
    /// with residual `res_norm`, given the initial residual `res0_norm`.
    pub fn check(&self, res_norm: f64, res0_norm: f64, i: usize) -> Option<StopReason> {
        if res_norm <= self.abstol {
            Some(StopReason::ConvergedAtol)
        } else if res_norm <= self.reltol * res0_norm {
            Some(StopReason::ConvergedRtol)
        } else if res_norm > self.dtol * res0_norm {
            Some(StopReason::DivergedDtol)
        } else if i >= self.itermax {
            Some(StopReason::DivergedMaxIts)
        } else {
            None
        }
    }

    /// Bundle a stop decision into stats.
    pub fn stats(&self, res_norm: f64, i: usize, reason: StopReason) -> SolveStats {
        SolveStats {
            iterations: i,
            final_residual: res_norm,
            converged: reason.is_converged(),
            reason,
        }
    }
}
