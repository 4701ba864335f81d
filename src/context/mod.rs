//! Caller-supplied evaluation contexts and shell callbacks.
//!
//! The nonlinear driver owns the physics: residual evaluation, Jacobian
//! entries, and (for matrix-free backends) the action of the Jacobian on a
//! vector. This module defines the seams through which that state reaches
//! the coordination layer. Callbacks are trait objects with documented
//! signatures, never ad-hoc function-valued fields.

use crate::error::LsError;
use crate::matrix::MatrixHandle;

/// The caller's residual/Jacobian evaluation context for the current
/// nonlinear iterate.
pub trait SystemContext {
    /// Number of unknowns on this process.
    fn dim(&self) -> usize;

    /// Write the Jacobian of the current iterate into `dest`. Implementations
    /// backing explicit-matrix objects must override this; matrix-free
    /// contexts may leave the default.
    fn assemble_jacobian(&mut self, dest: &mut MatrixHandle) -> Result<(), LsError> {
        let _ = dest;
        Err(LsError::Unsupported("context cannot assemble an explicit jacobian"))
    }
}

/// Matrix-free operator action: evaluates `y = A x` without materializing A.
pub trait ShellOperator {
    /// Refresh cached state for the current nonlinear iterate.
    fn setup(&mut self, ctx: &mut dyn SystemContext) -> Result<(), LsError> {
        let _ = ctx;
        Ok(())
    }

    /// y = A x.
    fn apply(&self, x: &[f64], y: &mut [f64]) -> Result<(), LsError>;

    /// y = Aᵀ x. Backends without a transpose action must fail rather than
    /// silently return wrong results.
    fn apply_transpose(&self, x: &[f64], y: &mut [f64]) -> Result<(), LsError> {
        let _ = (x, y);
        Err(LsError::Unsupported("shell operator has no transpose action"))
    }
}

/// Matrix-free preconditioner: applies `z = M⁻¹ r` via caller callbacks.
pub trait ShellPreconditioner {
    /// Refresh cached state for the current nonlinear iterate.
    fn setup(&mut self, ctx: &mut dyn SystemContext) -> Result<(), LsError> {
        let _ = ctx;
        Ok(())
    }

    /// z = M⁻¹ r.
    fn apply(&self, r: &[f64], z: &mut [f64]) -> Result<(), LsError>;

    /// z = M⁻ᵀ r.
    fn apply_transpose(&self, r: &[f64], z: &mut [f64]) -> Result<(), LsError> {
        let _ = (r, z);
        Err(LsError::Unsupported("shell preconditioner has no transpose apply"))
    }
}

/// Any explicit matrix type with forward and transpose products is usable
/// directly as a shell operator.
impl<M> ShellOperator for M
where
    M: crate::core::traits::MatVec<f64> + crate::core::traits::MatTransVec<f64>,
{
    fn apply(&self, x: &[f64], y: &mut [f64]) -> Result<(), LsError> {
        self.matvec(x, y);
        Ok(())
    }

    fn apply_transpose(&self, x: &[f64], y: &mut [f64]) -> Result<(), LsError> {
        self.mattransvec(x, y);
        Ok(())
    }
}
