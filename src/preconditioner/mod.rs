//! Preconditioner object: a closed set of variants behind one contract.
//!
//! The solver owns exactly one `Preconditioner`. `None` degenerates
//! preconditioning to an exact solve (the operator itself is factorized);
//! `ExplicitMatrix` assembles an approximate operator and applies its
//! diagonal inverse, reading the matrix at apply time so a shared-matrix
//! refresh done by the operator is immediately visible; `Shell` delegates
//! both setup and application to caller callbacks.

use crate::context::{ShellPreconditioner, SystemContext};
use crate::error::LsError;
use crate::matrix::MatrixHandle;
use std::cell::RefCell;
use std::rc::Rc;

pub(crate) enum PcVariant {
    /// No preconditioner; the solver special-cases this to an exact solve.
    None,
    /// Explicit approximate operator, applied through its diagonal.
    ExplicitMatrix { mat: Rc<RefCell<MatrixHandle>> },
    /// Caller-supplied matrix-free preconditioner.
    Shell { shell: Option<Box<dyn ShellPreconditioner>> },
}

pub struct Preconditioner {
    variant: PcVariant,
    needs_parallel_data: bool,
    is_setup: bool,
    assembly_count: u64,
}

impl Preconditioner {
    pub fn none() -> Self {
        Preconditioner {
            variant: PcVariant::None,
            needs_parallel_data: false,
            is_setup: false,
            assembly_count: 0,
        }
    }

    pub fn explicit(mat: Rc<RefCell<MatrixHandle>>, needs_parallel_data: bool) -> Self {
        Preconditioner {
            variant: PcVariant::ExplicitMatrix { mat },
            needs_parallel_data,
            is_setup: false,
            assembly_count: 0,
        }
    }

    pub fn shell(shell: Box<dyn ShellPreconditioner>, needs_parallel_data: bool) -> Self {
        Preconditioner {
            variant: PcVariant::Shell { shell: Some(shell) },
            needs_parallel_data,
            is_setup: false,
            assembly_count: 0,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self.variant, PcVariant::None)
    }

    pub fn is_matrix_free(&self) -> bool {
        matches!(self.variant, PcVariant::Shell { .. })
    }

    pub fn needs_parallel_data(&self) -> bool {
        self.needs_parallel_data
    }

    pub fn is_setup(&self) -> bool {
        self.is_setup
    }

    pub fn assembly_count(&self) -> u64 {
        self.assembly_count
    }

    /// The matrix handle, when this preconditioner holds one.
    pub fn matrix(&self) -> Option<&Rc<RefCell<MatrixHandle>>> {
        match &self.variant {
            PcVariant::ExplicitMatrix { mat } => Some(mat),
            _ => None,
        }
    }

    /// Recompute from the caller's context. Increments `assembly_count`
    /// exactly once per call; the solver layer guards idempotence.
    pub(crate) fn compute(&mut self, ctx: &mut dyn SystemContext) -> Result<(), LsError> {
        match &mut self.variant {
            PcVariant::None => {
                return Err(LsError::InvariantViolation(
                    "compute on a None preconditioner",
                ));
            }
            PcVariant::ExplicitMatrix { mat } => {
                let mut m = mat.borrow_mut();
                if m.is_freed() {
                    return Err(LsError::InvariantViolation(
                        "compute on a freed preconditioner matrix",
                    ));
                }
                m.zero();
                ctx.assemble_jacobian(&mut m)?;
            }
            PcVariant::Shell { shell } => match shell.as_mut() {
                Some(s) => s.setup(ctx)?,
                None => {
                    return Err(LsError::InvariantViolation(
                        "compute on a freed preconditioner",
                    ));
                }
            },
        }
        self.is_setup = true;
        self.assembly_count += 1;
        Ok(())
    }

    /// Force the setup flag without recomputing. Used when the shared matrix
    /// was just refreshed through the operator, so the state this object
    /// reads is fresh even though its own compute was skipped.
    pub(crate) fn mark_setup(&mut self) {
        self.is_setup = true;
    }

    pub(crate) fn invalidate(&mut self) {
        self.is_setup = false;
    }

    /// z = M⁻¹ r. The `None` variant is special-cased by the solver before
    /// this point.
    pub fn apply(&self, r: &[f64], z: &mut [f64]) -> Result<(), LsError> {
        match &self.variant {
            PcVariant::None => Err(LsError::InvariantViolation(
                "apply on a None preconditioner",
            )),
            PcVariant::ExplicitMatrix { mat } => {
                if self.assembly_count == 0 && !self.is_setup {
                    return Err(LsError::InvariantViolation(
                        "preconditioner applied before any setup",
                    ));
                }
                apply_inverse_diag(&mat.borrow(), r, z)
            }
            PcVariant::Shell { shell: Some(s) } => s.apply(r, z),
            PcVariant::Shell { shell: None } => {
                Err(LsError::InvariantViolation("apply on a freed preconditioner"))
            }
        }
    }

    /// z = M⁻ᵀ r.
    pub fn apply_transpose(&self, r: &[f64], z: &mut [f64]) -> Result<(), LsError> {
        match &self.variant {
            PcVariant::None => Err(LsError::InvariantViolation(
                "apply on a None preconditioner",
            )),
            // the diagonal is its own transpose
            PcVariant::ExplicitMatrix { mat } => {
                if self.assembly_count == 0 && !self.is_setup {
                    return Err(LsError::InvariantViolation(
                        "preconditioner applied before any setup",
                    ));
                }
                apply_inverse_diag(&mat.borrow(), r, z)
            }
            PcVariant::Shell { shell: Some(s) } => s.apply_transpose(r, z),
            PcVariant::Shell { shell: None } => {
                Err(LsError::InvariantViolation("apply on a freed preconditioner"))
            }
        }
    }

    /// Release native resources. Idempotent; the matrix handle itself guards
    /// against double release.
    pub(crate) fn free(&mut self) {
        match &mut self.variant {
            PcVariant::None => {}
            PcVariant::ExplicitMatrix { mat } => mat.borrow_mut().free(),
            PcVariant::Shell { shell } => {
                shell.take();
            }
        }
        self.is_setup = false;
    }
}

fn apply_inverse_diag(m: &MatrixHandle, r: &[f64], z: &mut [f64]) -> Result<(), LsError> {
    if m.is_freed() {
        return Err(LsError::InvariantViolation(
            "apply on a freed preconditioner matrix",
        ));
    }
    let d = m.diag();
    assert_eq!(r.len(), d.len(), "vector length does not match the matrix");
    assert_eq!(z.len(), d.len(), "vector length does not match the matrix");
    for i in 0..d.len() {
        z[i] = if d[i] != 0.0 { r[i] / d[i] } else { 0.0 };
    }
    Ok(())
}
