//! Linear operator object: the system matrix A in A·x = b, or its action.
//!
//! Five variants, one contract. Dense and sparse-direct variants cache a
//! factorization keyed to the matrix generation (`assembly_count`), so an
//! unchanged matrix is never refactorized and a recomputed one always is,
//! exactly once. The sparse-direct variant splits factorization into a
//! symbolic phase (a snapshot of the fill pattern, reused while the pattern
//! is unchanged) and a numeric phase; `symbolic_refactor_always` rebuilds the
//! snapshot on every numeric refactorization for platforms where reuse
//! misbehaves. Matrix-free and distributed variants never factorize.

use crate::context::{ShellOperator, SystemContext};
use crate::error::LsError;
use crate::matrix::MatrixHandle;
use faer::linalg::solvers::{FullPivLu, SolveCore};
use faer::{Conj, MatMut};
use std::cell::RefCell;
use std::rc::Rc;

/// Fill-pattern snapshot cached by the sparse-direct symbolic phase.
pub(crate) struct SymbolicFactor {
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
}

impl SymbolicFactor {
    fn new(row_ptr: &[usize], col_idx: &[usize]) -> Self {
        SymbolicFactor {
            row_ptr: row_ptr.to_vec(),
            col_idx: col_idx.to_vec(),
        }
    }

    fn matches(&self, row_ptr: &[usize], col_idx: &[usize]) -> bool {
        self.row_ptr == row_ptr && self.col_idx == col_idx
    }
}

pub(crate) enum LoVariant {
    DenseExplicit {
        mat: Rc<RefCell<MatrixHandle>>,
        factor: Option<FullPivLu<f64>>,
        factored_at: u64,
    },
    SparseDirect {
        mat: Rc<RefCell<MatrixHandle>>,
        symbolic: Option<SymbolicFactor>,
        symbolic_count: u64,
        factor: Option<FullPivLu<f64>>,
        factored_at: u64,
    },
    MatrixFree {
        shell: Option<Box<dyn ShellOperator>>,
        dim: usize,
    },
    Distributed {
        mat: Rc<RefCell<MatrixHandle>>,
        rhs: Vec<f64>,
        sol: Vec<f64>,
    },
    DistributedMatrixFree {
        shell: Option<Box<dyn ShellOperator>>,
        rhs: Vec<f64>,
        sol: Vec<f64>,
    },
}

pub struct LinearOperator {
    pub(crate) variant: LoVariant,
    needs_parallel_data: bool,
    is_setup: bool,
    assembly_count: u64,
    pub(crate) solve_count: u64,
    pub(crate) transpose_solve_count: u64,
    factorization_count: u64,
}

impl LinearOperator {
    fn with_variant(variant: LoVariant, needs_parallel_data: bool) -> Self {
        LinearOperator {
            variant,
            needs_parallel_data,
            is_setup: false,
            assembly_count: 0,
            solve_count: 0,
            transpose_solve_count: 0,
            factorization_count: 0,
        }
    }

    /// Dense direct operator: LU-factorized in place, pivots cached.
    pub fn dense(mat: Rc<RefCell<MatrixHandle>>) -> Self {
        Self::with_variant(
            LoVariant::DenseExplicit { mat, factor: None, factored_at: 0 },
            false,
        )
    }

    /// Sparse direct operator with a two-phase factorization cache.
    pub fn sparse_direct(mat: Rc<RefCell<MatrixHandle>>) -> Self {
        Self::with_variant(
            LoVariant::SparseDirect {
                mat,
                symbolic: None,
                symbolic_count: 0,
                factor: None,
                factored_at: 0,
            },
            false,
        )
    }

    /// Matrix-free operator solved iteratively through its action.
    pub fn matrix_free(shell: Box<dyn ShellOperator>, dim: usize) -> Self {
        Self::with_variant(LoVariant::MatrixFree { shell: Some(shell), dim }, false)
    }

    /// Distributed explicit operator solved iteratively.
    pub fn distributed(mat: Rc<RefCell<MatrixHandle>>, needs_parallel_data: bool) -> Self {
        let dim = mat.borrow().dim();
        Self::with_variant(
            LoVariant::Distributed { mat, rhs: vec![0.0; dim], sol: vec![0.0; dim] },
            needs_parallel_data,
        )
    }

    /// Distributed matrix-free operator solved iteratively.
    pub fn distributed_matrix_free(
        shell: Box<dyn ShellOperator>,
        dim: usize,
        needs_parallel_data: bool,
    ) -> Self {
        Self::with_variant(
            LoVariant::DistributedMatrixFree {
                shell: Some(shell),
                rhs: vec![0.0; dim],
                sol: vec![0.0; dim],
            },
            needs_parallel_data,
        )
    }

    pub fn dim(&self) -> usize {
        match &self.variant {
            LoVariant::DenseExplicit { mat, .. }
            | LoVariant::SparseDirect { mat, .. }
            | LoVariant::Distributed { mat, .. } => mat.borrow().dim(),
            LoVariant::MatrixFree { dim, .. } => *dim,
            LoVariant::DistributedMatrixFree { rhs, .. } => rhs.len(),
        }
    }

    pub fn is_matrix_free(&self) -> bool {
        matches!(
            self.variant,
            LoVariant::MatrixFree { .. } | LoVariant::DistributedMatrixFree { .. }
        )
    }

    /// Whether solves dispatch to the iterative backend.
    pub fn is_iterative(&self) -> bool {
        matches!(
            self.variant,
            LoVariant::MatrixFree { .. }
                | LoVariant::Distributed { .. }
                | LoVariant::DistributedMatrixFree { .. }
        )
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

    pub fn solve_count(&self) -> u64 {
        self.solve_count
    }

    pub fn transpose_solve_count(&self) -> u64 {
        self.transpose_solve_count
    }

    pub fn factorization_count(&self) -> u64 {
        self.factorization_count
    }

    /// Number of symbolic factorizations performed (sparse direct only).
    pub fn symbolic_factor_count(&self) -> u64 {
        match &self.variant {
            LoVariant::SparseDirect { symbolic_count, .. } => *symbolic_count,
            _ => 0,
        }
    }

    /// The matrix handle, when this operator holds one.
    pub fn matrix(&self) -> Option<&Rc<RefCell<MatrixHandle>>> {
        match &self.variant {
            LoVariant::DenseExplicit { mat, .. }
            | LoVariant::SparseDirect { mat, .. }
            | LoVariant::Distributed { mat, .. } => Some(mat),
            _ => None,
        }
    }

    /// Recompute the matrix (or refresh matrix-free state) from the caller's
    /// context. Increments `assembly_count` exactly once per call; the solver
    /// layer guards idempotence.
    pub(crate) fn compute(&mut self, ctx: &mut dyn SystemContext) -> Result<(), LsError> {
        match &mut self.variant {
            LoVariant::DenseExplicit { mat, .. }
            | LoVariant::SparseDirect { mat, .. }
            | LoVariant::Distributed { mat, .. } => {
                let mut m = mat.borrow_mut();
                if m.is_freed() {
                    return Err(LsError::InvariantViolation(
                        "compute on a freed operator matrix",
                    ));
                }
                m.zero();
                ctx.assemble_jacobian(&mut m)?;
            }
            LoVariant::MatrixFree { shell, .. }
            | LoVariant::DistributedMatrixFree { shell, .. } => match shell.as_mut() {
                Some(s) => s.setup(ctx)?,
                None => {
                    return Err(LsError::InvariantViolation("compute on a freed operator"));
                }
            },
        }
        self.is_setup = true;
        self.assembly_count += 1;
        Ok(())
    }

    pub(crate) fn mark_setup(&mut self) {
        self.is_setup = true;
    }

    pub(crate) fn invalidate(&mut self) {
        self.is_setup = false;
    }

    /// y = A x, through the explicit matrix or the shell action.
    pub(crate) fn apply(&self, x: &[f64], y: &mut [f64]) -> Result<(), LsError> {
        match &self.variant {
            LoVariant::DenseExplicit { mat, .. }
            | LoVariant::SparseDirect { mat, .. }
            | LoVariant::Distributed { mat, .. } => mat.borrow().apply(x, y),
            LoVariant::MatrixFree { shell, .. }
            | LoVariant::DistributedMatrixFree { shell, .. } => match shell.as_ref() {
                Some(s) => s.apply(x, y),
                None => Err(LsError::InvariantViolation("apply on a freed operator")),
            },
        }
    }

    /// y = Aᵀ x.
    pub(crate) fn apply_transpose(&self, x: &[f64], y: &mut [f64]) -> Result<(), LsError> {
        match &self.variant {
            LoVariant::DenseExplicit { mat, .. }
            | LoVariant::SparseDirect { mat, .. }
            | LoVariant::Distributed { mat, .. } => mat.borrow().apply_transpose(x, y),
            LoVariant::MatrixFree { shell, .. }
            | LoVariant::DistributedMatrixFree { shell, .. } => match shell.as_ref() {
                Some(s) => s.apply_transpose(x, y),
                None => Err(LsError::InvariantViolation("apply on a freed operator")),
            },
        }
    }

    /// Make sure a current factorization exists for the direct variants.
    /// Refactorizes only when the matrix generation moved past the cached
    /// factor; the symbolic snapshot is additionally rebuilt when the fill
    /// pattern changed or `symbolic_refactor_always` is set.
    pub(crate) fn prepare_factor(&mut self, symbolic_refactor_always: bool) -> Result<(), LsError> {
        let generation = self.assembly_count;
        let mut refactored = false;
        match &mut self.variant {
            LoVariant::DenseExplicit { mat, factor, factored_at } => {
                if factor.is_none() || *factored_at != generation {
                    let m = mat.borrow();
                    let a = match &*m {
                        MatrixHandle::Dense(a) => a,
                        _ => {
                            return Err(LsError::InvariantViolation(
                                "dense operator without a dense matrix handle",
                            ));
                        }
                    };
                    let f = FullPivLu::new(a.as_ref());
                    check_factor(&f, a.nrows())?;
                    *factor = Some(f);
                    *factored_at = generation;
                    refactored = true;
                }
            }
            LoVariant::SparseDirect { mat, symbolic, symbolic_count, factor, factored_at } => {
                if factor.is_none() || *factored_at != generation {
                    if !mat.borrow().is_assembled() {
                        let merged = mat.borrow_mut().assemble();
                        log::warn!(
                            "sparse operator pattern grew by {merged} entries during factorization"
                        );
                    }
                    let m = mat.borrow();
                    let a = match &*m {
                        MatrixHandle::Sparse(a) => a,
                        _ => {
                            return Err(LsError::InvariantViolation(
                                "sparse-direct operator without a sparse matrix handle",
                            ));
                        }
                    };
                    let (row_ptr, col_idx) = a.structure();
                    let stale = match symbolic {
                        Some(s) => symbolic_refactor_always || !s.matches(row_ptr, col_idx),
                        None => true,
                    };
                    if stale {
                        *symbolic = Some(SymbolicFactor::new(row_ptr, col_idx));
                        *symbolic_count += 1;
                    }
                    let dense = a.to_dense();
                    let f = FullPivLu::new(dense.as_ref());
                    check_factor(&f, dense.nrows())?;
                    *factor = Some(f);
                    *factored_at = generation;
                    refactored = true;
                }
            }
            _ => {
                return Err(LsError::InvariantViolation(
                    "factorization requested for an iterative operator",
                ));
            }
        }
        if refactored {
            self.factorization_count += 1;
        }
        Ok(())
    }

    /// Back-substitute against the cached factorization.
    pub(crate) fn back_substitute(
        &self,
        b: &[f64],
        x: &mut [f64],
        transpose: bool,
    ) -> Result<(), LsError> {
        let factor = match &self.variant {
            LoVariant::DenseExplicit { factor, .. } | LoVariant::SparseDirect { factor, .. } => {
                factor.as_ref().ok_or(LsError::InvariantViolation(
                    "back-substitution before factorization",
                ))?
            }
            _ => {
                return Err(LsError::InvariantViolation(
                    "back-substitution on an iterative operator",
                ));
            }
        };
        assert_eq!(b.len(), x.len(), "rhs and solution lengths differ");
        x.copy_from_slice(b);
        let n = x.len();
        let x_mat = MatMut::from_column_major_slice_mut(x, n, 1);
        if transpose {
            factor.solve_transpose_in_place_with_conj(Conj::No, x_mat);
        } else {
            factor.solve_in_place_with_conj(Conj::No, x_mat);
        }
        Ok(())
    }

    /// Distributed staging buffers (rhs, solution), when this variant has
    /// them.
    pub(crate) fn staging_buffers(&mut self) -> Option<(&mut Vec<f64>, &mut Vec<f64>)> {
        match &mut self.variant {
            LoVariant::Distributed { rhs, sol, .. }
            | LoVariant::DistributedMatrixFree { rhs, sol, .. } => Some((rhs, sol)),
            _ => None,
        }
    }

    /// Read-only view of the staged right-hand side.
    pub(crate) fn staged_rhs(&self) -> Option<&[f64]> {
        match &self.variant {
            LoVariant::Distributed { rhs, .. }
            | LoVariant::DistributedMatrixFree { rhs, .. } => Some(rhs),
            _ => None,
        }
    }

    /// Whether this variant stages data through distributed buffers.
    pub(crate) fn is_distributed(&self) -> bool {
        matches!(
            self.variant,
            LoVariant::Distributed { .. } | LoVariant::DistributedMatrixFree { .. }
        )
    }

    /// Bump the factorization counter for a completed distributed assembly.
    pub(crate) fn note_assembly_completed(&mut self) {
        self.factorization_count += 1;
    }

    /// Release native resources. Idempotent; the matrix handle itself guards
    /// against double release.
    pub(crate) fn free(&mut self) {
        match &mut self.variant {
            LoVariant::DenseExplicit { mat, factor, .. } => {
                mat.borrow_mut().free();
                *factor = None;
            }
            LoVariant::SparseDirect { mat, symbolic, factor, .. } => {
                mat.borrow_mut().free();
                *symbolic = None;
                *factor = None;
            }
            LoVariant::MatrixFree { shell, .. } => {
                shell.take();
            }
            LoVariant::Distributed { mat, .. } => mat.borrow_mut().free(),
            LoVariant::DistributedMatrixFree { shell, .. } => {
                shell.take();
            }
        }
        self.is_setup = false;
    }
}

/// Probe the factorization for singularity: with full pivoting, a singular
/// matrix puts zero pivots at the tail of U and back-substitution produces
/// non-finite entries.
fn check_factor(factor: &FullPivLu<f64>, n: usize) -> Result<(), LsError> {
    let mut probe = vec![1.0; n];
    let probe_mat = MatMut::from_column_major_slice_mut(&mut probe, n, 1);
    factor.solve_in_place_with_conj(Conj::No, probe_mat);
    if probe.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(LsError::FactorError("singular matrix".into()))
    }
}
