//! Matrix and vector allocation behind an opaque handle.
//!
//! The coordination layer never manipulates backend storage directly; it
//! holds [`MatrixHandle`]s produced by a [`MatrixFactory`] from the sparsity
//! pattern the discretization discovered. Dense handles back the dense direct
//! solver, CSR handles back the sparse-direct and distributed backends, and
//! shell handles stand in for operators that are never materialized.

use crate::error::LsError;
use crate::matrix::sparse::CsrMatrix;
use faer::Mat;

/// Sparsity structure handed to the factory at preallocation time.
#[derive(Clone, Debug)]
pub enum SparsityPattern {
    /// Fully dense coupling.
    Dense,
    /// Column indices per row block; expanded by the factory's block size.
    Rows(Vec<Vec<usize>>),
}

/// Owned, opaque matrix resource.
pub enum MatrixHandle {
    Dense(Mat<f64>),
    Sparse(CsrMatrix),
    Shell { dim: usize },
    Freed,
}

impl MatrixHandle {
    pub fn dim(&self) -> usize {
        match self {
            MatrixHandle::Dense(a) => a.nrows(),
            MatrixHandle::Sparse(a) => a.nrows(),
            MatrixHandle::Shell { dim } => *dim,
            MatrixHandle::Freed => 0,
        }
    }

    pub fn is_freed(&self) -> bool {
        matches!(self, MatrixHandle::Freed)
    }

    /// Zero all stored entries, keeping the preallocated structure.
    pub fn zero(&mut self) {
        match self {
            MatrixHandle::Dense(a) => {
                for j in 0..a.ncols() {
                    for i in 0..a.nrows() {
                        a[(i, j)] = 0.0;
                    }
                }
            }
            MatrixHandle::Sparse(a) => a.zero(),
            MatrixHandle::Shell { .. } => {}
            MatrixHandle::Freed => panic!("zero on a freed matrix handle"),
        }
    }

    /// Add `v` into entry (i, j).
    pub fn add(&mut self, i: usize, j: usize, v: f64) {
        match self {
            MatrixHandle::Dense(a) => a[(i, j)] += v,
            MatrixHandle::Sparse(a) => a.add(i, j, v),
            MatrixHandle::Shell { .. } => panic!("entry write on a matrix-free shell handle"),
            MatrixHandle::Freed => panic!("entry write on a freed matrix handle"),
        }
    }

    /// Overwrite entry (i, j) with `v`.
    pub fn set(&mut self, i: usize, j: usize, v: f64) {
        match self {
            MatrixHandle::Dense(a) => a[(i, j)] = v,
            MatrixHandle::Sparse(a) => a.set(i, j, v),
            MatrixHandle::Shell { .. } => panic!("entry write on a matrix-free shell handle"),
            MatrixHandle::Freed => panic!("entry write on a freed matrix handle"),
        }
    }

    /// Whether deferred assembly has completed. Dense handles are always
    /// assembled.
    pub fn is_assembled(&self) -> bool {
        match self {
            MatrixHandle::Sparse(a) => a.is_assembled(),
            MatrixHandle::Freed => panic!("assembly query on a freed matrix handle"),
            _ => true,
        }
    }

    /// Complete deferred assembly. Returns the number of entries that fell
    /// outside the preallocated pattern and forced the structure to grow.
    pub fn assemble(&mut self) -> usize {
        match self {
            MatrixHandle::Sparse(a) => a.assemble(),
            MatrixHandle::Freed => panic!("assemble on a freed matrix handle"),
            _ => 0,
        }
    }

    /// The main diagonal of an explicit matrix.
    pub fn diag(&self) -> Vec<f64> {
        match self {
            MatrixHandle::Dense(a) => (0..a.nrows().min(a.ncols())).map(|i| a[(i, i)]).collect(),
            MatrixHandle::Sparse(a) => a.diag(),
            MatrixHandle::Shell { .. } => panic!("diagonal of a matrix-free shell handle"),
            MatrixHandle::Freed => panic!("diagonal of a freed matrix handle"),
        }
    }

    /// y = A x for explicit handles.
    pub fn apply(&self, x: &[f64], y: &mut [f64]) -> Result<(), LsError> {
        use crate::core::traits::MatVec;
        match self {
            MatrixHandle::Dense(a) => {
                a.matvec(x, y);
                Ok(())
            }
            MatrixHandle::Sparse(a) => {
                a.spmv(x, y);
                Ok(())
            }
            MatrixHandle::Shell { .. } => {
                Err(LsError::Unsupported("matrix-vector product on a shell handle"))
            }
            MatrixHandle::Freed => Err(LsError::InvariantViolation("apply on a freed matrix handle")),
        }
    }

    /// y = Aᵀ x for explicit handles.
    pub fn apply_transpose(&self, x: &[f64], y: &mut [f64]) -> Result<(), LsError> {
        use crate::core::traits::MatTransVec;
        match self {
            MatrixHandle::Dense(a) => {
                a.mattransvec(x, y);
                Ok(())
            }
            MatrixHandle::Sparse(a) => {
                a.spmv_transpose(x, y);
                Ok(())
            }
            MatrixHandle::Shell { .. } => {
                Err(LsError::Unsupported("matrix-vector product on a shell handle"))
            }
            MatrixHandle::Freed => Err(LsError::InvariantViolation("apply on a freed matrix handle")),
        }
    }

    /// Release the underlying storage. Idempotent.
    pub fn free(&mut self) {
        *self = MatrixHandle::Freed;
    }
}

/// Allocates matrices and vectors for the solver objects.
pub trait MatrixFactory {
    /// Preallocate an explicit matrix of size `dim × dim`. `Rows` patterns
    /// are given per node block and expanded by `block_size` degrees of
    /// freedom per node; `ignore_off_process` drops contributions outside
    /// the preallocated pattern instead of growing it.
    fn create_explicit_matrix(
        &self,
        dim: usize,
        pattern: &SparsityPattern,
        block_size: usize,
        ignore_off_process: bool,
    ) -> Result<MatrixHandle, LsError>;

    /// A shell handle for operators evaluated by callback only.
    fn create_matrix_free(&self, dim: usize) -> MatrixHandle;

    /// A zero-initialized work vector.
    fn create_vector(&self, dim: usize) -> Vec<f64>;
}

/// Factory backed by faer dense storage and the crate's CSR assembler.
pub struct FaerFactory;

impl MatrixFactory for FaerFactory {
    fn create_explicit_matrix(
        &self,
        dim: usize,
        pattern: &SparsityPattern,
        block_size: usize,
        ignore_off_process: bool,
    ) -> Result<MatrixHandle, LsError> {
        match pattern {
            SparsityPattern::Dense => Ok(MatrixHandle::Dense(Mat::zeros(dim, dim))),
            SparsityPattern::Rows(rows) => {
                if block_size == 0 || dim % block_size != 0 {
                    return Err(LsError::InvariantViolation(
                        "matrix dimension is not a multiple of the block size",
                    ));
                }
                if rows.len() * block_size != dim {
                    return Err(LsError::InvariantViolation(
                        "sparsity pattern does not match the matrix dimension",
                    ));
                }
                let expanded = expand_pattern(rows, block_size);
                Ok(MatrixHandle::Sparse(CsrMatrix::from_pattern(
                    dim,
                    dim,
                    &expanded,
                    ignore_off_process,
                )))
            }
        }
    }

    fn create_matrix_free(&self, dim: usize) -> MatrixHandle {
        MatrixHandle::Shell { dim }
    }

    fn create_vector(&self, dim: usize) -> Vec<f64> {
        vec![0.0; dim]
    }
}

/// Expand a node-block pattern to degree-of-freedom granularity.
fn expand_pattern(rows: &[Vec<usize>], block_size: usize) -> Vec<Vec<usize>> {
    if block_size == 1 {
        return rows.to_vec();
    }
    let mut expanded = Vec::with_capacity(rows.len() * block_size);
    for cols in rows {
        for _ in 0..block_size {
            let mut dof_cols = Vec::with_capacity(cols.len() * block_size);
            for &jb in cols {
                for b in 0..block_size {
                    dof_cols.push(jb * block_size + b);
                }
            }
            expanded.push(dof_cols);
        }
    }
    expanded
}
