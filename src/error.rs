use thiserror::Error;

// Unified error type for linsys

#[derive(Error, Debug)]
pub enum LsError {
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),
    #[error("factorization error: {0}")]
    FactorError(String),
    #[error("zero pivot at row {0}")]
    ZeroPivot(usize),
    #[error("operator apply error: {0}")]
    ApplyError(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("solver already finalized")]
    Finalized,
}
