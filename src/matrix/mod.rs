//! Matrix module: CSR assembly storage and the allocation factory.

pub mod factory;
pub mod sparse;

pub use factory::{FaerFactory, MatrixFactory, MatrixHandle, SparsityPattern};
pub use sparse::CsrMatrix;
