//! Core traits and wrapper implementations.

pub mod traits;
pub mod wrappers;

pub use traits::{InnerProduct, MatTransVec, MatVec};
pub use wrappers::LocalInnerProduct;
