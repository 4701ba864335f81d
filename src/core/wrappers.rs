//! Trait implementations for faer dense matrices and plain slices.
//!
//! These wrappers let `faer::Mat` and `Vec<f64>` flow through the generic
//! seams of the coordination layer: a dense matrix is usable wherever an
//! operator action is expected, and local dot/norm kernels (with optional
//! Rayon parallelism) back the serial communicator.

use crate::core::traits::{InnerProduct, MatTransVec, MatVec};
use faer::{Mat, MatRef};
use num_traits::Float;

impl<T: Float> MatVec<T> for Mat<T> {
    fn matvec(&self, x: &[T], y: &mut [T]) {
        assert_eq!(self.ncols(), x.len(), "input vector x has incorrect length");
        assert_eq!(self.nrows(), y.len(), "output vector y has incorrect length");
        for i in 0..self.nrows() {
            y[i] = T::zero();
            for j in 0..self.ncols() {
                y[i] = y[i] + self[(i, j)] * x[j];
            }
        }
    }
}

impl<'a, T: Float> MatVec<T> for MatRef<'a, T> {
    fn matvec(&self, x: &[T], y: &mut [T]) {
        assert_eq!(self.ncols(), x.len(), "input vector x has incorrect length");
        assert_eq!(self.nrows(), y.len(), "output vector y has incorrect length");
        for i in 0..self.nrows() {
            y[i] = T::zero();
            for j in 0..self.ncols() {
                y[i] = y[i] + self[(i, j)] * x[j];
            }
        }
    }
}

impl<T: Float> MatTransVec<T> for Mat<T> {
    fn mattransvec(&self, x: &[T], y: &mut [T]) {
        assert_eq!(self.nrows(), x.len(), "input vector x has incorrect length");
        assert_eq!(self.ncols(), y.len(), "output vector y has incorrect length");
        for j in 0..self.ncols() {
            y[j] = T::zero();
            for i in 0..self.nrows() {
                y[j] = y[j] + self[(i, j)] * x[i];
            }
        }
    }
}

impl<'a, T: Float> MatTransVec<T> for MatRef<'a, T> {
    fn mattransvec(&self, x: &[T], y: &mut [T]) {
        assert_eq!(self.nrows(), x.len(), "input vector x has incorrect length");
        assert_eq!(self.ncols(), y.len(), "output vector y has incorrect length");
        for j in 0..self.ncols() {
            y[j] = T::zero();
            for i in 0..self.nrows() {
                y[j] = y[j] + self[(i, j)] * x[i];
            }
        }
    }
}

/// Local dot product and norm, Rayon-parallel when the feature is enabled.
pub struct LocalInnerProduct;

impl<T: Float + Send + Sync> InnerProduct<T> for LocalInnerProduct {
    fn dot(&self, x: &[T], y: &[T]) -> T {
        assert_eq!(x.len(), y.len(), "vectors must have the same length");
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            x.par_iter()
                .zip(y.par_iter())
                .map(|(xi, yi)| *xi * *yi)
                .reduce(|| T::zero(), |acc, v| acc + v)
        }
        #[cfg(not(feature = "rayon"))]
        {
            x.iter()
                .zip(y.iter())
                .map(|(xi, yi)| *xi * *yi)
                .fold(T::zero(), |acc, v| acc + v)
        }
    }

    fn norm(&self, x: &[T]) -> T {
        self.dot(x, x).sqrt()
    }
}
