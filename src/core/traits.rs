//! Core linear-algebra traits for linsys.

/// Matrix–vector product: y ← A x.
pub trait MatVec<T> {
    /// Compute y = A · x.
    fn matvec(&self, x: &[T], y: &mut [T]);
}

/// Matrix-transpose–vector product: y ← Aᵀ x.
pub trait MatTransVec<T> {
    /// Compute y = Aᵀ · x.
    fn mattransvec(&self, x: &[T], y: &mut [T]);
}

/// Inner products & norms over local slices.
pub trait InnerProduct<T> {
    /// Compute dot(x, y).
    fn dot(&self, x: &[T], y: &[T]) -> T;
    /// Compute ‖x‖₂.
    fn norm(&self, x: &[T]) -> T;
}
