//! Per-process value buffer: owned entries followed by ghost slots.

use crate::data::combine::Scalar;

/// One contiguous buffer laid out as `[owned | ghost]`.
///
/// The full slice is the *local form* of a ghosted container; slot
/// `n_owned + k` caches the k-th ghost.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalStorage<T> {
    data: Vec<T>,
    n_owned: usize,
}

impl<T: Scalar> LocalStorage<T> {
    /// Zero-initialized storage.
    pub fn zeroed(n_owned: usize, n_ghost: usize) -> Self {
        Self {
            data: vec![T::zero(); n_owned + n_ghost],
            n_owned,
        }
    }

    #[inline]
    pub fn n_owned(&self) -> usize {
        self.n_owned
    }

    #[inline]
    pub fn n_ghost(&self) -> usize {
        self.data.len() - self.n_owned
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn owned(&self) -> &[T] {
        &self.data[..self.n_owned]
    }

    pub fn owned_mut(&mut self) -> &mut [T] {
        &mut self.data[..self.n_owned]
    }

    pub fn ghosts(&self) -> &[T] {
        &self.data[self.n_owned..]
    }

    pub fn ghosts_mut(&mut self) -> &mut [T] {
        &mut self.data[self.n_owned..]
    }

    /// Owned and ghost slots together.
    pub fn local_form(&self) -> &[T] {
        &self.data
    }

    pub fn local_form_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Set every owned slot (ghosts untouched).
    pub fn fill_owned(&mut self, value: T) {
        self.owned_mut().fill(value);
    }
}
