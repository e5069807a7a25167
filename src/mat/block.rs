//! Row-compressed sparse block used for the diagonal and off-diagonal parts.

use crate::data::combine::{CombineMode, Scalar};
use crate::debug_invariants::DebugInvariants;
use crate::dist_error::DistError;
use itertools::Itertools;

/// Rows of `(column, value)` pairs, each row sorted by column.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseBlock<T> {
    rows: Vec<Vec<(usize, T)>>,
}

impl<T: Scalar> SparseBlock<T> {
    pub fn new(n_rows: usize) -> Self {
        Self {
            rows: vec![Vec::new(); n_rows],
        }
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    /// Stored entries (explicit zeros included).
    pub fn nnz(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    /// Combine `value` into `(row, col)`, creating the entry if needed.
    pub fn insert(&mut self, row: usize, col: usize, value: T, mode: CombineMode) {
        let r = &mut self.rows[row];
        match r.binary_search_by_key(&col, |&(c, _)| c) {
            Ok(i) => mode.apply(&mut r[i].1, value),
            Err(i) => r.insert(i, (col, value)),
        }
    }

    /// Combine `value` into an existing `(row, col)`; false if it is not stored.
    pub fn update(&mut self, row: usize, col: usize, value: T, mode: CombineMode) -> bool {
        let r = &mut self.rows[row];
        match r.binary_search_by_key(&col, |&(c, _)| c) {
            Ok(i) => {
                mode.apply(&mut r[i].1, value);
                true
            }
            Err(_) => false,
        }
    }

    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        let r = self.rows.get(row)?;
        r.binary_search_by_key(&col, |&(c, _)| c)
            .ok()
            .map(|i| r[i].1)
    }

    pub fn row(&self, row: usize) -> &[(usize, T)] {
        &self.rows[row]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [(usize, T)] {
        &mut self.rows[row]
    }

    /// Distinct columns in ascending order.
    pub fn columns(&self) -> Vec<usize> {
        self.rows
            .iter()
            .flatten()
            .map(|&(c, _)| c)
            .sorted_unstable()
            .dedup()
            .collect()
    }

    /// Copy with every column renamed through `f` (which must be monotone).
    pub fn map_columns(&self, mut f: impl FnMut(usize) -> usize) -> Self {
        Self {
            rows: self
                .rows
                .iter()
                .map(|r| r.iter().map(|&(c, v)| (f(c), v)).collect())
                .collect(),
        }
    }

    /// `y += A x`.
    #[cfg(feature = "rayon")]
    pub fn mult_add(&self, x: &[T], y: &mut [T]) {
        use rayon::prelude::*;
        y.par_iter_mut()
            .zip(self.rows.par_iter())
            .for_each(|(yi, row)| *yi += row_dot(row, x));
    }

    /// `y += A x`.
    #[cfg(not(feature = "rayon"))]
    pub fn mult_add(&self, x: &[T], y: &mut [T]) {
        for (yi, row) in y.iter_mut().zip(&self.rows) {
            *yi += row_dot(row, x);
        }
    }

    /// `y += A^T x`.
    pub fn mult_transpose_add(&self, x: &[T], y: &mut [T]) {
        for (row, &xr) in self.rows.iter().zip(x) {
            for &(c, v) in row {
                y[c] += v * xr;
            }
        }
    }
}

#[inline]
fn row_dot<T: Scalar>(row: &[(usize, T)], x: &[T]) -> T {
    row.iter().fold(T::zero(), |mut acc, &(c, v)| {
        acc += v * x[c];
        acc
    })
}

impl<T: Scalar> DebugInvariants for SparseBlock<T> {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "SparseBlock");
    }

    fn validate_invariants(&self) -> Result<(), DistError> {
        for (i, r) in self.rows.iter().enumerate() {
            if r.windows(2).any(|w| w[0].0 >= w[1].0) {
                return Err(DistError::InvalidLayout(format!(
                    "row {i} columns not strictly increasing"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_rows_sorted() {
        let mut b = SparseBlock::<f64>::new(2);
        b.insert(0, 5, 1.0, CombineMode::Insert);
        b.insert(0, 2, 2.0, CombineMode::Insert);
        b.insert(0, 5, 3.0, CombineMode::Add);
        assert_eq!(b.row(0), &[(2, 2.0), (5, 4.0)]);
        assert_eq!(b.get(0, 5), Some(4.0));
        assert_eq!(b.get(1, 5), None);
        assert_eq!(b.nnz(), 2);
        b.validate_invariants().unwrap();
    }

    #[test]
    fn update_only_touches_stored_entries() {
        let mut b = SparseBlock::<f64>::new(1);
        b.insert(0, 4, 1.0, CombineMode::Insert);
        assert!(b.update(0, 4, 2.0, CombineMode::Add));
        assert!(!b.update(0, 3, 2.0, CombineMode::Add));
        assert_eq!(b.row(0), &[(4, 3.0)]);
    }

    #[test]
    fn columns_are_distinct_and_sorted() {
        let mut b = SparseBlock::<f64>::new(2);
        b.insert(0, 9, 1.0, CombineMode::Insert);
        b.insert(1, 3, 1.0, CombineMode::Insert);
        b.insert(1, 9, 1.0, CombineMode::Insert);
        assert_eq!(b.columns(), vec![3, 9]);
    }

    #[test]
    fn mult_add_accumulates() {
        let mut b = SparseBlock::<f64>::new(2);
        b.insert(0, 0, 2.0, CombineMode::Insert);
        b.insert(0, 1, 1.0, CombineMode::Insert);
        b.insert(1, 1, 3.0, CombineMode::Insert);
        let mut y = vec![1.0, 1.0];
        b.mult_add(&[1.0, 2.0], &mut y);
        assert_eq!(y, vec![5.0, 7.0]);

        let mut z = vec![0.0; 2];
        b.mult_transpose_add(&[1.0, 2.0], &mut z);
        assert_eq!(z, vec![2.0, 7.0]);
    }
}
