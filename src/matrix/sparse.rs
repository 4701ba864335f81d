//! Pattern-preallocated CSR storage with PETSc-style two-phase assembly.
//!
//! A `CsrMatrix` is created from a sparsity pattern discovered by the
//! discretization. Contributions landing inside the pattern are written in
//! place; contributions outside it spill into an overflow map and are merged
//! into the pattern by `assemble()`, which reports how many entries had to be
//! merged. The caller treats a nonzero count as a dynamic-reallocation
//! performance signal. With `ignore_off_pattern` the spill is dropped
//! instead, matching the off-process-entry-ignoring preallocation hint.

use faer::Mat;
use std::collections::BTreeMap;

pub struct CsrMatrix {
    nrows: usize,
    ncols: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
    overflow: BTreeMap<(usize, usize), f64>,
    ignore_off_pattern: bool,
    assembled: bool,
}

impl CsrMatrix {
    /// Preallocate from a per-row column pattern. Rows are sorted and
    /// deduplicated; all values start at zero.
    pub fn from_pattern(nrows: usize, ncols: usize, rows: &[Vec<usize>], ignore_off_pattern: bool) -> Self {
        assert_eq!(rows.len(), nrows, "pattern must have one entry per row");
        let mut row_ptr = Vec::with_capacity(nrows + 1);
        let mut col_idx = Vec::new();
        row_ptr.push(0);
        for cols in rows {
            let mut cols = cols.clone();
            cols.sort_unstable();
            cols.dedup();
            if let Some(&last) = cols.last() {
                assert!(last < ncols, "pattern column out of range");
            }
            col_idx.extend_from_slice(&cols);
            row_ptr.push(col_idx.len());
        }
        let nnz = col_idx.len();
        CsrMatrix {
            nrows,
            ncols,
            row_ptr,
            col_idx,
            values: vec![0.0; nnz],
            overflow: BTreeMap::new(),
            ignore_off_pattern,
            assembled: true,
        }
    }

    /// Build a CSR from raw row-ptr, col-idx, and values.
    pub fn from_csr(
        nrows: usize,
        ncols: usize,
        row_ptr: Vec<usize>,
        col_idx: Vec<usize>,
        values: Vec<f64>,
    ) -> Self {
        assert_eq!(row_ptr.len(), nrows + 1);
        assert_eq!(col_idx.len(), values.len());
        CsrMatrix {
            nrows,
            ncols,
            row_ptr,
            col_idx,
            values,
            overflow: BTreeMap::new(),
            ignore_off_pattern: false,
            assembled: true,
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.col_idx.len()
    }

    pub fn is_assembled(&self) -> bool {
        self.assembled
    }

    /// The current structure as (row_ptr, col_idx) slices.
    pub fn structure(&self) -> (&[usize], &[usize]) {
        (&self.row_ptr, &self.col_idx)
    }

    /// Zero all stored values and discard any pending overflow.
    pub fn zero(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0.0);
        self.overflow.clear();
        self.assembled = true;
    }

    fn slot(&self, i: usize, j: usize) -> Option<usize> {
        let row = &self.col_idx[self.row_ptr[i]..self.row_ptr[i + 1]];
        row.binary_search(&j).ok().map(|k| self.row_ptr[i] + k)
    }

    /// Add `v` into entry (i, j).
    pub fn add(&mut self, i: usize, j: usize, v: f64) {
        assert!(i < self.nrows && j < self.ncols, "index out of range");
        match self.slot(i, j) {
            Some(k) => self.values[k] += v,
            None if self.ignore_off_pattern => {}
            None => {
                *self.overflow.entry((i, j)).or_insert(0.0) += v;
                self.assembled = false;
            }
        }
    }

    /// Overwrite entry (i, j) with `v`.
    pub fn set(&mut self, i: usize, j: usize, v: f64) {
        assert!(i < self.nrows && j < self.ncols, "index out of range");
        match self.slot(i, j) {
            Some(k) => self.values[k] = v,
            None if self.ignore_off_pattern => {}
            None => {
                self.overflow.insert((i, j), v);
                self.assembled = false;
            }
        }
    }

    /// Merge pending overflow entries into the pattern. Returns the number of
    /// entries merged; nonzero means the preallocated pattern was too small
    /// and the structure had to grow.
    pub fn assemble(&mut self) -> usize {
        if self.overflow.is_empty() {
            self.assembled = true;
            return 0;
        }
        let merged = self.overflow.len();
        let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); self.nrows];
        for i in 0..self.nrows {
            for k in self.row_ptr[i]..self.row_ptr[i + 1] {
                rows[i].push((self.col_idx[k], self.values[k]));
            }
        }
        for (&(i, j), &v) in &self.overflow {
            rows[i].push((j, v));
        }
        let mut row_ptr = Vec::with_capacity(self.nrows + 1);
        let mut col_idx = Vec::new();
        let mut values = Vec::new();
        row_ptr.push(0);
        for row in &mut rows {
            row.sort_unstable_by_key(|&(j, _)| j);
            for &(j, v) in row.iter() {
                col_idx.push(j);
                values.push(v);
            }
            row_ptr.push(col_idx.len());
        }
        self.row_ptr = row_ptr;
        self.col_idx = col_idx;
        self.values = values;
        self.overflow.clear();
        self.assembled = true;
        merged
    }

    /// Compute y = A * x. `x.len() == ncols()`, `y.len() == nrows()`.
    pub fn spmv(&self, x: &[f64], y: &mut [f64]) {
        assert!(self.assembled, "spmv on an unassembled matrix");
        assert_eq!(x.len(), self.ncols);
        assert_eq!(y.len(), self.nrows);
        for i in 0..self.nrows {
            let mut sum = 0.0;
            for k in self.row_ptr[i]..self.row_ptr[i + 1] {
                sum += self.values[k] * x[self.col_idx[k]];
            }
            y[i] = sum;
        }
    }

    /// Compute y = Aᵀ * x. `x.len() == nrows()`, `y.len() == ncols()`.
    pub fn spmv_transpose(&self, x: &[f64], y: &mut [f64]) {
        assert!(self.assembled, "spmv on an unassembled matrix");
        assert_eq!(x.len(), self.nrows);
        assert_eq!(y.len(), self.ncols);
        y.iter_mut().for_each(|v| *v = 0.0);
        for i in 0..self.nrows {
            for k in self.row_ptr[i]..self.row_ptr[i + 1] {
                y[self.col_idx[k]] += self.values[k] * x[i];
            }
        }
    }

    /// The main diagonal; entries missing from the pattern read as zero.
    pub fn diag(&self) -> Vec<f64> {
        let n = self.nrows.min(self.ncols);
        let mut d = vec![0.0; n];
        for (i, di) in d.iter_mut().enumerate() {
            if let Some(k) = self.slot(i, i) {
                *di = self.values[k];
            }
        }
        d
    }

    /// Dense copy, used by the sparse-direct numeric factorization.
    pub fn to_dense(&self) -> Mat<f64> {
        let mut a = Mat::<f64>::zeros(self.nrows, self.ncols);
        for i in 0..self.nrows {
            for k in self.row_ptr[i]..self.row_ptr[i + 1] {
                a[(i, self.col_idx[k])] = self.values[k];
            }
        }
        a
    }
}
