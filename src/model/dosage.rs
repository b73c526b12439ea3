//! # Dosage Matrices
//!
//! Dense per-chunk result storage: one row per reference variant for imputed
//! dosages and one row per typed variant for leave-one-out dosages. Cells are
//! end-of-vector filled until a worker writes them, which keeps
//! variable-ploidy padding columns distinguishable from real zeros.

use crate::data::variant::eov_f32;

/// Per-haplotype traversal output, row-indexed.
#[derive(Clone, Debug)]
pub struct HaplotypeDosages {
    /// One dosage per reference variant in the impute region.
    pub dosages: Vec<f32>,
    /// One leave-one-out dosage per typed variant.
    pub loo_dosages: Vec<f32>,
}

impl HaplotypeDosages {
    pub fn new(n_ref_variants: usize, n_typed_variants: usize) -> Self {
        Self {
            dosages: vec![eov_f32(); n_ref_variants],
            loo_dosages: vec![eov_f32(); n_typed_variants],
        }
    }

    pub fn fill_eov(&mut self) {
        self.dosages.fill(eov_f32());
        self.loo_dosages.fill(eov_f32());
    }
}

/// Dosage and leave-one-out matrices for one haplotype group of a chunk.
#[derive(Clone, Debug, Default)]
pub struct FullDosagesResults {
    dosages: Vec<Vec<f32>>,
    loo_dosages: Vec<Vec<f32>>,
}

impl FullDosagesResults {
    /// Size both matrices, filling every cell with the end-of-vector
    /// sentinel.
    pub fn resize(&mut self, n_rows: usize, n_loo_rows: usize, n_columns: usize) {
        self.dosages = vec![vec![eov_f32(); n_columns]; n_rows];
        self.loo_dosages = vec![vec![eov_f32(); n_columns]; n_loo_rows];
    }

    /// Reset every cell to the end-of-vector sentinel (used between
    /// haplotype groups).
    pub fn fill_eov(&mut self) {
        for row in &mut self.dosages {
            row.fill(eov_f32());
        }
        for row in &mut self.loo_dosages {
            row.fill(eov_f32());
        }
    }

    /// Shrink the column dimension for a trailing, smaller haplotype group.
    pub fn shrink_columns(&mut self, n_columns: usize) {
        for row in &mut self.dosages {
            row.truncate(n_columns);
        }
        for row in &mut self.loo_dosages {
            row.truncate(n_columns);
        }
    }

    /// Scatter one haplotype's traversal output into its column.
    pub fn set_column(&mut self, column: usize, hap: &HaplotypeDosages) {
        debug_assert_eq!(hap.dosages.len(), self.dosages.len());
        debug_assert_eq!(hap.loo_dosages.len(), self.loo_dosages.len());
        for (row, &d) in self.dosages.iter_mut().zip(&hap.dosages) {
            row[column] = d;
        }
        for (row, &d) in self.loo_dosages.iter_mut().zip(&hap.loo_dosages) {
            row[column] = d;
        }
    }

    /// `[rows, columns]` of the dosage matrix.
    pub fn dimensions(&self) -> [usize; 2] {
        [
            self.dosages.len(),
            self.dosages.first().map_or(0, |r| r.len()),
        ]
    }

    /// `[rows, columns]` of the leave-one-out matrix.
    pub fn dimensions_loo(&self) -> [usize; 2] {
        [
            self.loo_dosages.len(),
            self.loo_dosages.first().map_or(0, |r| r.len()),
        ]
    }

    pub fn dosage_row(&self, i: usize) -> &[f32] {
        &self.dosages[i]
    }

    pub fn loo_dosage_row(&self, i: usize) -> &[f32] {
        &self.loo_dosages[i]
    }

    pub fn dosage(&self, i: usize, j: usize) -> f32 {
        self.dosages[i][j]
    }

    pub fn loo_dosage(&self, i: usize, j: usize) -> f32 {
        self.loo_dosages[i][j]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::variant::is_eov_f32;

    #[test]
    fn test_resize_fills_eov() {
        let mut r = FullDosagesResults::default();
        r.resize(3, 2, 4);
        assert_eq!(r.dimensions(), [3, 4]);
        assert_eq!(r.dimensions_loo(), [2, 4]);
        assert!(is_eov_f32(r.dosage(2, 3)));
        assert!(is_eov_f32(r.loo_dosage(1, 0)));
    }

    #[test]
    fn test_set_column_then_fill_eov() {
        let mut r = FullDosagesResults::default();
        r.resize(2, 1, 3);
        let mut hap = HaplotypeDosages::new(2, 1);
        hap.dosages = vec![0.25, 0.75];
        hap.loo_dosages = vec![0.5];
        r.set_column(1, &hap);
        assert_eq!(r.dosage(0, 1), 0.25);
        assert_eq!(r.dosage(1, 1), 0.75);
        assert_eq!(r.loo_dosage(0, 1), 0.5);
        assert!(is_eov_f32(r.dosage(0, 0)));
        r.fill_eov();
        assert!(is_eov_f32(r.dosage(0, 1)));
    }

    #[test]
    fn test_shrink_columns() {
        let mut r = FullDosagesResults::default();
        r.resize(2, 2, 4);
        r.shrink_columns(2);
        assert_eq!(r.dimensions(), [2, 2]);
        assert_eq!(r.dimensions_loo(), [2, 2]);
    }
}
