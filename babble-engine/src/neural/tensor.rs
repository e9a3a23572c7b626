//! Minimal row-major matrix type for the character model.
//!
//! The model needs exactly four operations: vector-times-matrix for forward
//! passes, matrix-times-vector for backward passes, outer-product
//! accumulation for weight gradients, and seeded initialization. Biases are
//! single-row matrices.

use rand::Rng;
use rand::rngs::StdRng;

#[derive(Debug, Clone, PartialEq)]
pub struct Mat {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Mat {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Xavier-uniform initialization in ±sqrt(6 / (rows + cols)).
    pub fn uniform(rows: usize, cols: usize, rng: &mut StdRng) -> Self {
        let bound = (6.0 / (rows + cols) as f32).sqrt();
        let data = (0..rows * cols)
            .map(|_| (rng.random::<f32>() * 2.0 - 1.0) * bound)
            .collect();
        Self { rows, cols, data }
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.rows, self.cols)
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// `v · M` for a row vector `v` of length `rows`; returns length `cols`.
    pub fn vecmul(&self, v: &[f32]) -> Vec<f32> {
        debug_assert_eq!(v.len(), self.rows);
        let mut out = vec![0.0; self.cols];
        for (r, &x) in v.iter().enumerate() {
            if x == 0.0 {
                continue;
            }
            for (o, &w) in out.iter_mut().zip(self.row(r)) {
                *o += x * w;
            }
        }
        out
    }

    /// `M · v` for a column vector `v` of length `cols`; returns length
    /// `rows`. The transpose application used by backward passes.
    pub fn vecmul_t(&self, v: &[f32]) -> Vec<f32> {
        debug_assert_eq!(v.len(), self.cols);
        let mut out = vec![0.0; self.rows];
        for (r, o) in out.iter_mut().enumerate() {
            let row = self.row(r);
            let mut acc = 0.0;
            for (&w, &x) in row.iter().zip(v) {
                acc += w * x;
            }
            *o = acc;
        }
        out
    }

    /// `self += outer(v_in, dv_out)`: gradient accumulation for a weight
    /// matrix applied as `v_in · M`.
    pub fn add_outer(&mut self, v_in: &[f32], dv_out: &[f32]) {
        debug_assert_eq!(v_in.len(), self.rows);
        debug_assert_eq!(dv_out.len(), self.cols);
        for (r, &x) in v_in.iter().enumerate() {
            if x == 0.0 {
                continue;
            }
            for (w, &d) in self.row_mut(r).iter_mut().zip(dv_out) {
                *w += x * d;
            }
        }
    }
}

/// `a += b`, elementwise.
pub fn add_assign(a: &mut [f32], b: &[f32]) {
    debug_assert_eq!(a.len(), b.len());
    for (x, &y) in a.iter_mut().zip(b) {
        *x += y;
    }
}

/// Dot product.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

/// In-place stable softmax.
pub fn softmax(xs: &mut [f32]) {
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for x in xs.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    for x in xs.iter_mut() {
        *x /= sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_vecmul() {
        // M = [[1, 2], [3, 4], [5, 6]]
        let m = Mat {
            rows: 3,
            cols: 2,
            data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        };
        assert_eq!(m.vecmul(&[1.0, 0.0, 2.0]), vec![11.0, 14.0]);
        assert_eq!(m.vecmul_t(&[1.0, 1.0]), vec![3.0, 7.0, 11.0]);
    }

    #[test]
    fn test_add_outer() {
        let mut m = Mat::zeros(2, 2);
        m.add_outer(&[1.0, 2.0], &[3.0, 4.0]);
        assert_eq!(m.data, vec![3.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_softmax_normalizes() {
        let mut xs = vec![1.0, 2.0, 3.0];
        softmax(&mut xs);
        assert!((xs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(xs[2] > xs[1] && xs[1] > xs[0]);
    }

    #[test]
    fn test_softmax_large_inputs_stable() {
        let mut xs = vec![1000.0, 1001.0];
        softmax(&mut xs);
        assert!(xs.iter().all(|x| x.is_finite()));
        assert!((xs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_uniform_is_seeded() {
        let a = Mat::uniform(4, 4, &mut StdRng::seed_from_u64(1));
        let b = Mat::uniform(4, 4, &mut StdRng::seed_from_u64(1));
        assert_eq!(a, b);
    }
}
