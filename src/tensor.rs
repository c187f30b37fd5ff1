//! Tensor Operations for Neural Networks
//!
//! A minimal dense tensor built for the transformer in this crate. Tensors
//! store a flat `Vec<f32>` in row-major order together with shape and stride
//! information.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f32>` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor (e.g., `[batch, seq, dim]`)
//! - **Strides**: Step sizes for each dimension to compute flat indices
//!
//! ## Broadcasting
//!
//! Binary element-wise operations accept three layouts for the right-hand side:
//!
//! - the same shape as `self`;
//! - a trailing suffix of `self`'s shape (a `[C]` bias added to `[B, T, C]`,
//!   a `[T, T]` mask applied to `[B, H, T, T]`);
//! - `self`'s shape with the last dimension set to 1 (the output of a
//!   `keepdim` reduction such as [`Tensor::mean`]).
//!
//! Anything else is a programming error and panics with both shapes.
//!
//! ## Example
//!
//! ```rust
//! use verdict::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let c = a.matmul(&b);
//! assert_eq!(c.shape, vec![2, 2]);
//! assert_eq!(c.data, vec![4.0, 5.0, 10.0, 11.0]);
//! ```
//!
//! ## Performance
//!
//! Matrix multiplication, element-wise operations and row reductions run in
//! parallel via Rayon. Matmul uses an 8×8 cache-blocked kernel whose inner
//! loop is written so LLVM can auto-vectorize it.

use rayon::prelude::*;

/// Below this many multiply-adds a 2D matmul runs sequentially
const PARALLEL_MATMUL_THRESHOLD: usize = 1_000;

/// Block edge for the cache-blocked matmul kernel
const BLOCK_SIZE: usize = 8;

/// A multi-dimensional array of `f32`
///
/// For shape `[2, 3]` the data is stored as
/// `[r0c0, r0c1, r0c2, r1c0, r1c1, r1c2]` with strides `[3, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
    /// Strides for each dimension (computed from shape)
    pub strides: Vec<usize>,
}

/// How the right-hand operand of a binary op lines up with the left
enum Broadcast {
    Exact,
    Trailing(usize),
    KeepDim(usize),
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: Vec<usize>) -> Self {
        Self::full(shape, 1.0)
    }

    /// Create a tensor with every element set to `value`
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Size of the last dimension (1 for a scalar tensor)
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Compute strides from shape (row-major layout)
    ///
    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    fn resolve_axis(&self, axis: isize) -> usize {
        let ndim = self.shape.len() as isize;
        let resolved = if axis < 0 { ndim + axis } else { axis };
        assert!(
            (0..ndim).contains(&resolved),
            "Axis {} out of range for shape {:?}",
            axis,
            self.shape
        );
        resolved as usize
    }

    /// Computes `result[j] += a_val * b[j]`, shaped for auto-vectorization
    #[inline(always)]
    fn matmul_inner_simd(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// Matrix multiplication
    ///
    /// Supports:
    /// - 2D × 2D: `[m, k] @ [k, n] -> [m, n]`
    /// - 4D × 4D: batched `[b, h, m, k] @ [b, h, k, n] -> [b, h, m, n]`,
    ///   used by attention. Each (batch, head) pair is independent and runs
    ///   in parallel.
    ///
    /// # Panics
    ///
    /// Panics if dimensions are incompatible or unsupported
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        // === 2D MATRIX MULTIPLICATION ===
        if self.shape.len() == 2 && other.shape.len() == 2 {
            assert_eq!(
                self.shape[1], other.shape[0],
                "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
                self.shape[0], self.shape[1], other.shape[0], other.shape[1]
            );

            let m = self.shape[0];
            let k = self.shape[1];
            let n = other.shape[1];

            if m * n * k >= PARALLEL_MATMUL_THRESHOLD {
                return self.matmul_parallel_blocked(other, m, n, k);
            }

            let mut result = vec![0.0; m * n];
            for i in 0..m {
                for l in 0..k {
                    Self::matmul_inner_simd(
                        self.data[i * k + l],
                        &other.data[l * n..(l + 1) * n],
                        &mut result[i * n..(i + 1) * n],
                    );
                }
            }
            return Tensor::new(result, vec![m, n]);
        }

        // === 4D BATCHED MATRIX MULTIPLICATION (for attention) ===
        if self.shape.len() == 4 && other.shape.len() == 4 {
            let (batch, n_heads, m, k) = (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
            let n = other.shape[3];

            assert!(
                other.shape[0] == batch && other.shape[1] == n_heads && other.shape[2] == k,
                "Batched matmul shapes incompatible: {:?} @ {:?}",
                self.shape,
                other.shape
            );

            let mut result = vec![0.0; batch * n_heads * m * n];
            if m * n == 0 {
                return Tensor::new(result, vec![batch, n_heads, m, n]);
            }

            result
                .par_chunks_mut(m * n)
                .enumerate()
                .for_each(|(bh, chunk)| {
                    let a = &self.data[bh * m * k..(bh + 1) * m * k];
                    let b = &other.data[bh * k * n..(bh + 1) * k * n];
                    for i in 0..m {
                        for l in 0..k {
                            Self::matmul_inner_simd(
                                a[i * k + l],
                                &b[l * n..(l + 1) * n],
                                &mut chunk[i * n..(i + 1) * n],
                            );
                        }
                    }
                });

            return Tensor::new(result, vec![batch, n_heads, m, n]);
        }

        panic!(
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape, other.shape
        );
    }

    /// Parallel cache-blocked matrix multiplication
    ///
    /// Output rows are split into blocks of [`BLOCK_SIZE`] handed to Rayon;
    /// within a block the column and inner dimensions are walked in 8×8 tiles.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                Self::matmul_inner_simd(
                                    self.data[i * k + k_idx],
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Softmax along the last axis
    ///
    /// ```text
    /// softmax(x)[i] = exp(x[i] - max(x)) / sum(exp(x[j] - max(x)))
    /// ```
    ///
    /// Works for any rank; each row of the last dimension is normalized
    /// independently and in parallel. A row made entirely of `-inf` has no
    /// valid entry and comes out as all zeros.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use verdict::Tensor;
    /// let t = Tensor::new(vec![1.0, 2.0, 3.0, f32::NEG_INFINITY], vec![1, 4]);
    /// let s = t.softmax(-1);
    /// assert!((s.data.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    /// assert_eq!(s.data[3], 0.0);
    /// ```
    pub fn softmax(&self, axis: isize) -> Tensor {
        let axis = self.resolve_axis(axis);
        assert_eq!(
            axis,
            self.shape.len() - 1,
            "softmax is only supported along the last axis"
        );

        let cols = self.last_dim();
        let mut result = self.data.clone();
        if cols == 0 {
            return Tensor::new(result, self.shape.clone());
        }

        result.par_chunks_mut(cols).for_each(|row| {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            if max == f32::NEG_INFINITY {
                row.iter_mut().for_each(|x| *x = 0.0);
                return;
            }
            let mut sum = 0.0;
            for x in row.iter_mut() {
                *x = (*x - max).exp();
                sum += *x;
            }
            for x in row.iter_mut() {
                *x /= sum;
            }
        });

        Tensor::new(result, self.shape.clone())
    }

    fn broadcast_kind(&self, other: &Tensor) -> Broadcast {
        if self.shape == other.shape {
            return Broadcast::Exact;
        }
        let n = self.shape.len();
        let k = other.shape.len();
        if k <= n && self.shape[n - k..] == other.shape[..] {
            return Broadcast::Trailing(other.numel().max(1));
        }
        if k == n && n > 0 && other.shape[n - 1] == 1 && self.shape[..n - 1] == other.shape[..n - 1] {
            return Broadcast::KeepDim(self.shape[n - 1]);
        }
        panic!(
            "Cannot broadcast shape {:?} onto {:?}",
            other.shape, self.shape
        );
    }

    /// Apply a binary operation element-wise with broadcasting
    fn zip_with<F>(&self, other: &Tensor, op: F) -> Tensor
    where
        F: Fn(f32, f32) -> f32 + Sync,
    {
        let data = match self.broadcast_kind(other) {
            Broadcast::Exact => self
                .data
                .par_iter()
                .zip(other.data.par_iter())
                .map(|(&a, &b)| op(a, b))
                .collect(),
            Broadcast::Trailing(period) => self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &a)| op(a, other.data[i % period]))
                .collect(),
            Broadcast::KeepDim(row) => self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &a)| op(a, other.data[i / row]))
                .collect(),
        };
        Tensor::new(data, self.shape.clone())
    }

    /// Element-wise addition with broadcasting
    ///
    /// ```rust
    /// # use verdict::Tensor;
    /// let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// let bias = Tensor::new(vec![10.0, 20.0], vec![2]);
    /// assert_eq!(x.add(&bias).data, vec![11.0, 22.0, 13.0, 24.0]);
    /// ```
    pub fn add(&self, other: &Tensor) -> Tensor {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Tensor {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor) -> Tensor {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn div(&self, other: &Tensor) -> Tensor {
        self.zip_with(other, |a, b| a / b)
    }

    /// Apply `f` to every element
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        let data = self.data.par_iter().map(|&x| f(x)).collect();
        Tensor::new(data, self.shape.clone())
    }

    pub fn add_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x + scalar)
    }

    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x * scalar)
    }

    pub fn div_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x / scalar)
    }

    pub fn sqrt(&self) -> Tensor {
        self.map(f32::sqrt)
    }

    /// In-place `self += other` for tensors of identical shape
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(self.shape, other.shape, "add_assign shape mismatch");
        self.data
            .par_iter_mut()
            .zip(other.data.par_iter())
            .for_each(|(a, &b)| *a += b);
    }

    /// Reshape tensor to new shape
    ///
    /// Total number of elements must remain the same.
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.data.len(),
            new_size,
            "Cannot reshape {:?} into {:?}: element count mismatch",
            self.shape,
            new_shape
        );
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Swap two dimensions, producing a new contiguous tensor
    ///
    /// Each output index is decomposed with the output's own strides, and the
    /// coordinates are weighted by the input strides with the two axes swapped.
    ///
    /// ```rust
    /// # use verdict::Tensor;
    /// let t = Tensor::new((0..6).map(|x| x as f32).collect(), vec![1, 2, 3]);
    /// let tt = t.transpose(1, 2);
    /// assert_eq!(tt.shape, vec![1, 3, 2]);
    /// assert_eq!(tt.data, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    /// ```
    pub fn transpose(&self, dim1: isize, dim2: isize) -> Tensor {
        let d1 = self.resolve_axis(dim1);
        let d2 = self.resolve_axis(dim2);

        let mut new_shape = self.shape.clone();
        new_shape.swap(d1, d2);
        if d1 == d2 {
            return self.clone();
        }

        let out_strides = Self::compute_strides(&new_shape);
        let mut src_strides = self.strides.clone();
        src_strides.swap(d1, d2);

        let result = (0..self.data.len())
            .into_par_iter()
            .map(|i| {
                let mut remaining = i;
                let mut src = 0;
                for (&out_stride, &src_stride) in out_strides.iter().zip(&src_strides) {
                    src += (remaining / out_stride) * src_stride;
                    remaining %= out_stride;
                }
                self.data[src]
            })
            .collect();

        Tensor::new(result, new_shape)
    }

    /// Replace values where `mask` is non-zero with `value`
    ///
    /// The mask broadcasts like the right-hand side of [`Tensor::add`], so a
    /// `[T, T]` causal mask applies to every `[B, H, T, T]` score matrix.
    pub fn masked_fill(&self, mask: &Tensor, value: f32) -> Tensor {
        self.zip_with(mask, |x, m| if m != 0.0 { value } else { x })
    }

    /// Sum along the last axis
    pub fn sum(&self, axis: isize, keepdim: bool) -> Tensor {
        self.reduce_last(axis, keepdim, |row| row.iter().sum())
    }

    /// Mean along the last axis
    pub fn mean(&self, axis: isize, keepdim: bool) -> Tensor {
        self.reduce_last(axis, keepdim, |row| {
            row.iter().sum::<f32>() / row.len() as f32
        })
    }

    /// Population variance along the last axis (divides by N)
    pub fn var(&self, axis: isize, keepdim: bool) -> Tensor {
        self.reduce_last(axis, keepdim, |row| {
            let n = row.len() as f32;
            let mean = row.iter().sum::<f32>() / n;
            row.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>() / n
        })
    }

    fn reduce_last<F>(&self, axis: isize, keepdim: bool, f: F) -> Tensor
    where
        F: Fn(&[f32]) -> f32 + Sync + Send,
    {
        let axis = self.resolve_axis(axis);
        assert_eq!(
            axis,
            self.shape.len() - 1,
            "reductions are only supported along the last axis"
        );

        let cols = self.last_dim();
        let data: Vec<f32> = self.data.par_chunks(cols.max(1)).map(f).collect();

        let mut shape = self.shape.clone();
        if keepdim {
            shape[axis] = 1;
        } else {
            shape.pop();
        }
        Tensor::new(data, shape)
    }

    /// Sum over every leading axis, leaving a tensor of shape `[last_dim]`
    ///
    /// This is the reduction a bias gradient needs: `[B, T, C] -> [C]`.
    pub fn sum_rows(&self) -> Tensor {
        let cols = self.last_dim();
        let data = self
            .data
            .par_chunks(cols.max(1))
            .fold(
                || vec![0.0; cols],
                |mut acc, row| {
                    for (a, &x) in acc.iter_mut().zip(row) {
                        *a += x;
                    }
                    acc
                },
            )
            .reduce(
                || vec![0.0; cols],
                |mut a, b| {
                    for (x, y) in a.iter_mut().zip(b) {
                        *x += y;
                    }
                    a
                },
            );
        Tensor::new(data, vec![cols])
    }

    /// Sum of squared elements
    pub fn sum_squares(&self) -> f32 {
        self.data.par_iter().map(|&x| x * x).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn seq(shape: Vec<usize>) -> Tensor {
        let n = shape.iter().product::<usize>();
        Tensor::new((0..n).map(|x| x as f32).collect(), shape)
    }

    #[test]
    #[should_panic(expected = "doesn't match shape")]
    fn test_new_rejects_wrong_length() {
        Tensor::new(vec![1.0, 2.0, 3.0], vec![2, 2]);
    }

    #[test]
    fn test_strides() {
        let t = Tensor::zeros(vec![2, 3, 4]);
        assert_eq!(t.strides, vec![12, 4, 1]);
    }

    #[test]
    fn test_matmul_small_and_blocked_agree() {
        // 20 x 17 @ 17 x 13 crosses the parallel threshold and has ragged blocks
        let a = Tensor::new((0..340).map(|x| (x % 7) as f32 - 3.0).collect(), vec![20, 17]);
        let b = Tensor::new((0..221).map(|x| (x % 5) as f32 * 0.5).collect(), vec![17, 13]);
        let c = a.matmul(&b);

        for i in 0..20 {
            for j in 0..13 {
                let expected: f32 = (0..17).map(|l| a.data[i * 17 + l] * b.data[l * 13 + j]).sum();
                assert_relative_eq!(c.data[i * 13 + j], expected, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_batched_matmul_matches_per_head_2d() {
        let a = seq(vec![2, 3, 4, 5]).mul_scalar(0.1);
        let b = seq(vec![2, 3, 5, 2]).mul_scalar(0.2);
        let c = a.matmul(&b);
        assert_eq!(c.shape, vec![2, 3, 4, 2]);

        for bh in 0..6 {
            let a2 = Tensor::new(a.data[bh * 20..(bh + 1) * 20].to_vec(), vec![4, 5]);
            let b2 = Tensor::new(b.data[bh * 10..(bh + 1) * 10].to_vec(), vec![5, 2]);
            let c2 = a2.matmul(&b2);
            for (x, y) in c.data[bh * 8..(bh + 1) * 8].iter().zip(&c2.data) {
                assert_relative_eq!(*x, *y, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_transpose_4d_swaps_middle_axes() {
        let t = seq(vec![2, 3, 4, 5]);
        let tt = t.transpose(1, 2);
        assert_eq!(tt.shape, vec![2, 4, 3, 5]);
        for b in 0..2 {
            for i in 0..3 {
                for j in 0..4 {
                    for d in 0..5 {
                        let src = t.data[((b * 3 + i) * 4 + j) * 5 + d];
                        let dst = tt.data[((b * 4 + j) * 3 + i) * 5 + d];
                        assert_eq!(src, dst);
                    }
                }
            }
        }
        assert_eq!(tt.transpose(1, 2), t);
    }

    #[test]
    fn test_transpose_last_two_negative_axes() {
        let t = seq(vec![2, 2, 3]);
        let tt = t.transpose(-2, -1);
        assert_eq!(tt.shape, vec![2, 3, 2]);
        assert_eq!(tt.data[..6], [0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_softmax_rows_of_4d() {
        let t = seq(vec![2, 2, 3, 3]).mul_scalar(0.3);
        let s = t.softmax(-1);
        for row in s.data.chunks(3) {
            assert_relative_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
            assert!(row[0] < row[1] && row[1] < row[2]);
        }
    }

    #[test]
    fn test_softmax_all_masked_row_is_zero() {
        let t = Tensor::full(vec![1, 3], f32::NEG_INFINITY);
        assert_eq!(t.softmax(-1).data, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_broadcast_keepdim_and_trailing() {
        let x = seq(vec![2, 3]);
        let mean = x.mean(-1, true);
        assert_eq!(mean.shape, vec![2, 1]);
        assert_eq!(x.sub(&mean).data, vec![-1.0, 0.0, 1.0, -1.0, 0.0, 1.0]);

        let mask = Tensor::new(vec![0.0, 1.0, 0.0, 0.0], vec![2, 2]);
        let filled = Tensor::zeros(vec![3, 2, 2]).masked_fill(&mask, f32::NEG_INFINITY);
        for chunk in filled.data.chunks(4) {
            assert_eq!(chunk[1], f32::NEG_INFINITY);
            assert_eq!(chunk[0], 0.0);
        }
    }

    #[test]
    #[should_panic(expected = "Cannot broadcast")]
    fn test_incompatible_broadcast_panics() {
        seq(vec![2, 3]).add(&seq(vec![2]));
    }

    #[test]
    fn test_var_is_population_variance() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![1, 4]);
        assert_relative_eq!(x.var(-1, false).data[0], 1.25);
        assert_eq!(x.var(-1, false).shape, vec![1]);
    }

    #[test]
    fn test_sum_rows() {
        let x = seq(vec![2, 2, 3]);
        assert_eq!(x.sum_rows().data, vec![18.0, 22.0, 26.0]);
    }
}
