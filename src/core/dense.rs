//! `ScalarArray` is the column-major dense tile every leaf of the block tree
//! bottoms out in.
//!
//! Storage is a flat `Vec` with a leading dimension, so `data[i + j * lda]`
//! is element `(i, j)`. Owned tiles are packed (`lda == rows`); sub-tiles are
//! exposed as strided ndarray views, never copied.

use std::io::{Read, Write};
use std::ops::{Index, IndexMut};

use ndarray::{ArrayView2, ArrayViewMut2, ShapeBuilder};
use num_traits::{Float, One, Zero};
use rand::Rng;

use crate::core::kernel::{Kernel, KernelError, Svd};
use crate::core::scalar::Scalar;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ScalarArray<T: Scalar> {
    rows: usize,
    cols: usize,
    lda: usize,
    data: Vec<T>,
}

impl<T: Scalar> ScalarArray<T> {
    /// A zeroed `rows x cols` tile.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        ScalarArray {
            rows,
            cols,
            lda: rows,
            data: vec![T::zero(); rows * cols],
        }
    }

    /// Wraps packed column-major storage.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Self {
        assert_eq!(data.len(), rows * cols, "storage must be packed column-major");
        ScalarArray {
            rows,
            cols,
            lda: rows,
            data,
        }
    }

    /// Wraps column-major storage with an explicit leading dimension.
    pub fn from_vec_with_lda(rows: usize, cols: usize, lda: usize, data: Vec<T>) -> Self {
        assert!(lda >= rows.max(1), "leading dimension below row count");
        if cols > 0 {
            assert!(data.len() >= (cols - 1) * lda + rows, "storage too short");
        }
        ScalarArray {
            rows,
            cols,
            lda,
            data,
        }
    }

    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for j in 0..cols {
            for i in 0..rows {
                data.push(f(i, j));
            }
        }
        Self::from_vec(rows, cols, data)
    }

    pub fn identity(n: usize) -> Self {
        Self::from_fn(n, n, |i, j| if i == j { T::one() } else { T::zero() })
    }

    /// A tile of uniform samples in `[-1, 1]` per component.
    pub fn random<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Self {
        Self::from_fn(rows, cols, |_, _| T::sample(rng))
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn lda(&self) -> usize {
        self.lda
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    fn tight_len(&self) -> usize {
        if self.rows == 0 || self.cols == 0 {
            0
        } else {
            (self.cols - 1) * self.lda + self.rows
        }
    }

    pub fn view(&self) -> ArrayView2<'_, T> {
        let len = self.tight_len();
        ArrayView2::from_shape(
            (self.rows, self.cols).strides((1, self.lda)),
            &self.data[..len],
        )
        .expect("tile storage is consistent")
    }

    pub fn view_mut(&mut self) -> ArrayViewMut2<'_, T> {
        let len = self.tight_len();
        ArrayViewMut2::from_shape(
            (self.rows, self.cols).strides((1, self.lda)),
            &mut self.data[..len],
        )
        .expect("tile storage is consistent")
    }

    /// Zero-copy view of the sub-tile starting at `(r0, c0)`.
    pub fn sub_view(&self, r0: usize, rows: usize, c0: usize, cols: usize) -> ArrayView2<'_, T> {
        self.view()
            .slice_move(ndarray::s![r0..r0 + rows, c0..c0 + cols])
    }

    pub fn from_view(v: ArrayView2<'_, T>) -> Self {
        let (rows, cols) = v.dim();
        Self::from_fn(rows, cols, |i, j| v[[i, j]])
    }

    /// Plain-transposed copy.
    pub fn transposed(&self) -> Self {
        Self::from_fn(self.cols, self.rows, |i, j| self[(j, i)])
    }

    pub fn fill(&mut self, value: T) {
        let (rows, cols, lda) = (self.rows, self.cols, self.lda);
        for j in 0..cols {
            for i in 0..rows {
                self.data[i + j * lda] = value;
            }
        }
    }

    pub fn scale(&mut self, alpha: T) {
        if alpha == T::one() {
            return;
        }
        let (rows, cols, lda) = (self.rows, self.cols, self.lda);
        for j in 0..cols {
            for i in 0..rows {
                self.data[i + j * lda] = self.data[i + j * lda] * alpha;
            }
        }
    }

    /// `self += alpha * other`.
    pub fn axpy(&mut self, alpha: T, other: &ScalarArray<T>) {
        debug_assert_eq!((self.rows, self.cols), (other.rows, other.cols));
        for j in 0..self.cols {
            for i in 0..self.rows {
                let v = self.data[i + j * self.lda] + alpha * other[(i, j)];
                self.data[i + j * self.lda] = v;
            }
        }
    }

    /// Frobenius norm.
    pub fn norm(&self) -> T::Real {
        self.norm_sqr().sqrt()
    }

    pub fn norm_sqr(&self) -> T::Real {
        let mut acc = T::Real::zero();
        for j in 0..self.cols {
            for i in 0..self.rows {
                acc = acc + self.data[i + j * self.lda].modulus_sqr();
            }
        }
        acc
    }

    /// `self <- alpha * op(a) * op(b) + beta * self`.
    pub fn gemm(
        &mut self,
        alpha: T,
        a: &ScalarArray<T>,
        trans_a: bool,
        b: &ScalarArray<T>,
        trans_b: bool,
        beta: T,
    ) where
        T: Kernel,
    {
        let av = if trans_a { a.view().reversed_axes() } else { a.view() };
        let bv = if trans_b { b.view().reversed_axes() } else { b.view() };
        debug_assert_eq!(av.nrows(), self.rows);
        debug_assert_eq!(bv.ncols(), self.cols);
        debug_assert_eq!(av.ncols(), bv.nrows());
        T::gemm(alpha, av, bv, beta, self.view_mut());
    }

    /// Pivoted LU, in place.
    pub fn lu_in_place(&mut self) -> std::result::Result<Vec<usize>, KernelError>
    where
        T: Kernel,
    {
        T::getrf(self.view_mut())
    }

    /// In-place inverse through LU.
    pub fn inverse_in_place(&mut self) -> std::result::Result<(), KernelError>
    where
        T: Kernel,
    {
        let ipiv = T::getrf(self.view_mut())?;
        T::getri(self.view_mut(), &ipiv)
    }

    pub fn svd(&self) -> std::result::Result<Svd<T>, KernelError>
    where
        T: Kernel,
    {
        T::gesvd(self.view())
    }

    pub fn is_all_finite(&self) -> bool {
        for j in 0..self.cols {
            for i in 0..self.rows {
                if !self.data[i + j * self.lda].is_finite_scalar() {
                    return false;
                }
            }
        }
        true
    }

    /// Writes `i32 rows, i32 cols` followed by the scalars in column-major
    /// order, native endianness. Padding columns (`lda > rows`) are not
    /// persisted.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&(self.rows as i32).to_ne_bytes())?;
        w.write_all(&(self.cols as i32).to_ne_bytes())?;
        for j in 0..self.cols {
            for i in 0..self.rows {
                self.data[i + j * self.lda].write_raw(w)?;
            }
        }
        Ok(())
    }

    /// Reads a tile written by `write_to`.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut header = [0_u8; 4];
        r.read_exact(&mut header)?;
        let rows = i32::from_ne_bytes(header);
        r.read_exact(&mut header)?;
        let cols = i32::from_ne_bytes(header);
        if rows < 0 || cols < 0 {
            return Err(Error::InvalidShape {
                rows: rows.max(0) as usize,
                cols: cols.max(0) as usize,
                expected_rows: 0,
                expected_cols: 0,
            });
        }
        let (rows, cols) = (rows as usize, cols as usize);
        let mut data = Vec::with_capacity(rows * cols);
        for _ in 0..rows * cols {
            data.push(T::read_raw(r)?);
        }
        Ok(Self::from_vec(rows, cols, data))
    }
}

impl<T: Scalar> Index<(usize, usize)> for ScalarArray<T> {
    type Output = T;

    fn index(&self, (i, j): (usize, usize)) -> &T {
        debug_assert!(i < self.rows && j < self.cols);
        &self.data[i + j * self.lda]
    }
}

impl<T: Scalar> IndexMut<(usize, usize)> for ScalarArray<T> {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut T {
        debug_assert!(i < self.rows && j < self.cols);
        &mut self.data[i + j * self.lda]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn indexing_is_column_major() {
        let a = ScalarArray::from_vec(2, 3, vec![1.0_f64, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(a[(0, 0)], 1.0);
        assert_eq!(a[(1, 0)], 2.0);
        assert_eq!(a[(0, 1)], 3.0);
        assert_eq!(a[(1, 2)], 6.0);
        assert_eq!(a.view()[[1, 2]], 6.0);
    }

    #[test]
    fn lda_views_skip_padding() {
        // 2 x 2 logical tile inside lda = 3 storage
        let data = vec![1.0_f64, 2.0, -1.0, 3.0, 4.0, -1.0];
        let a = ScalarArray::from_vec_with_lda(2, 2, 3, data);
        assert_eq!(a[(1, 1)], 4.0);
        let v = a.view();
        assert_eq!(v[[0, 1]], 3.0);
        assert_eq!(a.norm_sqr(), 1.0 + 4.0 + 9.0 + 16.0);
    }

    #[test]
    fn gemm_multiplies() {
        let a = ScalarArray::from_vec(2, 2, vec![1.0_f64, 0.0, 1.0, 1.0]);
        let b = ScalarArray::from_vec(2, 2, vec![2.0_f64, 1.0, 0.0, 3.0]);
        let mut c = ScalarArray::zeros(2, 2);
        c.gemm(1.0, &a, false, &b, false, 0.0);
        // a = [[1, 1], [0, 1]], b = [[2, 0], [1, 3]]
        assert_eq!(c[(0, 0)], 3.0);
        assert_eq!(c[(0, 1)], 3.0);
        assert_eq!(c[(1, 0)], 1.0);
        assert_eq!(c[(1, 1)], 3.0);

        let mut ct = ScalarArray::zeros(2, 2);
        ct.gemm(1.0, &a, true, &b, false, 0.0);
        // a^t b = [[2, 0], [3, 3]]
        assert_eq!(ct[(0, 0)], 2.0);
        assert_eq!(ct[(1, 0)], 3.0);
        assert_eq!(ct[(1, 1)], 3.0);
    }

    #[test]
    fn serialization_roundtrip_is_bit_identical() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let a = ScalarArray::<f64>::random(5, 4, &mut rng);
        let mut buf = Vec::new();
        a.write_to(&mut buf).unwrap();
        let b = ScalarArray::<f64>::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(a.rows(), b.rows());
        assert_eq!(a.cols(), b.cols());
        for j in 0..a.cols() {
            for i in 0..a.rows() {
                assert_eq!(a[(i, j)].to_bits(), b[(i, j)].to_bits());
            }
        }
    }

    #[test]
    fn inverse_in_place_inverts() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut a = ScalarArray::<f64>::random(6, 6, &mut rng);
        for i in 0..6 {
            a[(i, i)] += 4.0;
        }
        let mut inv = a.clone();
        inv.inverse_in_place().unwrap();
        let mut id = ScalarArray::zeros(6, 6);
        id.gemm(1.0, &a, false, &inv, false, 0.0);
        for i in 0..6 {
            id[(i, i)] -= 1.0;
        }
        assert!(id.norm() < 1e-10);
    }

    #[test]
    fn seeded_random_is_reproducible() {
        let a = ScalarArray::<f32>::random(3, 3, &mut ChaCha8Rng::seed_from_u64(9));
        let b = ScalarArray::<f32>::random(3, 3, &mut ChaCha8Rng::seed_from_u64(9));
        assert_eq!(a, b);
    }
}
