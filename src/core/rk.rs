//! `RkMatrix` is a low-rank factor pair `(a, b)` representing the block
//! `a * b^T`.
//!
//! Rank zero is the zero block and participates in all algebra. The scaling
//! convention is fixed: after truncation the singular values live entirely
//! in `a`; `b` carries the (conjugated, for complex scalars) right singular
//! vectors.

use ndarray::{Array2, ArrayView2, ArrayViewMut2, ShapeBuilder};
use num_traits::{Float, One, Zero};
use rand::Rng;

use crate::core::dense::ScalarArray;
use crate::core::kernel::Kernel;
use crate::core::scalar::Scalar;

#[derive(Debug, Clone, PartialEq)]
pub struct RkMatrix<T: Scalar> {
    a: ScalarArray<T>,
    b: ScalarArray<T>,
}

impl<T: Kernel> RkMatrix<T> {
    pub fn new(a: ScalarArray<T>, b: ScalarArray<T>) -> Self {
        debug_assert_eq!(a.cols(), b.cols(), "factor columns must pair up");
        RkMatrix { a, b }
    }

    /// The zero block of the given shape.
    pub fn zero(rows: usize, cols: usize) -> Self {
        RkMatrix {
            a: ScalarArray::zeros(rows, 0),
            b: ScalarArray::zeros(cols, 0),
        }
    }

    /// Random factors of exactly the given rank, for tests and benches.
    pub fn random<R: Rng + ?Sized>(rows: usize, cols: usize, rank: usize, rng: &mut R) -> Self {
        RkMatrix {
            a: ScalarArray::random(rows, rank, rng),
            b: ScalarArray::random(cols, rank, rng),
        }
    }

    pub fn rows(&self) -> usize {
        self.a.rows()
    }

    pub fn cols(&self) -> usize {
        self.b.rows()
    }

    pub fn rank(&self) -> usize {
        self.a.cols()
    }

    pub fn is_zero(&self) -> bool {
        self.rank() == 0
    }

    pub fn a(&self) -> &ScalarArray<T> {
        &self.a
    }

    pub fn b(&self) -> &ScalarArray<T> {
        &self.b
    }

    pub(crate) fn a_mut(&mut self) -> &mut ScalarArray<T> {
        &mut self.a
    }

    pub(crate) fn b_mut(&mut self) -> &mut ScalarArray<T> {
        &mut self.b
    }

    /// Scalar count of the stored factors.
    pub fn storage(&self) -> usize {
        (self.rows() + self.cols()) * self.rank()
    }

    /// Materializes `a * b^T`.
    pub fn eval(&self) -> ScalarArray<T> {
        let mut out = ScalarArray::zeros(self.rows(), self.cols());
        if !self.is_zero() {
            out.gemm(T::one(), &self.a, false, &self.b, true, T::zero());
        }
        out
    }

    /// `y <- alpha * op(self) * x + beta * y`.
    pub fn apply(
        &self,
        alpha: T,
        trans: bool,
        x: ArrayView2<'_, T>,
        beta: T,
        mut y: ArrayViewMut2<'_, T>,
    ) {
        let (left, right) = if trans { (&self.b, &self.a) } else { (&self.a, &self.b) };
        let k = self.rank();
        if k == 0 {
            if beta != T::one() {
                y.mapv_inplace(|v| v * beta);
            }
            return;
        }
        // y <- alpha * left * (right^T x) + beta * y
        let mut tmp = Array2::<T>::zeros((k, x.ncols()).f());
        T::gemm(T::one(), right.view().reversed_axes(), x, T::zero(), tmp.view_mut());
        T::gemm(alpha, left.view(), tmp.view(), beta, y);
    }

    pub fn scale(&mut self, alpha: T) {
        self.a.scale(alpha);
    }

    /// Formatted addition: `self += alpha * other` by concatenating factor
    /// columns. Rank grows to the sum; call `truncate` to restore a minimal
    /// representation.
    pub fn axpy_rk(&mut self, alpha: T, other: &RkMatrix<T>) {
        debug_assert_eq!(self.rows(), other.rows());
        debug_assert_eq!(self.cols(), other.cols());
        if other.is_zero() {
            return;
        }
        let (k1, k2) = (self.rank(), other.rank());
        let mut a = ScalarArray::zeros(self.rows(), k1 + k2);
        let mut b = ScalarArray::zeros(self.cols(), k1 + k2);
        for j in 0..k1 {
            for i in 0..self.rows() {
                a[(i, j)] = self.a[(i, j)];
            }
            for i in 0..self.cols() {
                b[(i, j)] = self.b[(i, j)];
            }
        }
        for j in 0..k2 {
            for i in 0..self.rows() {
                a[(i, k1 + j)] = alpha * other.a[(i, j)];
            }
            for i in 0..self.cols() {
                b[(i, k1 + j)] = other.b[(i, j)];
            }
        }
        self.a = a;
        self.b = b;
    }

    /// Product absorption: `(a1 b1^T)(a2 b2^T) = a1 (b1^T a2) b2^T`, the
    /// small inner matrix folded into the left factor.
    pub fn multiply_rk(&self, other: &RkMatrix<T>) -> RkMatrix<T> {
        debug_assert_eq!(self.cols(), other.rows());
        if self.is_zero() || other.is_zero() {
            return RkMatrix::zero(self.rows(), other.cols());
        }
        let mut inner = ScalarArray::zeros(self.rank(), other.rank());
        inner.gemm(T::one(), &self.b, true, &other.a, false, T::zero());
        let mut a = ScalarArray::zeros(self.rows(), other.rank());
        a.gemm(T::one(), &self.a, false, &inner, false, T::zero());
        RkMatrix::new(a, other.b.clone())
    }

    /// Rank-revealing recompression to relative accuracy `epsilon`.
    ///
    /// Orthonormalizes each factor with pivoted Gram-Schmidt, takes the SVD
    /// of the small core and truncates at `sigma_k <= epsilon * sigma_0`.
    pub fn truncate(&mut self, epsilon: T::Real) -> crate::error::Result<()> {
        let (m, n) = (self.rows(), self.cols());
        let k = self.rank();
        if k == 0 {
            return Ok(());
        }
        // past half the block size the dense detour is cheaper and tighter
        if k >= m.min(n) {
            let dense = self.eval();
            *self = crate::compression::svd_compress(dense.view(), epsilon)?;
            return Ok(());
        }
        let tight = T::eps() * crate::core::scalar::real_of::<T>(4.0);
        let qa = crate::compression::mgs::mgs_impl(self.a.view(), tight);
        let qb = crate::compression::mgs::mgs_impl(self.b.view(), tight);
        if qa.rank == 0 || qb.rank == 0 {
            *self = RkMatrix::zero(m, n);
            return Ok(());
        }
        // core = ra * rb^T, shape rank_a x rank_b
        let mut core = Array2::<T>::zeros((qa.rank, qb.rank).f());
        T::gemm(
            T::one(),
            qa.r.view(),
            qb.r.view().reversed_axes(),
            T::zero(),
            core.view_mut(),
        );
        let svd = T::gesvd(core.view()).map_err(crate::error::Error::from)?;
        let sigma0 = svd.sigma.first().copied().unwrap_or_else(T::Real::zero);
        if !(sigma0 > T::Real::zero()) {
            *self = RkMatrix::zero(m, n);
            return Ok(());
        }
        let cut = epsilon * sigma0;
        let new_k = svd.sigma.iter().take_while(|&&s| s > cut).count();
        if new_k == 0 {
            *self = RkMatrix::zero(m, n);
            return Ok(());
        }
        // a <- qa * (u_k sigma_k), b <- qb * conj(v_k)
        let mut us = Array2::<T>::zeros((qa.rank, new_k).f());
        for j in 0..new_k {
            for i in 0..qa.rank {
                us[[i, j]] = svd.u[[i, j]].mul_real(svd.sigma[j]);
            }
        }
        let mut a = ScalarArray::zeros(m, new_k);
        T::gemm(T::one(), qa.q.view(), us.view(), T::zero(), a.view_mut());
        // conj(v)[i, j] is exactly vt[j, i]
        let mut vk = Array2::<T>::zeros((qb.rank, new_k).f());
        for j in 0..new_k {
            for i in 0..qb.rank {
                vk[[i, j]] = svd.vt[[j, i]];
            }
        }
        let mut b = ScalarArray::zeros(n, new_k);
        T::gemm(T::one(), qb.q.view(), vk.view(), T::zero(), b.view_mut());
        self.a = a;
        self.b = b;
        Ok(())
    }

    /// The sub-block spanning the given row and column ranges, as its own
    /// factor pair (rows of `a` and of `b` are copied; rank is unchanged).
    pub fn restrict(&self, rows: std::ops::Range<usize>, cols: std::ops::Range<usize>) -> RkMatrix<T> {
        let k = self.rank();
        let a = ScalarArray::from_fn(rows.len(), k, |i, j| self.a[(rows.start + i, j)]);
        let b = ScalarArray::from_fn(cols.len(), k, |i, j| self.b[(cols.start + i, j)]);
        RkMatrix::new(a, b)
    }

    /// Frobenius norm without materializing the product:
    /// `|a b^T|_F^2 = tr(conj(gb) * ga)` over the factor Gram matrices.
    pub fn norm(&self) -> T::Real {
        self.norm_sqr().sqrt()
    }

    pub fn norm_sqr(&self) -> T::Real {
        let k = self.rank();
        if k == 0 {
            return T::Real::zero();
        }
        let gram = |f: &ScalarArray<T>, i: usize, j: usize| -> T {
            let mut acc = T::zero();
            for r in 0..f.rows() {
                acc = acc + f[(r, i)].conj() * f[(r, j)];
            }
            acc
        };
        let mut acc = T::Real::zero();
        for i in 0..k {
            for j in 0..k {
                acc = acc + (gram(&self.a, i, j) * gram(&self.b, i, j).conj()).re();
            }
        }
        if acc < T::Real::zero() {
            T::Real::zero()
        } else {
            acc
        }
    }

    pub fn is_all_finite(&self) -> bool {
        self.a.is_all_finite() && self.b.is_all_finite()
    }
}
