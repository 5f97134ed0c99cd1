//! Dense kernels in the style of the BLAS/LAPACK entry points, dispatched
//! through the scalar type.
//!
//! `Kernel` extends `Scalar` with the dense routines the block algebra
//! consumes at leaves. Every routine has a portable default body; the four
//! per-type impls are empty so a provider can override any routine for any
//! scalar type with a tuned or externally linked version without touching
//! the call sites.
//!
//! Triangular factors follow the complex-*symmetric* convention (plain
//! transpose, complex square roots); orthogonal factors (QR, SVD) are
//! unitary in the usual Hermitian sense.

use ndarray::linalg::{general_mat_mul, general_mat_vec_mul};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, ShapeBuilder};
use num_complex::Complex;
use num_traits::{Float, One, Zero};

use crate::constants::JACOBI_MAX_SWEEPS;
use crate::core::scalar::Scalar;

/// Which side a triangular or orthogonal operand is applied from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Which triangle of a factor participates in a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Part {
    /// Non-unit lower triangle (Cholesky factor).
    Lower,
    /// Unit lower triangle (LU / LDL^T factor).
    UnitLower,
    /// Non-unit upper triangle.
    Upper,
}

impl Part {
    pub fn is_unit(self) -> bool {
        matches!(self, Part::UnitLower)
    }
}

/// Nonzero info code from a dense routine, surfaced verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelError {
    pub routine: &'static str,
    pub info: i32,
}

/// Full singular value decomposition `a = u * diag(sigma) * vt`, with `vt`
/// the conjugate transpose of the right singular vectors and `sigma` sorted
/// in non-increasing order.
#[derive(Debug, Clone)]
pub struct Svd<T: Scalar> {
    pub u: Array2<T>,
    pub sigma: Vec<T::Real>,
    pub vt: Array2<T>,
}

/// Dense-kernel provider for one scalar type.
pub trait Kernel: Scalar {
    /// `c <- alpha * a * b + beta * c`.
    fn gemm(
        alpha: Self,
        a: ArrayView2<'_, Self>,
        b: ArrayView2<'_, Self>,
        beta: Self,
        mut c: ArrayViewMut2<'_, Self>,
    ) {
        general_mat_mul(alpha, &a, &b, beta, &mut c);
    }

    /// `y <- alpha * a * x + beta * y`.
    fn gemv(
        alpha: Self,
        a: ArrayView2<'_, Self>,
        x: ArrayView1<'_, Self>,
        beta: Self,
        mut y: ArrayViewMut1<'_, Self>,
    ) {
        general_mat_vec_mul(alpha, &a, &x, beta, &mut y);
    }

    /// Rank-1 update `a <- a + alpha * x * y^T` (transpose, no conjugation).
    fn ger(
        alpha: Self,
        x: ArrayView1<'_, Self>,
        y: ArrayView1<'_, Self>,
        mut a: ArrayViewMut2<'_, Self>,
    ) {
        for j in 0..y.len() {
            let s = alpha * y[j];
            if s != Self::zero() {
                for i in 0..x.len() {
                    a[[i, j]] = a[[i, j]] + x[i] * s;
                }
            }
        }
    }

    /// LU factorization with partial (row) pivoting, in place. Returns the
    /// pivot vector: row `j` was swapped with row `ipiv[j] >= j`.
    fn getrf(a: ArrayViewMut2<'_, Self>) -> Result<Vec<usize>, KernelError> {
        lu_factor(a)
    }

    /// Applies a `getrf` pivot vector to the rows of `b`, in order.
    fn laswp(mut b: ArrayViewMut2<'_, Self>, ipiv: &[usize]) {
        let n = b.ncols();
        for (j, &p) in ipiv.iter().enumerate() {
            if p != j {
                for c in 0..n {
                    let t = b[[j, c]];
                    b[[j, c]] = b[[p, c]];
                    b[[p, c]] = t;
                }
            }
        }
    }

    /// Triangular solve `op(a) * x = b` (left) or `x * op(a) = b` (right),
    /// overwriting `b` with the solution. `trans` selects the plain
    /// transpose of the stored triangle.
    fn trsm(side: Side, part: Part, trans: bool, a: ArrayView2<'_, Self>, b: ArrayViewMut2<'_, Self>) {
        match side {
            Side::Left => triangular_solve_left(part, trans, a, b),
            Side::Right => triangular_solve_left(part, !trans, a, b.reversed_axes()),
        }
    }

    /// Cholesky factorization of the lower triangle, in place. Complex
    /// inputs are treated as complex symmetric.
    fn potrf(a: ArrayViewMut2<'_, Self>) -> Result<(), KernelError> {
        cholesky_factor(a)
    }

    /// Unpivoted LDL^T factorization: unit L in the strict lower triangle,
    /// D on the diagonal.
    fn ldlt(a: ArrayViewMut2<'_, Self>) -> Result<(), KernelError> {
        ldlt_factor(a)
    }

    /// Householder QR, in place: R in the upper triangle, reflectors below
    /// the diagonal. Returns the reflector coefficients.
    fn geqrf(a: ArrayViewMut2<'_, Self>) -> Vec<Self> {
        householder_qr(a)
    }

    /// Applies `q` (or `q^H`) from a `geqrf` output to `c`.
    fn ormqr(
        side: Side,
        adjoint: bool,
        refl: ArrayView2<'_, Self>,
        tau: &[Self],
        c: ArrayViewMut2<'_, Self>,
    ) {
        apply_q(side, adjoint, refl, tau, c)
    }

    /// Overwrites a `geqrf` output with the thin orthonormal factor.
    fn orgqr(mut a: ArrayViewMut2<'_, Self>, tau: &[Self]) {
        let (m, n) = a.dim();
        let mut q = Array2::<Self>::zeros((m, n).f());
        for j in 0..n.min(m) {
            q[[j, j]] = Self::one();
        }
        apply_q(Side::Left, false, a.view(), tau, q.view_mut());
        a.assign(&q);
    }

    /// Singular value decomposition by one-sided Jacobi, with Householder
    /// preconditioning for tall inputs.
    fn gesvd(a: ArrayView2<'_, Self>) -> Result<Svd<Self>, KernelError> {
        jacobi_svd(a)
    }

    /// In-place inverse from a `getrf` output and its pivots.
    fn getri(a: ArrayViewMut2<'_, Self>, ipiv: &[usize]) -> Result<(), KernelError> {
        lu_inverse(a, ipiv)
    }
}

impl Kernel for f32 {}
impl Kernel for f64 {}
impl Kernel for Complex<f32> {}
impl Kernel for Complex<f64> {}

fn lu_factor<T: Scalar>(mut a: ArrayViewMut2<'_, T>) -> Result<Vec<usize>, KernelError> {
    let (m, n) = a.dim();
    let k = m.min(n);
    let mut ipiv = Vec::with_capacity(k);
    for j in 0..k {
        let mut p = j;
        let mut best = a[[j, j]].modulus();
        for i in (j + 1)..m {
            let v = a[[i, j]].modulus();
            if v > best {
                best = v;
                p = i;
            }
        }
        if !(best > T::Real::zero()) {
            return Err(KernelError {
                routine: "getrf",
                info: j as i32 + 1,
            });
        }
        ipiv.push(p);
        if p != j {
            for c in 0..n {
                let t = a[[j, c]];
                a[[j, c]] = a[[p, c]];
                a[[p, c]] = t;
            }
        }
        let piv = a[[j, j]];
        for i in (j + 1)..m {
            a[[i, j]] = a[[i, j]] / piv;
        }
        for c in (j + 1)..n {
            let ajc = a[[j, c]];
            if ajc != T::zero() {
                for i in (j + 1)..m {
                    let lij = a[[i, j]];
                    a[[i, c]] = a[[i, c]] - lij * ajc;
                }
            }
        }
    }
    Ok(ipiv)
}

fn triangular_solve_left<T: Scalar>(
    part: Part,
    trans: bool,
    a: ArrayView2<'_, T>,
    mut b: ArrayViewMut2<'_, T>,
) {
    let n = a.nrows();
    debug_assert_eq!(a.ncols(), n, "triangular operand must be square");
    debug_assert_eq!(b.nrows(), n, "rhs rows must match the operand");
    let unit = part.is_unit();
    let upper_effective = matches!(part, Part::Upper) != trans;
    let at = |i: usize, j: usize| if trans { a[[j, i]] } else { a[[i, j]] };
    let ncols = b.ncols();
    for c in 0..ncols {
        if upper_effective {
            for i in (0..n).rev() {
                let mut s = b[[i, c]];
                for j in (i + 1)..n {
                    s = s - at(i, j) * b[[j, c]];
                }
                b[[i, c]] = if unit { s } else { s / at(i, i) };
            }
        } else {
            for i in 0..n {
                let mut s = b[[i, c]];
                for j in 0..i {
                    s = s - at(i, j) * b[[j, c]];
                }
                b[[i, c]] = if unit { s } else { s / at(i, i) };
            }
        }
    }
}

fn cholesky_factor<T: Scalar>(mut a: ArrayViewMut2<'_, T>) -> Result<(), KernelError> {
    let n = a.nrows();
    for j in 0..n {
        let mut s = a[[j, j]];
        for k in 0..j {
            let l = a[[j, k]];
            s = s - l * l;
        }
        let singular = if T::COMPLEX {
            !(s.modulus() > T::Real::zero())
        } else {
            !(s.re() > T::Real::zero())
        };
        if singular || !s.is_finite_scalar() {
            return Err(KernelError {
                routine: "potrf",
                info: j as i32 + 1,
            });
        }
        let d = s.csqrt();
        a[[j, j]] = d;
        for i in (j + 1)..n {
            let mut v = a[[i, j]];
            for k in 0..j {
                v = v - a[[i, k]] * a[[j, k]];
            }
            a[[i, j]] = v / d;
        }
    }
    Ok(())
}

fn ldlt_factor<T: Scalar>(mut a: ArrayViewMut2<'_, T>) -> Result<(), KernelError> {
    let n = a.nrows();
    for j in 0..n {
        let mut d = a[[j, j]];
        for k in 0..j {
            let l = a[[j, k]];
            d = d - l * l * a[[k, k]];
        }
        if !(d.modulus() > T::Real::zero()) || !d.is_finite_scalar() {
            return Err(KernelError {
                routine: "ldlt",
                info: j as i32 + 1,
            });
        }
        a[[j, j]] = d;
        for i in (j + 1)..n {
            let mut v = a[[i, j]];
            for k in 0..j {
                v = v - a[[i, k]] * a[[j, k]] * a[[k, k]];
            }
            a[[i, j]] = v / d;
        }
    }
    Ok(())
}

fn householder_qr<T: Scalar>(mut a: ArrayViewMut2<'_, T>) -> Vec<T> {
    let (m, n) = a.dim();
    let k = m.min(n);
    let mut tau = vec![T::zero(); k];
    for j in 0..k {
        let alpha = a[[j, j]];
        let mut xnorm_sq = T::Real::zero();
        for i in (j + 1)..m {
            xnorm_sq = xnorm_sq + a[[i, j]].modulus_sqr();
        }
        let anorm = (alpha.modulus_sqr() + xnorm_sq).sqrt();
        if anorm == T::Real::zero() {
            continue;
        }
        let beta_r = if alpha.re() >= T::Real::zero() {
            -anorm
        } else {
            anorm
        };
        let beta = T::from_real(beta_r);
        tau[j] = (beta - alpha) / beta;
        let scale = T::one() / (alpha - beta);
        for i in (j + 1)..m {
            a[[i, j]] = a[[i, j]] * scale;
        }
        a[[j, j]] = beta;
        let t = tau[j];
        for c in (j + 1)..n {
            let mut w = a[[j, c]];
            for i in (j + 1)..m {
                w = w + a[[i, j]].conj() * a[[i, c]];
            }
            let tw = t * w;
            a[[j, c]] = a[[j, c]] - tw;
            for i in (j + 1)..m {
                let v = a[[i, j]];
                a[[i, c]] = a[[i, c]] - tw * v;
            }
        }
    }
    tau
}

/// Applies one reflector `h = i - tau * v * v^H` from the left, `v` read
/// from column `j` of `refl` below the diagonal.
fn reflect_left<T: Scalar>(
    tau: T,
    j: usize,
    refl: ArrayView2<'_, T>,
    c: &mut ArrayViewMut2<'_, T>,
) {
    if tau == T::zero() {
        return;
    }
    let m = refl.nrows();
    for col in 0..c.ncols() {
        let mut w = c[[j, col]];
        for i in (j + 1)..m {
            w = w + refl[[i, j]].conj() * c[[i, col]];
        }
        let tw = tau * w;
        c[[j, col]] = c[[j, col]] - tw;
        for i in (j + 1)..m {
            c[[i, col]] = c[[i, col]] - tw * refl[[i, j]];
        }
    }
}

fn reflect_right<T: Scalar>(
    tau: T,
    j: usize,
    refl: ArrayView2<'_, T>,
    c: &mut ArrayViewMut2<'_, T>,
) {
    if tau == T::zero() {
        return;
    }
    let m = refl.nrows();
    for row in 0..c.nrows() {
        let mut w = c[[row, j]];
        for i in (j + 1)..m {
            w = w + c[[row, i]] * refl[[i, j]];
        }
        let tw = tau * w;
        c[[row, j]] = c[[row, j]] - tw;
        for i in (j + 1)..m {
            c[[row, i]] = c[[row, i]] - tw * refl[[i, j]].conj();
        }
    }
}

fn apply_q<T: Scalar>(
    side: Side,
    adjoint: bool,
    refl: ArrayView2<'_, T>,
    tau: &[T],
    mut c: ArrayViewMut2<'_, T>,
) {
    let k = tau.len();
    match (side, adjoint) {
        // q * c = h_0 (h_1 (... h_{k-1} c))
        (Side::Left, false) => {
            for j in (0..k).rev() {
                reflect_left(tau[j], j, refl, &mut c);
            }
        }
        // q^H * c = h_{k-1}^H (... h_0^H c)
        (Side::Left, true) => {
            for j in 0..k {
                reflect_left(tau[j].conj(), j, refl, &mut c);
            }
        }
        // c * q = ((c h_0) h_1) ...
        (Side::Right, false) => {
            for j in 0..k {
                reflect_right(tau[j], j, refl, &mut c);
            }
        }
        // c * q^H = ((c h_{k-1}^H) ...) h_0^H
        (Side::Right, true) => {
            for j in (0..k).rev() {
                reflect_right(tau[j].conj(), j, refl, &mut c);
            }
        }
    }
}

fn jacobi_svd<T: Kernel>(a: ArrayView2<'_, T>) -> Result<Svd<T>, KernelError> {
    let (m, n) = a.dim();
    if m < n {
        // svd(a^T) and swap factors: a = (vt)^T * sigma * u^T.
        let s = jacobi_svd(a.t())?;
        return Ok(Svd {
            u: s.vt.reversed_axes(),
            sigma: s.sigma,
            vt: s.u.reversed_axes(),
        });
    }
    if n == 0 || m == 0 {
        return Ok(Svd {
            u: Array2::zeros((m, 0).f()),
            sigma: Vec::new(),
            vt: Array2::zeros((0, n).f()),
        });
    }
    // Tall inputs go through QR first; Jacobi then runs on the square factor.
    if m > n {
        let mut packed = Array2::<T>::zeros((m, n).f());
        packed.assign(&a);
        let tau = householder_qr(packed.view_mut());
        let mut r = Array2::<T>::zeros((n, n).f());
        for j in 0..n {
            for i in 0..=j {
                r[[i, j]] = packed[[i, j]];
            }
        }
        let s = jacobi_svd(r.view())?;
        T::orgqr(packed.view_mut(), &tau);
        let mut u = Array2::<T>::zeros((m, n).f());
        general_mat_mul(T::one(), &packed.view(), &s.u.view(), T::zero(), &mut u);
        return Ok(Svd {
            u,
            sigma: s.sigma,
            vt: s.vt,
        });
    }

    let mut g = Array2::<T>::zeros((n, n).f());
    g.assign(&a);
    let mut v = Array2::<T>::zeros((n, n).f());
    for i in 0..n {
        v[[i, i]] = T::one();
    }
    let tol = T::eps() * <T::Real as Scalar>::of_f64(16.0);
    let mut converged = false;
    for _sweep in 0..JACOBI_MAX_SWEEPS {
        let mut rotated = false;
        for p in 0..n {
            for q in (p + 1)..n {
                let mut app = T::Real::zero();
                let mut aqq = T::Real::zero();
                let mut apq = T::zero();
                for i in 0..n {
                    let gp = g[[i, p]];
                    let gq = g[[i, q]];
                    app = app + gp.modulus_sqr();
                    aqq = aqq + gq.modulus_sqr();
                    apq = apq + gp.conj() * gq;
                }
                let c_mod = apq.modulus();
                if c_mod == T::Real::zero() || c_mod <= tol * (app * aqq).sqrt() {
                    continue;
                }
                rotated = true;
                let psi_c = apq.div_real(c_mod).conj();
                let two = <T::Real as Scalar>::of_f64(2.0);
                let tau_r = (aqq - app) / (two * c_mod);
                let one = T::Real::one();
                let sign = if tau_r >= T::Real::zero() { one } else { -one };
                let t = sign / (tau_r.abs() + (one + tau_r * tau_r).sqrt());
                let cs = one / (one + t * t).sqrt();
                let sn = cs * t;
                for i in 0..n {
                    let gp = g[[i, p]];
                    let gq = g[[i, q]] * psi_c;
                    g[[i, p]] = gp.mul_real(cs) - gq.mul_real(sn);
                    g[[i, q]] = gp.mul_real(sn) + gq.mul_real(cs);
                }
                for i in 0..n {
                    let vp = v[[i, p]];
                    let vq = v[[i, q]] * psi_c;
                    v[[i, p]] = vp.mul_real(cs) - vq.mul_real(sn);
                    v[[i, q]] = vp.mul_real(sn) + vq.mul_real(cs);
                }
            }
        }
        if !rotated {
            converged = true;
            break;
        }
    }
    if !converged {
        return Err(KernelError {
            routine: "gesvd",
            info: 1,
        });
    }

    let mut order: Vec<usize> = (0..n).collect();
    let norms: Vec<T::Real> = (0..n)
        .map(|j| {
            (0..n)
                .fold(T::Real::zero(), |acc, i| acc + g[[i, j]].modulus_sqr())
                .sqrt()
        })
        .collect();
    order.sort_by(|&x, &y| norms[y].partial_cmp(&norms[x]).unwrap_or(std::cmp::Ordering::Equal));

    let mut u = Array2::<T>::zeros((n, n).f());
    let mut vt = Array2::<T>::zeros((n, n).f());
    let mut sigma = Vec::with_capacity(n);
    for (jj, &j) in order.iter().enumerate() {
        let s = norms[j];
        sigma.push(s);
        if s > T::Real::zero() {
            for i in 0..n {
                u[[i, jj]] = g[[i, j]].div_real(s);
            }
        }
        for i in 0..n {
            vt[[jj, i]] = v[[i, j]].conj();
        }
    }
    Ok(Svd { u, sigma, vt })
}

fn lu_inverse<T: Kernel>(mut a: ArrayViewMut2<'_, T>, ipiv: &[usize]) -> Result<(), KernelError> {
    let n = a.nrows();
    for i in 0..n {
        if !(a[[i, i]].modulus() > T::Real::zero()) {
            return Err(KernelError {
                routine: "getri",
                info: i as i32 + 1,
            });
        }
    }
    let mut inv = Array2::<T>::zeros((n, n).f());
    for i in 0..n {
        inv[[i, i]] = T::one();
    }
    T::laswp(inv.view_mut(), ipiv);
    triangular_solve_left(Part::UnitLower, false, a.view(), inv.view_mut());
    triangular_solve_left(Part::Upper, false, a.view(), inv.view_mut());
    a.assign(&inv);
    Ok(())
}
