//! Modified Gram-Schmidt with column pivoting.
//!
//! The workhorse of low-rank recompression: orthonormalizes the columns of a
//! tile, largest first, and stops once the remaining mass falls under the
//! requested precision. The returned rank is the number of iterations.

use ndarray::{Array2, ArrayView2, ShapeBuilder};
use num_traits::{Float, Zero};

use crate::constants::MIN_MGS_PREC;
use crate::core::scalar::{real_of, Scalar};

/// Pivoted QR factorization `m ~= q * r` with `q` orthonormal and `r` upper
/// triangular under the pivot order. `r` is stored in the *original* column
/// order (`rank x ncols`), so no permutation is needed to recompose.
#[derive(Debug, Clone)]
pub struct PivotedMgs<T: Scalar> {
    pub q: Array2<T>,
    pub r: Array2<T>,
    pub perm: Vec<usize>,
    pub rank: usize,
}

/// Public entry point; `prec` is clamped to the documented floor.
pub fn mgs_pivoted<T: Scalar>(m: ArrayView2<'_, T>, prec: T::Real) -> PivotedMgs<T> {
    let floor = real_of::<T>(MIN_MGS_PREC);
    let prec = if prec < floor { floor } else { prec };
    mgs_impl(m, prec)
}

/// Internal entry without the precision floor, for truncation paths that
/// must keep everything numerically significant.
pub(crate) fn mgs_impl<T: Scalar>(m: ArrayView2<'_, T>, prec: T::Real) -> PivotedMgs<T> {
    let (rows, cols) = m.dim();
    let max_rank = rows.min(cols);

    let mut work = Array2::<T>::zeros((rows, cols).f());
    work.assign(&m);

    let mut norms_sq: Vec<T::Real> = (0..cols)
        .map(|j| {
            (0..rows).fold(T::Real::zero(), |acc, i| acc + work[[i, j]].modulus_sqr())
        })
        .collect();
    let mut done = vec![false; cols];

    let max_initial = norms_sq
        .iter()
        .cloned()
        .fold(T::Real::zero(), |a, b| if b > a { b } else { a })
        .sqrt();
    let threshold_sq = (prec * max_initial) * (prec * max_initial);

    let mut q = Array2::<T>::zeros((rows, max_rank).f());
    let mut r = Array2::<T>::zeros((max_rank, cols).f());
    let mut perm = Vec::with_capacity(max_rank);

    let mut rank = 0;
    while rank < max_rank {
        let mut pivot = None;
        let mut best = threshold_sq;
        for j in 0..cols {
            if !done[j] && norms_sq[j] > best {
                best = norms_sq[j];
                pivot = Some(j);
            }
        }
        let Some(jp) = pivot else { break };
        let norm = norms_sq[jp].sqrt();
        if !(norm > T::Real::zero()) {
            break;
        }
        done[jp] = true;
        perm.push(jp);
        for i in 0..rows {
            q[[i, rank]] = work[[i, jp]].div_real(norm);
        }
        r[[rank, jp]] = T::from_real(norm);
        for j in 0..cols {
            if done[j] {
                continue;
            }
            // coefficient under the hermitian inner product keeps q unitary
            let mut coeff = T::zero();
            for i in 0..rows {
                coeff = coeff + q[[i, rank]].conj() * work[[i, j]];
            }
            r[[rank, j]] = coeff;
            let mut remaining = T::Real::zero();
            for i in 0..rows {
                let v = work[[i, j]] - coeff * q[[i, rank]];
                work[[i, j]] = v;
                remaining = remaining + v.modulus_sqr();
            }
            norms_sq[j] = remaining;
        }
        rank += 1;
    }

    let q = q.slice_move(ndarray::s![.., ..rank]);
    let r = r.slice_move(ndarray::s![..rank, ..]);
    PivotedMgs { q, r, perm, rank }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::linalg::general_mat_mul;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use crate::core::scalar::Scalar;

    #[test]
    fn q_is_orthonormal_and_recomposes() {
        let mut rng = ChaCha8Rng::seed_from_u64(13);
        let (m, n) = (20, 8);
        let a = Array2::from_shape_fn((m, n).f(), |_| f64::sample(&mut rng));
        let mgs = mgs_pivoted(a.view(), 1e-12);
        assert_eq!(mgs.rank, n);

        let mut qtq = Array2::<f64>::zeros((n, n).f());
        general_mat_mul(1.0, &mgs.q.t(), &mgs.q.view(), 0.0, &mut qtq);
        for i in 0..n {
            qtq[[i, i]] -= 1.0;
        }
        let ortho = qtq.iter().map(|x| x.abs()).fold(0.0, f64::max);
        assert!(ortho < 1e-12 * n as f64);

        let mut rec = Array2::<f64>::zeros((m, n).f());
        general_mat_mul(1.0, &mgs.q.view(), &mgs.r.view(), 0.0, &mut rec);
        let err = rec
            .iter()
            .zip(a.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max);
        assert!(err < 1e-10);
    }

    #[test]
    fn rank_deficient_input_is_revealed() {
        let mut rng = ChaCha8Rng::seed_from_u64(19);
        // 30 x 10 of rank 3
        let b = Array2::from_shape_fn((30, 3).f(), |_| f64::sample(&mut rng));
        let c = Array2::from_shape_fn((3, 10).f(), |_| f64::sample(&mut rng));
        let mut a = Array2::<f64>::zeros((30, 10).f());
        general_mat_mul(1.0, &b.view(), &c.view(), 0.0, &mut a);

        let mgs = mgs_pivoted(a.view(), 1e-6);
        assert_eq!(mgs.rank, 3);
        // pivot diagonal is non-increasing
        for w in 0..mgs.rank - 1 {
            let d0 = mgs.r[[w, mgs.perm[w]]].modulus();
            let d1 = mgs.r[[w + 1, mgs.perm[w + 1]]].modulus();
            assert!(d0 >= d1);
        }
    }

    #[test]
    fn precision_is_clamped_to_the_floor() {
        let a = Array2::<f64>::from_shape_fn((4, 4).f(), |(i, j)| {
            if i == j {
                if i == 0 {
                    1.0
                } else {
                    1e-9
                }
            } else {
                0.0
            }
        });
        // requesting 1e-12 still drops the 1e-9 tail: the floor is 1e-6
        let mgs = mgs_pivoted(a.view(), 1e-12);
        assert_eq!(mgs.rank, 1);
        // the internal entry keeps it
        let full = mgs_impl(a.view(), 1e-12);
        assert_eq!(full.rank, 4);
    }
}
