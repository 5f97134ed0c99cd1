//! Adaptive cross approximation.
//!
//! Three flavors: `aca_full` works on a materialized block and picks global
//! pivots; `aca_partial` only ever evaluates single rows and columns through
//! the oracle; `aca_plus` additionally tracks a reference row and column to
//! steer pivot selection.

use num_traits::{Float, Zero};
use rand::seq::IteratorRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::core::dense::ScalarArray;
use crate::core::kernel::Kernel;
use crate::core::rk::RkMatrix;
use crate::core::scalar::Scalar;
use crate::utils::helpers::{arg_max_modulus, norm_sqr};

use super::{BlockOracle, Compressed};

/// Hermitian dot product `x^H y`.
fn hdot<T: Scalar>(x: &[T], y: &[T]) -> T {
    x.iter()
        .zip(y.iter())
        .fold(T::zero(), |acc, (a, b)| acc + a.conj() * *b)
}

/// Accumulates factor columns and the running Frobenius estimate of the
/// approximant.
struct CrossFactors<T: Scalar> {
    rows: usize,
    cols: usize,
    u: Vec<Vec<T>>,
    v: Vec<Vec<T>>,
    norm_est_sq: T::Real,
}

impl<T: Kernel> CrossFactors<T> {
    fn new(rows: usize, cols: usize) -> Self {
        CrossFactors {
            rows,
            cols,
            u: Vec::new(),
            v: Vec::new(),
            norm_est_sq: T::Real::zero(),
        }
    }

    fn rank(&self) -> usize {
        self.u.len()
    }

    /// Residual row `i` of the oracle block under the current approximant.
    fn residual_row(&self, oracle: &dyn BlockOracle<T>, i: usize) -> Vec<T> {
        let mut r = vec![T::zero(); self.cols];
        oracle.row(i, &mut r);
        for (u, v) in self.u.iter().zip(self.v.iter()) {
            let ui = u[i];
            if ui != T::zero() {
                for (rj, vj) in r.iter_mut().zip(v.iter()) {
                    *rj = *rj - ui * *vj;
                }
            }
        }
        r
    }

    fn residual_col(&self, oracle: &dyn BlockOracle<T>, j: usize) -> Vec<T> {
        let mut c = vec![T::zero(); self.rows];
        oracle.col(j, &mut c);
        for (u, v) in self.u.iter().zip(self.v.iter()) {
            let vj = v[j];
            if vj != T::zero() {
                for (ci, ui) in c.iter_mut().zip(u.iter()) {
                    *ci = *ci - *ui * vj;
                }
            }
        }
        c
    }

    /// Appends the rank-1 term `u * v^T` and returns its Frobenius norm.
    fn push(&mut self, u: Vec<T>, v: Vec<T>) -> T::Real {
        let nu_sq = norm_sqr::<T>(&u);
        let nv_sq = norm_sqr::<T>(&v);
        let mut cross = T::zero();
        for (ul, vl) in self.u.iter().zip(self.v.iter()) {
            cross = cross + hdot(ul, &u) * hdot(vl, &v);
        }
        let two = crate::core::scalar::real_of::<T>(2.0);
        self.norm_est_sq =
            self.norm_est_sq + nu_sq * nv_sq + two * cross.re();
        if self.norm_est_sq < T::Real::zero() {
            self.norm_est_sq = T::Real::zero();
        }
        self.u.push(u);
        self.v.push(v);
        (nu_sq * nv_sq).sqrt()
    }

    fn into_rk(self) -> RkMatrix<T> {
        let k = self.u.len();
        let a = ScalarArray::from_fn(self.rows, k, |i, j| self.u[j][i]);
        let b = ScalarArray::from_fn(self.cols, k, |i, j| self.v[j][i]);
        RkMatrix::new(a, b)
    }
}

/// Global-pivot cross approximation on a materialized block.
pub fn aca_full<T: Kernel>(full: &ScalarArray<T>, epsilon: T::Real) -> Compressed<T> {
    let (m, n) = (full.rows(), full.cols());
    let total = full.norm();
    if !(total > T::Real::zero()) {
        return Compressed::converged(RkMatrix::zero(m, n));
    }
    let cap = m.min(n);
    let mut residual = full.clone();
    let mut factors = CrossFactors::<T>::new(m, n);
    let mut hit_rank_cap = true;
    for _ in 0..cap {
        let mut best = T::Real::zero();
        let (mut pi, mut pj) = (0, 0);
        for j in 0..n {
            for i in 0..m {
                let v = residual[(i, j)].modulus();
                if v > best {
                    best = v;
                    pi = i;
                    pj = j;
                }
            }
        }
        if !(best > T::Real::zero()) {
            hit_rank_cap = false;
            break;
        }
        let delta = residual[(pi, pj)];
        let u: Vec<T> = (0..m).map(|i| residual[(i, pj)] / delta).collect();
        let v: Vec<T> = (0..n).map(|j| residual[(pi, j)]).collect();
        for j in 0..n {
            for i in 0..m {
                residual[(i, j)] = residual[(i, j)] - u[i] * v[j];
            }
        }
        factors.push(u, v);
        if residual.norm() <= epsilon * total {
            hit_rank_cap = false;
            break;
        }
    }
    Compressed {
        rk: factors.into_rk(),
        hit_rank_cap,
    }
}

/// Cross approximation driven by the element oracle only. Stops when the
/// last rank-1 term falls under `epsilon` times the running Frobenius
/// estimate of the block.
pub fn aca_partial<T: Kernel>(oracle: &dyn BlockOracle<T>, epsilon: T::Real) -> Compressed<T> {
    let (m, n) = (oracle.nrows(), oracle.ncols());
    if m == 0 || n == 0 {
        return Compressed::converged(RkMatrix::zero(m, n));
    }
    let cap = m.min(n);
    let mut factors = CrossFactors::<T>::new(m, n);
    let mut used_rows = vec![false; m];
    let mut used_cols = vec![false; n];
    let mut row = 0;
    let mut hit_rank_cap = true;

    while factors.rank() < cap {
        let r = factors.residual_row(oracle, row);
        let pivot = arg_max_modulus::<T>(&r, &used_cols);
        let Some((j, rmax)) = pivot else {
            hit_rank_cap = false;
            break;
        };
        if !(rmax > T::eps() * crate::core::scalar::real_of::<T>(16.0)) {
            // dead row; move on or give up
            used_rows[row] = true;
            match used_rows.iter().position(|&u| !u) {
                Some(next) => {
                    row = next;
                    continue;
                }
                None => {
                    hit_rank_cap = false;
                    break;
                }
            }
        }
        let delta = r[j];
        let c = factors.residual_col(oracle, j);
        let u: Vec<T> = c.iter().map(|&x| x / delta).collect();
        used_rows[row] = true;
        used_cols[j] = true;
        let next = arg_max_modulus::<T>(&u, &used_rows).map(|(i, _)| i);
        let term = factors.push(u, r);
        if term <= epsilon * factors.norm_est_sq.sqrt() {
            hit_rank_cap = false;
            break;
        }
        match next {
            Some(i) => row = i,
            None => {
                hit_rank_cap = false;
                break;
            }
        }
    }
    Compressed {
        rk: factors.into_rk(),
        hit_rank_cap,
    }
}

/// ACA-partial seeded with a reference row and column: pivots are chosen
/// from whichever reference residual currently carries the most mass, which
/// protects against the blind spots of pure row steering.
pub fn aca_plus<T: Kernel>(
    oracle: &dyn BlockOracle<T>,
    epsilon: T::Real,
    seed: Option<u64>,
) -> Compressed<T> {
    let (m, n) = (oracle.nrows(), oracle.ncols());
    if m == 0 || n == 0 {
        return Compressed::converged(RkMatrix::zero(m, n));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed.unwrap_or(0x5eed));
    let cap = m.min(n);
    let mut factors = CrossFactors::<T>::new(m, n);
    let mut used_rows = vec![false; m];
    let mut used_cols = vec![false; n];

    let mut ref_row = 0;
    let mut ref_row_resid = factors.residual_row(oracle, ref_row);
    let mut ref_col = 0;
    let mut ref_col_resid = factors.residual_col(oracle, ref_col);
    let mut hit_rank_cap = true;

    while factors.rank() < cap {
        let by_row = arg_max_modulus::<T>(&ref_row_resid, &used_cols);
        let by_col = arg_max_modulus::<T>(&ref_col_resid, &used_rows);
        let tiny = T::eps() * crate::core::scalar::real_of::<T>(16.0);
        let pick_col = match (by_row, by_col) {
            (Some((_, vr)), Some((_, vc))) => vr >= vc,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => {
                hit_rank_cap = false;
                break;
            }
        };

        let (i, j) = if pick_col {
            let (j, vr) = by_row.expect("pick_col implies a row pivot");
            if !(vr > tiny) {
                // the reference row is exhausted; reseed it
                match fresh_reference(&used_rows, &mut rng) {
                    Some(next) => {
                        ref_row = next;
                        ref_row_resid = factors.residual_row(oracle, ref_row);
                        continue;
                    }
                    None => {
                        hit_rank_cap = false;
                        break;
                    }
                }
            }
            let c = factors.residual_col(oracle, j);
            match arg_max_modulus::<T>(&c, &used_rows) {
                Some((i, _)) => (i, j),
                None => {
                    hit_rank_cap = false;
                    break;
                }
            }
        } else {
            let (i, vc) = by_col.expect("column steering implies a pivot");
            if !(vc > tiny) {
                match fresh_reference(&used_cols, &mut rng) {
                    Some(next) => {
                        ref_col = next;
                        ref_col_resid = factors.residual_col(oracle, ref_col);
                        continue;
                    }
                    None => {
                        hit_rank_cap = false;
                        break;
                    }
                }
            }
            let r = factors.residual_row(oracle, i);
            match arg_max_modulus::<T>(&r, &used_cols) {
                Some((j, _)) => (i, j),
                None => {
                    hit_rank_cap = false;
                    break;
                }
            }
        };

        let r = factors.residual_row(oracle, i);
        let delta = r[j];
        if !(delta.modulus() > tiny) {
            used_rows[i] = true;
            used_cols[j] = true;
            continue;
        }
        let c = factors.residual_col(oracle, j);
        let u: Vec<T> = c.iter().map(|&x| x / delta).collect();
        used_rows[i] = true;
        used_cols[j] = true;

        // keep the reference residuals in sync with the new term
        for (slot, vj) in ref_row_resid.iter_mut().zip(r.iter()) {
            *slot = *slot - u[ref_row] * *vj;
        }
        for (slot, ui) in ref_col_resid.iter_mut().zip(u.iter()) {
            *slot = *slot - *ui * r[ref_col];
        }

        let term = factors.push(u, r);
        if term <= epsilon * factors.norm_est_sq.sqrt() {
            hit_rank_cap = false;
            break;
        }
        if used_rows[ref_row] {
            if let Some(next) = fresh_reference(&used_rows, &mut rng) {
                ref_row = next;
                ref_row_resid = factors.residual_row(oracle, ref_row);
            }
        }
        if used_cols[ref_col] {
            if let Some(next) = fresh_reference(&used_cols, &mut rng) {
                ref_col = next;
                ref_col_resid = factors.residual_col(oracle, ref_col);
            }
        }
    }
    Compressed {
        rk: factors.into_rk(),
        hit_rank_cap,
    }
}

fn fresh_reference(used: &[bool], rng: &mut ChaCha8Rng) -> Option<usize> {
    used.iter()
        .enumerate()
        .filter(|(_, &u)| !u)
        .map(|(i, _)| i)
        .choose(rng)
}
