//! Triangular solves with a hierarchical factor.
//!
//! `solve_triangular_dense` drives a dense right-hand side through the block
//! structure of the factor; `trsm_h` solves when the right-hand side is
//! itself a block matrix. Right-side solves against a dense RHS reduce to
//! left-side solves on the transposed view; low-rank right-hand sides are
//! solved on the appropriate factor without expansion.
//!
//! LU pivots are leaf-local: the forward (unit-lower, untransposed) solve
//! replays them at each diagonal dense leaf, which mirrors exactly the
//! elimination order of the factorization.

use ndarray::ArrayViewMut2;
use num_traits::{One, Zero};

use crate::core::block::{relative_range, HMatrix, Kind};
use crate::core::kernel::{Kernel, Part, Side};
use crate::core::scalar::{real_of, Scalar};
use crate::error::{Error, Result};
use crate::settings::Settings;

/// Solves `op(factor) * x = b` (left) or `x * op(factor) = b` (right) in
/// place, `factor` being triangular in the given `part`.
pub(crate) fn solve_triangular_dense<T: Kernel>(
    factor: &HMatrix<T>,
    part: Part,
    trans: bool,
    side: Side,
    b: ArrayViewMut2<'_, T>,
) -> Result<()> {
    match side {
        Side::Left => solve_dense_left(factor, part, trans, b),
        Side::Right => solve_dense_left(factor, part, !trans, b.reversed_axes()),
    }
}

fn solve_dense_left<T: Kernel>(
    factor: &HMatrix<T>,
    part: Part,
    trans: bool,
    mut b: ArrayViewMut2<'_, T>,
) -> Result<()> {
    debug_assert_eq!(factor.nrows(), factor.ncols(), "triangular factor is square");
    debug_assert_eq!(b.nrows(), factor.nrows());
    match &factor.kind {
        Kind::Dense(d) => {
            if !part.is_unit() {
                for i in 0..d.tile.rows() {
                    if !(d.tile[(i, i)].modulus() > T::Real::zero()) {
                        return Err(Error::Singular {
                            path: factor.path(),
                            pivot: i + 1,
                        });
                    }
                }
            }
            if part == Part::UnitLower && !trans {
                if let Some(pivots) = &d.pivots {
                    T::laswp(b.view_mut(), pivots);
                }
            }
            T::trsm(Side::Left, part, trans, d.tile.view(), b);
            Ok(())
        }
        Kind::Rk(_) => unreachable!("triangular factor cannot be a low-rank leaf"),
        Kind::Internal(grid) => {
            let n = grid.nrows();
            debug_assert_eq!(grid.ncols(), n);
            let ranges: Vec<std::ops::Range<usize>> = (0..n)
                .map(|k| relative_range(grid.row_cluster(k), factor.rows()))
                .collect();
            let upper_effective = (part == Part::Upper) != trans;
            let order: Vec<usize> = if upper_effective {
                (0..n).rev().collect()
            } else {
                (0..n).collect()
            };
            for (step, &k) in order.iter().enumerate() {
                if let Some(diag) = grid.cell(k, k) {
                    let bk = b.slice_mut(ndarray::s![ranges[k].clone(), ..]);
                    solve_dense_left(diag, part, trans, bk)?;
                }
                for &i in order.iter().skip(step + 1) {
                    let cell = if trans { grid.cell(k, i) } else { grid.cell(i, k) };
                    let Some(cell) = cell else { continue };
                    let (bk, bi) = b.multi_slice_mut((
                        ndarray::s![ranges[k].clone(), ..],
                        ndarray::s![ranges[i].clone(), ..],
                    ));
                    cell.apply(T::neg_one(), trans, bk.view(), T::one(), bi);
                }
            }
            Ok(())
        }
    }
}

/// Solves with a block right-hand side, in place.
pub(crate) fn trsm_h<T: Kernel>(
    factor: &HMatrix<T>,
    part: Part,
    trans: bool,
    side: Side,
    b: &mut HMatrix<T>,
    settings: &Settings,
) -> Result<()> {
    if b.is_internal() {
        return if block_solve_applicable(factor, side, b) {
            block_trsm(factor, part, trans, side, b, settings)
        } else {
            // structure mismatch: expand, solve dense, re-import
            let mut dense = b.to_dense();
            solve_triangular_dense(factor, part, trans, side, dense.view_mut())?;
            b.copy_from_dense(dense.view(), real_of::<T>(settings.recompression_epsilon))
        };
    }
    match &mut b.kind {
        Kind::Dense(d) => solve_triangular_dense(factor, part, trans, side, d.tile.view_mut()),
        Kind::Rk(rk) => {
            if rk.is_zero() {
                return Ok(());
            }
            match side {
                // op(f)^-1 (a b^T) = (op(f)^-1 a) b^T
                Side::Left => solve_triangular_dense(
                    factor,
                    part,
                    trans,
                    Side::Left,
                    rk.a_mut().view_mut(),
                ),
                // (a b^T) op(f)^-1 = a (op(f)^-T b)^T
                Side::Right => solve_triangular_dense(
                    factor,
                    part,
                    !trans,
                    Side::Left,
                    rk.b_mut().view_mut(),
                ),
            }
        }
        Kind::Internal(_) => unreachable!("handled above"),
    }
}

fn block_solve_applicable<T: Kernel>(factor: &HMatrix<T>, side: Side, b: &HMatrix<T>) -> bool {
    let (Kind::Internal(gf), Kind::Internal(gb)) = (&factor.kind, &b.kind) else {
        return false;
    };
    if gf.nrows() != gf.ncols() {
        return false;
    }
    let b_clusters = match side {
        Side::Left => gb.row_clusters(),
        Side::Right => gb.col_clusters(),
    };
    gf.row_clusters().len() == b_clusters.len()
        && gf
            .row_clusters()
            .iter()
            .zip(b_clusters.iter())
            .all(|(x, y)| std::sync::Arc::ptr_eq(x, y))
}

fn block_trsm<T: Kernel>(
    factor: &HMatrix<T>,
    part: Part,
    trans: bool,
    side: Side,
    b: &mut HMatrix<T>,
    settings: &Settings,
) -> Result<()> {
    let Kind::Internal(gf) = &factor.kind else { unreachable!() };
    let n = gf.nrows();
    let upper_effective = (part == Part::Upper) != trans;
    // the triangle is consumed forward for an effective lower factor on the
    // left and an effective upper factor on the right, backward otherwise
    let forward = match side {
        Side::Left => !upper_effective,
        Side::Right => upper_effective,
    };
    let order: Vec<usize> = if forward {
        (0..n).collect()
    } else {
        (0..n).rev().collect()
    };
    let Kind::Internal(gb) = &mut b.kind else { unreachable!() };
    match side {
        Side::Left => {
            let ncols = gb.ncols();
            for (step, &k) in order.iter().enumerate() {
                for j in 0..ncols {
                    let Some(mut bkj) = gb.take(k, j) else { continue };
                    if let Some(diag) = gf.cell(k, k) {
                        trsm_h(diag, part, trans, Side::Left, &mut bkj, settings)?;
                    }
                    for &i in order.iter().skip(step + 1) {
                        let f_cell = if trans { gf.cell(k, i) } else { gf.cell(i, k) };
                        let (Some(fc), Some(target)) = (f_cell, gb.cell_mut(i, j)) else {
                            continue;
                        };
                        crate::algebra::gemm::gemm(
                            T::neg_one(),
                            fc,
                            trans,
                            &bkj,
                            false,
                            T::one(),
                            target,
                            settings,
                        )?;
                    }
                    gb.put(k, j, Some(bkj));
                }
            }
        }
        Side::Right => {
            let nrows = gb.nrows();
            for (step, &k) in order.iter().enumerate() {
                for i in 0..nrows {
                    let Some(mut bik) = gb.take(i, k) else { continue };
                    if let Some(diag) = gf.cell(k, k) {
                        trsm_h(diag, part, trans, Side::Right, &mut bik, settings)?;
                    }
                    for &j in order.iter().skip(step + 1) {
                        let f_cell = if trans { gf.cell(j, k) } else { gf.cell(k, j) };
                        let (Some(fc), Some(target)) = (f_cell, gb.cell_mut(i, j)) else {
                            continue;
                        };
                        crate::algebra::gemm::gemm(
                            T::neg_one(),
                            &bik,
                            false,
                            fc,
                            trans,
                            T::one(),
                            target,
                            settings,
                        )?;
                    }
                    gb.put(i, k, Some(bik));
                }
            }
        }
    }
    Ok(())
}
