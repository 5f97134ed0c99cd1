//! Recursive block GEMM `c <- alpha * op(a) * op(b) + beta * c`.
//!
//! When all three operands are internal with aligned child grids the product
//! recurses cell-wise. As soon as a low-rank operand appears the product is
//! formed as a factor pair without materializing anything of the full block
//! size; contributions are then added into `c` in its own format.

use std::sync::Arc;

use num_traits::{One, Zero};

use crate::core::block::{relative_range, Grid, HMatrix, Kind};
use crate::core::cluster::ClusterNode;
use crate::core::dense::ScalarArray;
use crate::core::kernel::Kernel;
use crate::core::rk::RkMatrix;
use crate::core::scalar::{real_of, Scalar};
use crate::error::Result;
use crate::settings::Settings;

/// A leaf-level product, ready to be added into a target of any variant.
pub(crate) enum Contribution<T: Kernel> {
    Dense(ScalarArray<T>),
    Rk(RkMatrix<T>),
}

fn op_shape<T: Kernel>(h: &HMatrix<T>, trans: bool) -> (usize, usize) {
    if trans {
        (h.ncols(), h.nrows())
    } else {
        (h.nrows(), h.ncols())
    }
}

fn same_clusters(x: &[Arc<ClusterNode>], y: &[Arc<ClusterNode>]) -> bool {
    x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| Arc::ptr_eq(a, b))
}

fn op_grid_clusters<T: Kernel>(
    grid: &Grid<T>,
    trans: bool,
) -> (&[Arc<ClusterNode>], &[Arc<ClusterNode>]) {
    if trans {
        (grid.col_clusters(), grid.row_clusters())
    } else {
        (grid.row_clusters(), grid.col_clusters())
    }
}

/// `c <- alpha * op(a) * op(b) + beta * c`.
///
/// `c` must not alias either operand; the borrow rules enforce this at every
/// call site.
pub fn gemm<T: Kernel>(
    alpha: T,
    a: &HMatrix<T>,
    trans_a: bool,
    b: &HMatrix<T>,
    trans_b: bool,
    beta: T,
    c: &mut HMatrix<T>,
    settings: &Settings,
) -> Result<()> {
    let (am, ak) = op_shape(a, trans_a);
    let (bk, bn) = op_shape(b, trans_b);
    debug_assert_eq!(ak, bk, "inner dimensions must agree");
    debug_assert_eq!((c.nrows(), c.ncols()), (am, bn), "target shape mismatch");
    c.scale(beta);
    gemm_acc(alpha, a, trans_a, b, trans_b, c, settings)
}

fn gemm_acc<T: Kernel>(
    alpha: T,
    a: &HMatrix<T>,
    trans_a: bool,
    b: &HMatrix<T>,
    trans_b: bool,
    c: &mut HMatrix<T>,
    settings: &Settings,
) -> Result<()> {
    if alpha == T::zero() {
        return Ok(());
    }
    if matches!(&a.kind, Kind::Internal(_))
        && matches!(&b.kind, Kind::Internal(_))
        && matches!(&c.kind, Kind::Internal(_))
    {
        let (Kind::Internal(ga), Kind::Internal(gb)) = (&a.kind, &b.kind) else {
            unreachable!()
        };
        let (a_rows, a_cols) = op_grid_clusters(ga, trans_a);
        let (b_rows, b_cols) = op_grid_clusters(gb, trans_b);
        let aligned = {
            let Kind::Internal(gc) = &c.kind else { unreachable!() };
            same_clusters(a_rows, gc.row_clusters())
                && same_clusters(b_cols, gc.col_clusters())
                && same_clusters(a_cols, b_rows)
        };
        if aligned {
            let inner = a_cols.len();
            let Kind::Internal(gc) = &mut c.kind else { unreachable!() };
            for j in 0..gc.ncols() {
                for i in 0..gc.nrows() {
                    let Some(mut target) = gc.take(i, j) else { continue };
                    for k in 0..inner {
                        let a_cell = if trans_a { ga.cell(k, i) } else { ga.cell(i, k) };
                        let b_cell = if trans_b { gb.cell(j, k) } else { gb.cell(k, j) };
                        if let (Some(ac), Some(bc)) = (a_cell, b_cell) {
                            gemm_acc(alpha, ac, trans_a, bc, trans_b, &mut target, settings)?;
                        }
                    }
                    gc.put(i, j, Some(target));
                }
            }
            return Ok(());
        }
    }
    match multiply(alpha, a, trans_a, b, trans_b)? {
        Some(contribution) => add_contribution(c, contribution, settings),
        None => Ok(()),
    }
}

/// Forms `alpha * op(a) * op(b)` as a leaf-level contribution. Returns
/// `None` when the product is structurally zero.
fn multiply<T: Kernel>(
    alpha: T,
    a: &HMatrix<T>,
    trans_a: bool,
    b: &HMatrix<T>,
    trans_b: bool,
) -> Result<Option<Contribution<T>>> {
    let (m, k) = op_shape(a, trans_a);
    let (_, n) = op_shape(b, trans_b);
    if m == 0 || n == 0 || k == 0 {
        return Ok(None);
    }
    match (&a.kind, &b.kind) {
        (Kind::Rk(ra), Kind::Rk(rb)) if !trans_a && !trans_b => {
            if ra.is_zero() || rb.is_zero() {
                return Ok(None);
            }
            let mut product = ra.multiply_rk(rb);
            product.scale(alpha);
            Ok(Some(Contribution::Rk(product)))
        }
        (Kind::Rk(ra), _) => {
            if ra.is_zero() {
                return Ok(None);
            }
            let (pa, pb) = if trans_a { (ra.b(), ra.a()) } else { (ra.a(), ra.b()) };
            // alpha * pa * (op(b)^T pb)^T
            let mut bnew = ScalarArray::zeros(n, ra.rank());
            b.apply(T::one(), !trans_b, pb.view(), T::zero(), bnew.view_mut());
            let mut anew = pa.clone();
            anew.scale(alpha);
            Ok(Some(Contribution::Rk(RkMatrix::new(anew, bnew))))
        }
        (_, Kind::Rk(rb)) => {
            if rb.is_zero() {
                return Ok(None);
            }
            let (pa, pb) = if trans_b { (rb.b(), rb.a()) } else { (rb.a(), rb.b()) };
            // (alpha * op(a) pa) * pb^T
            let mut anew = ScalarArray::zeros(m, rb.rank());
            a.apply(alpha, trans_a, pa.view(), T::zero(), anew.view_mut());
            Ok(Some(Contribution::Rk(RkMatrix::new(anew, pb.clone()))))
        }
        (Kind::Dense(da), Kind::Dense(db)) => {
            let mut out = ScalarArray::zeros(m, n);
            out.gemm(alpha, &da.tile, trans_a, &db.tile, trans_b, T::zero());
            Ok(Some(Contribution::Dense(out)))
        }
        (Kind::Dense(da), Kind::Internal(_)) => {
            // op(a) * op(b) = (op(b)^T op(a)^T)^T, the right factor applied
            // through the block structure of b
            let at = if trans_a {
                da.tile.clone()
            } else {
                da.tile.transposed()
            };
            let mut z = ScalarArray::zeros(n, m);
            b.apply(alpha, !trans_b, at.view(), T::zero(), z.view_mut());
            Ok(Some(Contribution::Dense(z.transposed())))
        }
        (Kind::Internal(_), Kind::Dense(db)) => {
            let bt = if trans_b {
                db.tile.transposed()
            } else {
                db.tile.clone()
            };
            let mut out = ScalarArray::zeros(m, n);
            a.apply(alpha, trans_a, bt.view(), T::zero(), out.view_mut());
            Ok(Some(Contribution::Dense(out)))
        }
        (Kind::Internal(_), Kind::Internal(_)) => {
            // mismatched subdivisions under a leaf target: expand the right
            // operand and push it through the left structure
            let bd = b.to_dense();
            let bt = if trans_b { bd.transposed() } else { bd };
            let mut out = ScalarArray::zeros(m, n);
            a.apply(alpha, trans_a, bt.view(), T::zero(), out.view_mut());
            Ok(Some(Contribution::Dense(out)))
        }
    }
}

fn add_contribution<T: Kernel>(
    c: &mut HMatrix<T>,
    contribution: Contribution<T>,
    settings: &Settings,
) -> Result<()> {
    let epsilon = real_of::<T>(settings.recompression_epsilon);
    let parent_rows = c.rows().clone();
    let parent_cols = c.cols().clone();
    match (&mut c.kind, contribution) {
        (Kind::Dense(d), Contribution::Dense(x)) => {
            d.tile.axpy(T::one(), &x);
            Ok(())
        }
        (Kind::Dense(d), Contribution::Rk(r)) => {
            if !r.is_zero() {
                d.tile.gemm(T::one(), r.a(), false, r.b(), true, T::one());
            }
            Ok(())
        }
        (Kind::Rk(rk), Contribution::Rk(r)) => {
            rk.axpy_rk(T::one(), &r);
            if settings.recompress {
                rk.truncate(epsilon)?;
            }
            Ok(())
        }
        (Kind::Rk(rk), Contribution::Dense(x)) => {
            // keep the admissible leaf low rank: compress the update first
            let r = crate::compression::svd_compress(x.view(), epsilon)?;
            rk.axpy_rk(T::one(), &r);
            if settings.recompress {
                rk.truncate(epsilon)?;
            }
            Ok(())
        }
        (Kind::Internal(grid), contribution) => {
            for j in 0..grid.ncols() {
                for i in 0..grid.nrows() {
                    let Some(child) = grid.cell_mut(i, j) else { continue };
                    let rr = relative_range(child.rows(), &parent_rows);
                    let cr = relative_range(child.cols(), &parent_cols);
                    let sub = match &contribution {
                        Contribution::Dense(x) => Contribution::Dense(ScalarArray::from_view(
                            x.sub_view(rr.start, rr.len(), cr.start, cr.len()),
                        )),
                        Contribution::Rk(r) => Contribution::Rk(r.restrict(rr, cr)),
                    };
                    add_contribution(child, sub, settings)?;
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::admissibility::Hackbusch;
    use crate::core::cluster::ClusterTree;
    use crate::settings::SplitStrategy;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn random_h(n: usize, leaf: usize, seed: u64) -> (ClusterTree, HMatrix<f64>, ScalarArray<f64>) {
        let coords =
            Array2::from_shape_fn((n, 3), |(i, axis)| if axis == 0 { i as f64 } else { 0.0 });
        let settings = Settings {
            compression_min_leaf_size: 1,
            ..Settings::default()
                .with_max_leaf_size(leaf)
                .with_clustering(SplitStrategy::Median)
        };
        let tree = ClusterTree::build(coords, None, &settings);
        let adm = Hackbusch::from_settings(&settings);
        let mut h = HMatrix::build_skeleton(tree.root(), tree.root(), &adm, &settings);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        // smooth low-rank-friendly content plus noise on the diagonal blocks
        let full = ScalarArray::from_fn(n, n, |i, j| {
            1.0 / (1.0 + (i as f64 - j as f64).abs()) + 0.01 * f64::sample(&mut rng)
        });
        h.copy_from_dense(full.view(), 1e-10).unwrap();
        let dense = h.to_dense();
        (tree, h, dense)
    }

    fn relative_diff(x: &ScalarArray<f64>, y: &ScalarArray<f64>) -> f64 {
        let mut d = x.clone();
        d.axpy(-1.0, y);
        d.norm() / y.norm().max(1e-300)
    }

    #[test]
    fn block_gemm_matches_dense_gemm() {
        let (_t, a, ad) = random_h(32, 4, 1);
        let (_t2, b, bd) = random_h(32, 4, 2);
        let (_t3, mut c, cd) = random_h(32, 4, 3);
        let settings = Settings::default().with_epsilon(1e-12);

        gemm(1.5, &a, false, &b, false, 0.5, &mut c, &settings).unwrap();

        let mut reference = cd.clone();
        reference.scale(0.5);
        reference.gemm(1.5, &ad, false, &bd, false, 1.0);
        let err = relative_diff(&c.to_dense(), &reference);
        assert!(err < 1e-8, "relative error {err}");
    }

    #[test]
    fn transposed_block_gemm_matches_dense() {
        let (_t, a, ad) = random_h(24, 4, 4);
        let (_t2, b, bd) = random_h(24, 4, 5);
        let (_t3, mut c, _) = random_h(24, 4, 6);
        let settings = Settings::default().with_epsilon(1e-12);
        c.scale(0.0);

        gemm(1.0, &a, true, &b, true, 0.0, &mut c, &settings).unwrap();

        let mut reference = ScalarArray::zeros(24, 24);
        reference.gemm(1.0, &ad, true, &bd, true, 0.0);
        let err = relative_diff(&c.to_dense(), &reference);
        assert!(err < 1e-8, "relative error {err}");
    }

    #[test]
    fn dense_target_accumulates_h_product() {
        let (tree, a, ad) = random_h(16, 4, 7);
        let (_t2, b, bd) = random_h(16, 4, 8);
        let settings = Settings::default().with_epsilon(1e-12);
        let mut c = HMatrix::from_dense(tree.root(), tree.root(), ScalarArray::zeros(16, 16));

        gemm(2.0, &a, false, &b, true, 1.0, &mut c, &settings).unwrap();

        let mut reference = ScalarArray::zeros(16, 16);
        reference.gemm(2.0, &ad, false, &bd, true, 0.0);
        assert!(relative_diff(&c.to_dense(), &reference) < 1e-8);
    }
}
