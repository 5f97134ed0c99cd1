//! Assembly: populating a block-tree skeleton from a user matrix-element
//! generator.
//!
//! The generator speaks *original* (pre-permutation) DoF indices; the
//! driver translates through the cluster-tree permutations before calling
//! it. Leaves are independent, so the walk forks through the task executor
//! up to `max_parallel_leaves` concurrent branches.

use std::marker::PhantomData;

use log::{debug, info, warn};
use num_traits::Zero;

use crate::compression::{compress_block, svd_compress, BlockOracle};
use crate::core::admissibility::Admissibility;
use crate::core::block::{relative_range, HMatrix, Kind};
use crate::core::cluster::ClusterTree;
use crate::core::dense::ScalarArray;
use crate::core::kernel::Kernel;
use crate::core::rk::RkMatrix;
use crate::core::scalar::{real_of, Scalar};
use crate::error::{Error, Result};
use crate::executor::TaskExecutor;
use crate::settings::Settings;

/// User-supplied matrix-element generator over original DoF indices.
pub trait Generator<T: Scalar>: Sync {
    fn entry(&self, row: usize, col: usize) -> T;

    /// Fills a whole tile at once; override when batched evaluation is
    /// cheaper than per-element calls.
    fn block(&self, rows: &[usize], cols: &[usize], out: &mut ScalarArray<T>) {
        debug_assert_eq!((out.rows(), out.cols()), (rows.len(), cols.len()));
        for (j, &c) in cols.iter().enumerate() {
            for (i, &r) in rows.iter().enumerate() {
                out[(i, j)] = self.entry(r, c);
            }
        }
    }
}

/// Adapter translating permuted block coordinates into generator calls.
struct PermutedOracle<'a, T, G> {
    generator: &'a G,
    rows: &'a [usize],
    cols: &'a [usize],
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Scalar, G: Generator<T>> BlockOracle<T> for PermutedOracle<'a, T, G> {
    fn nrows(&self) -> usize {
        self.rows.len()
    }

    fn ncols(&self) -> usize {
        self.cols.len()
    }

    fn entry(&self, i: usize, j: usize) -> T {
        self.generator.entry(self.rows[i], self.cols[j])
    }

    fn full(&self) -> ScalarArray<T> {
        let mut out = ScalarArray::zeros(self.rows.len(), self.cols.len());
        self.generator.block(self.rows, self.cols, &mut out);
        out
    }
}

/// Builds the skeleton for the cluster pair and populates every leaf.
pub fn assemble<T: Kernel, G: Generator<T>, E: TaskExecutor>(
    row_tree: &ClusterTree,
    col_tree: &ClusterTree,
    generator: &G,
    admissibility: &dyn Admissibility,
    settings: &Settings,
    executor: &E,
) -> Result<HMatrix<T>> {
    let mut h = HMatrix::build_skeleton(row_tree.root(), col_tree.root(), admissibility, settings);
    info!(
        "assembling {} x {} h-matrix with {:?}",
        h.nrows(),
        h.ncols(),
        settings.compression
    );
    fill_node(
        &mut h,
        row_tree.permutation(),
        col_tree.permutation(),
        generator,
        settings,
        executor,
        settings.max_parallel_leaves.max(1),
    )?;
    if settings.nan_audit {
        h.assert_finite();
    }
    if settings.coarsening {
        coarsen(&mut h, real_of::<T>(settings.recompression_epsilon))?;
    }
    let stored = h.compressed_size();
    let dense = h.uncompressed_size().max(1);
    info!(
        "assembled: {} scalars stored, {:.1}% of dense",
        stored,
        100.0 * stored as f64 / dense as f64
    );
    Ok(h)
}

fn fill_node<T: Kernel, G: Generator<T>, E: TaskExecutor>(
    h: &mut HMatrix<T>,
    row_perm: &[usize],
    col_perm: &[usize],
    generator: &G,
    settings: &Settings,
    executor: &E,
    budget: usize,
) -> Result<()> {
    let rows = &row_perm[h.rows().range()];
    let cols = &col_perm[h.cols().range()];
    let path = h.path();
    match &mut h.kind {
        Kind::Dense(d) => {
            generator.block(rows, cols, &mut d.tile);
            d.pivots = None;
            Ok(())
        }
        Kind::Rk(rk) => {
            let oracle = PermutedOracle {
                generator,
                rows,
                cols,
                _marker: PhantomData,
            };
            let epsilon = real_of::<T>(settings.assembly_epsilon);
            let compressed = compress_block(settings.compression, &oracle, epsilon, settings.seed)?;
            *rk = compressed.rk;
            if compressed.hit_rank_cap {
                warn!(
                    "compression of block {} hit the rank cap at rank {}",
                    path,
                    rk.rank()
                );
            }
            if settings.validate_compression {
                validate_leaf(rk, &oracle, &path, settings)?;
            } else {
                debug!(
                    "block {}: {} x {} compressed to rank {}",
                    path,
                    rows.len(),
                    cols.len(),
                    rk.rank()
                );
            }
            Ok(())
        }
        Kind::Internal(grid) => fill_cells(
            grid.cells_slice_mut(),
            row_perm,
            col_perm,
            generator,
            settings,
            executor,
            budget,
        ),
    }
}

fn fill_cells<T: Kernel, G: Generator<T>, E: TaskExecutor>(
    cells: &mut [Option<Box<HMatrix<T>>>],
    row_perm: &[usize],
    col_perm: &[usize],
    generator: &G,
    settings: &Settings,
    executor: &E,
    budget: usize,
) -> Result<()> {
    if cells.len() <= 1 || budget <= 1 {
        for cell in cells.iter_mut().flatten() {
            fill_node(cell, row_perm, col_perm, generator, settings, executor, 1)?;
        }
        return Ok(());
    }
    let mid = cells.len() / 2;
    let (left, right) = cells.split_at_mut(mid);
    let (la, ra) = executor.join(
        || {
            fill_cells(
                left, row_perm, col_perm, generator, settings, executor, budget / 2,
            )
        },
        || {
            fill_cells(
                right,
                row_perm,
                col_perm,
                generator,
                settings,
                executor,
                budget - budget / 2,
            )
        },
    );
    la.and(ra)
}

fn validate_leaf<T: Kernel, G: Generator<T>>(
    rk: &mut RkMatrix<T>,
    oracle: &PermutedOracle<'_, T, G>,
    path: &crate::error::BlockPath,
    settings: &Settings,
) -> Result<()> {
    let reference = oracle.full();
    let denom = reference.norm();
    let mut error = compression_error(rk, &reference, denom);
    let threshold = real_of::<T>(settings.validation_error_threshold);
    if !(error > threshold) {
        return Ok(());
    }
    warn!(
        "block {} validation failed: error {:.3e} above threshold",
        path,
        error.re_f64()
    );
    if settings.validation_dump {
        dump_leaf(rk, &reference, path)?;
    }
    if settings.validation_rerun {
        *rk = svd_compress(
            reference.view(),
            real_of::<T>(settings.assembly_epsilon),
        )?;
        error = compression_error(rk, &reference, denom);
        if !(error > threshold) {
            debug!("block {} recovered by svd re-compression", path);
            return Ok(());
        }
    }
    Err(Error::RankExceeded {
        path: path.clone(),
        rank: rk.rank(),
    })
}

fn compression_error<T: Kernel>(
    rk: &RkMatrix<T>,
    reference: &ScalarArray<T>,
    denom: T::Real,
) -> T::Real {
    let mut diff = rk.eval();
    diff.axpy(T::neg_one(), reference);
    if denom > T::Real::zero() {
        diff.norm() / denom
    } else {
        diff.norm()
    }
}

fn dump_leaf<T: Kernel>(
    rk: &RkMatrix<T>,
    reference: &ScalarArray<T>,
    path: &crate::error::BlockPath,
) -> Result<()> {
    let base = format!("hmat-dump-{}-{}", path.rows, path.cols);
    let mut f = std::fs::File::create(format!("{base}.ref"))?;
    reference.write_to(&mut f)?;
    let mut f = std::fs::File::create(format!("{base}.rk"))?;
    rk.eval().write_to(&mut f)?;
    warn!("block {} dumped to {base}.{{ref,rk}}", path);
    Ok(())
}

/// Post-assembly coarsening: an internal node whose children all ended up
/// low rank is replaced by their merged, re-truncated factor pair whenever
/// that shrinks storage.
fn coarsen<T: Kernel>(h: &mut HMatrix<T>, epsilon: T::Real) -> Result<()> {
    let parent_rows = h.rows().clone();
    let parent_cols = h.cols().clone();
    let Kind::Internal(grid) = &mut h.kind else {
        return Ok(());
    };
    for cell in grid.cells_mut() {
        coarsen(cell, epsilon)?;
    }
    let all_rk = grid.cells().all(|c| c.is_rk_leaf());
    if !all_rk {
        return Ok(());
    }
    let child_storage: usize = grid.cells().map(|c| c.compressed_size()).sum();
    let total_rank: usize = grid
        .cells()
        .map(|c| match &c.kind {
            Kind::Rk(rk) => rk.rank(),
            _ => 0,
        })
        .sum();
    let (m, n) = (parent_rows.size(), parent_cols.size());
    let mut a = ScalarArray::zeros(m, total_rank);
    let mut b = ScalarArray::zeros(n, total_rank);
    let mut offset = 0;
    for cell in grid.cells() {
        let Kind::Rk(rk) = &cell.kind else { unreachable!() };
        let rr = relative_range(cell.rows(), &parent_rows);
        let cr = relative_range(cell.cols(), &parent_cols);
        for k in 0..rk.rank() {
            for i in 0..rk.rows() {
                a[(rr.start + i, offset + k)] = rk.a()[(i, k)];
            }
            for i in 0..rk.cols() {
                b[(cr.start + i, offset + k)] = rk.b()[(i, k)];
            }
        }
        offset += rk.rank();
    }
    let mut merged = RkMatrix::new(a, b);
    merged.truncate(epsilon)?;
    if merged.storage() < child_storage {
        debug!(
            "coarsened block ({}, {}) to rank {}",
            parent_rows.name(),
            parent_cols.name(),
            merged.rank()
        );
        h.kind = Kind::Rk(merged);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::admissibility::{Always, Hackbusch};
    use crate::executor::{Sequential, Threaded};
    use crate::settings::{CompressionMethod, SplitStrategy};
    use ndarray::Array2;

    /// `k(i, j) = 1 / (|x_i - x_j| + 1)` over points on a line.
    struct LineKernel {
        x: Vec<f64>,
    }

    impl Generator<f64> for LineKernel {
        fn entry(&self, row: usize, col: usize) -> f64 {
            1.0 / ((self.x[row] - self.x[col]).abs() + 1.0)
        }
    }

    fn line_tree(n: usize, leaf: usize) -> ClusterTree {
        let coords =
            Array2::from_shape_fn((n, 3), |(i, axis)| if axis == 0 { i as f64 } else { 0.0 });
        let settings = Settings::default()
            .with_max_leaf_size(leaf)
            .with_clustering(SplitStrategy::Median);
        ClusterTree::build(coords, None, &settings)
    }

    fn permuted_reference<G: Generator<f64>>(
        tree: &ClusterTree,
        generator: &G,
    ) -> ScalarArray<f64> {
        let n = tree.cardinality();
        ScalarArray::from_fn(n, n, |i, j| {
            generator.entry(tree.to_original(i), tree.to_original(j))
        })
    }

    #[test]
    fn svd_assembly_matches_the_dense_reference() {
        let _ = env_logger::builder().is_test(true).try_init();
        let n = 16;
        let tree = line_tree(n, 4);
        let generator = LineKernel {
            x: (0..n).map(|i| i as f64).collect(),
        };
        let settings = Settings {
            compression_min_leaf_size: 1,
            ..Settings::default()
                .with_epsilon(1e-6)
                .with_compression(CompressionMethod::Svd)
        };
        let adm = Hackbusch::from_settings(&settings);
        let h = assemble(&tree, &tree, &generator, &adm, &settings, &Sequential).unwrap();
        assert!(h.check_structure());

        let reference = permuted_reference(&tree, &generator);
        let mut diff = h.to_dense();
        diff.axpy(-1.0, &reference);
        assert!(diff.norm() <= 1e-5, "error {}", diff.norm());
    }

    #[test]
    fn every_compression_method_assembles_accurately() {
        let n = 64;
        let tree = line_tree(n, 8);
        let generator = LineKernel {
            x: (0..n).map(|i| i as f64).collect(),
        };
        let reference = permuted_reference(&tree, &generator);
        for method in [
            CompressionMethod::Svd,
            CompressionMethod::AcaFull,
            CompressionMethod::AcaPartial,
            CompressionMethod::AcaPlus,
        ] {
            let settings = Settings {
                compression_min_leaf_size: 1,
                seed: Some(11),
                ..Settings::default()
                    .with_epsilon(1e-8)
                    .with_compression(method)
            };
            let adm = Hackbusch::from_settings(&settings);
            let h = assemble(&tree, &tree, &generator, &adm, &settings, &Threaded).unwrap();
            let mut diff = h.to_dense();
            diff.axpy(-1.0, &reference);
            assert!(
                diff.norm() <= 1e-6 * reference.norm(),
                "{method:?}: error {}",
                diff.norm() / reference.norm()
            );
            assert!(h.compressed_size() < h.uncompressed_size());
        }
    }

    #[test]
    fn coarsening_merges_all_low_rank_siblings() {
        struct RankOne;
        impl Generator<f64> for RankOne {
            fn entry(&self, row: usize, col: usize) -> f64 {
                (1.0 + row as f64) * (1.0 + col as f64).recip()
            }
        }
        let n = 16;
        let tree = line_tree(n, 8);
        let adm = Always { max_elements: 64 };
        let settings = Settings {
            compression_min_leaf_size: 1,
            coarsening: true,
            ..Settings::default()
                .with_epsilon(1e-10)
                .with_compression(CompressionMethod::Svd)
        };
        let h = assemble(&tree, &tree, &RankOne, &adm, &settings, &Sequential).unwrap();
        assert!(h.is_rk_leaf(), "all-rank-one children merge into one leaf");

        let reference = permuted_reference(&tree, &RankOne);
        let mut diff = h.to_dense();
        diff.axpy(-1.0, &reference);
        assert!(diff.norm() <= 1e-8 * reference.norm());
    }

    #[test]
    fn end_to_end_solve_in_original_ordering() {
        use crate::algebra::Factorization;

        // assemble, factor and solve; right-hand sides live in the original
        // DoF ordering and go through the tree permutation both ways
        struct Shifted {
            x: Vec<f64>,
        }
        impl Generator<f64> for Shifted {
            fn entry(&self, row: usize, col: usize) -> f64 {
                let base = 1.0 / ((self.x[row] - self.x[col]).abs() + 1.0);
                if row == col {
                    base + 4.0
                } else {
                    base
                }
            }
        }

        let n = 48;
        let tree = line_tree(n, 8);
        let generator = Shifted {
            x: (0..n).map(|i| (i * 7 % n) as f64).collect(),
        };
        let settings = Settings {
            compression_min_leaf_size: 1,
            ..Settings::default()
                .with_epsilon(1e-10)
                .with_compression(CompressionMethod::AcaPlus)
                .with_seed(5)
        };
        let adm = Hackbusch::from_settings(&settings);
        let h = assemble(&tree, &tree, &generator, &adm, &settings, &Sequential).unwrap();
        let factored = Factorization::auto(&h, &settings).unwrap();

        let b = ScalarArray::from_fn(n, 1, |i, _| (i as f64).sin());
        let mut x = tree.permute_rows(&b);
        factored.solve(&mut x).unwrap();
        let x = tree.unpermute_rows(&x);

        // residual in the original ordering
        let mut ax = ScalarArray::zeros(n, 1);
        for i in 0..n {
            let mut s = 0.0;
            for j in 0..n {
                s += generator.entry(i, j) * x[(j, 0)];
            }
            ax[(i, 0)] = s;
        }
        let mut residual = ax;
        residual.axpy(-1.0, &b);
        assert!(residual.norm() <= 1e-7 * b.norm());
    }

    #[test]
    fn validation_rerun_recovers_a_null_compression() {
        let n = 32;
        let tree = line_tree(n, 8);
        let generator = LineKernel {
            x: (0..n).map(|i| i as f64).collect(),
        };
        let settings = Settings {
            compression_min_leaf_size: 1,
            validate_compression: true,
            validation_error_threshold: 1e-3,
            validation_rerun: true,
            ..Settings::default()
                .with_epsilon(1e-8)
                .with_compression(CompressionMethod::RkNull)
        };
        let adm = Hackbusch::from_settings(&settings);
        let h = assemble(&tree, &tree, &generator, &adm, &settings, &Sequential).unwrap();
        let reference = permuted_reference(&tree, &generator);
        let mut diff = h.to_dense();
        diff.axpy(-1.0, &reference);
        assert!(diff.norm() <= 1e-6 * reference.norm());
    }

    #[test]
    fn validation_without_rerun_rejects_a_null_compression() {
        let n = 32;
        let tree = line_tree(n, 8);
        let generator = LineKernel {
            x: (0..n).map(|i| i as f64).collect(),
        };
        let settings = Settings {
            compression_min_leaf_size: 1,
            validate_compression: true,
            validation_error_threshold: 1e-3,
            validation_rerun: false,
            ..Settings::default().with_compression(CompressionMethod::RkNull)
        };
        let adm = Hackbusch::from_settings(&settings);
        let err = assemble::<f64, _, _>(&tree, &tree, &generator, &adm, &settings, &Sequential)
            .unwrap_err();
        assert!(matches!(err, Error::RankExceeded { .. }));
    }
}
