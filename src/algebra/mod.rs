//! Recursive block-structured linear algebra over `HMatrix` operands.

pub mod factorization;
pub mod gemm;
pub mod inverse;
pub mod triangular;

pub use factorization::{FactorKind, Factorization};
pub use gemm::gemm;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::admissibility::Hackbusch;
    use crate::core::block::HMatrix;
    use crate::core::cluster::ClusterTree;
    use crate::core::dense::ScalarArray;
    use crate::core::kernel::{Kernel, Part, Side};
    use crate::error::Error;
    use crate::settings::{Settings, SplitStrategy};
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn line_tree(n: usize, leaf: usize) -> ClusterTree {
        let coords =
            Array2::from_shape_fn((n, 3), |(i, axis)| if axis == 0 { i as f64 } else { 0.0 });
        let settings = Settings::default()
            .with_max_leaf_size(leaf)
            .with_clustering(SplitStrategy::Median);
        ClusterTree::build(coords, None, &settings)
    }

    fn loaded_h(
        n: usize,
        leaf: usize,
        full: &ScalarArray<f64>,
        settings: &Settings,
    ) -> (ClusterTree, HMatrix<f64>) {
        let tree = line_tree(n, leaf);
        let adm = Hackbusch::from_settings(settings);
        let mut h = HMatrix::build_skeleton(tree.root(), tree.root(), &adm, settings);
        h.copy_from_dense(full.view(), 1e-12).unwrap();
        (tree, h)
    }

    fn relative_diff(x: &ScalarArray<f64>, y: &ScalarArray<f64>) -> f64 {
        let mut d = x.clone();
        d.axpy(-1.0, y);
        d.norm() / y.norm().max(1e-300)
    }

    fn tight_settings() -> Settings {
        Settings {
            compression_min_leaf_size: 1,
            ..Settings::default().with_epsilon(1e-13)
        }
    }

    #[test]
    fn identity_solve_returns_the_rhs() {
        // identity of size 32 assembled, then solve(i, b) = b
        let settings = tight_settings();
        let eye = ScalarArray::<f64>::identity(32);
        let (_tree, h) = loaded_h(32, 4, &eye, &settings);
        let factored = Factorization::lu(&h, &settings).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let b = ScalarArray::<f64>::random(32, 2, &mut rng);
        let mut x = b.clone();
        factored.solve(&mut x).unwrap();
        assert!(relative_diff(&x, &b) < 1e-13);
    }

    #[test]
    fn block_lu_matches_the_dense_solution() {
        // random 8 x 8 block matrix of 4 x 4 dense leaves
        let n = 32;
        let settings = tight_settings();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut full = ScalarArray::<f64>::random(n, n, &mut rng);
        for i in 0..n {
            full[(i, i)] += n as f64;
        }
        let (_tree, h) = loaded_h(n, 4, &full, &settings);
        let factored = Factorization::lu(&h, &settings).unwrap();

        let b = ScalarArray::<f64>::random(n, 1, &mut rng);
        let mut x = b.clone();
        factored.solve(&mut x).unwrap();

        // direct dense solution
        let mut lu = full.clone();
        let ipiv = lu.lu_in_place().unwrap();
        let mut xd = b.clone();
        f64::laswp(xd.view_mut(), &ipiv);
        f64::trsm(Side::Left, Part::UnitLower, false, lu.view(), xd.view_mut());
        f64::trsm(Side::Left, Part::Upper, false, lu.view(), xd.view_mut());

        assert!(relative_diff(&x, &xd) < 1e-10);

        // and l u recomposes h: a x - b should vanish for the h solution
        let mut residual = b.clone();
        let mut ax = ScalarArray::zeros(n, 1);
        ax.gemm(1.0, &full, false, &x, false, 0.0);
        residual.axpy(-1.0, &ax);
        assert!(residual.norm() <= 1e-10 * b.norm().max(1.0));
    }

    #[test]
    fn block_cholesky_on_spd_input() {
        // random spd matrix of size 64: m = a^t a + 64 i
        let n = 64;
        let settings = tight_settings();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let a = ScalarArray::<f64>::random(n, n, &mut rng);
        let mut m = ScalarArray::zeros(n, n);
        m.gemm(1.0, &a, true, &a, false, 0.0);
        for i in 0..n {
            m[(i, i)] += n as f64;
        }
        let (_tree, h) = loaded_h(n, 8, &m, &settings);
        let mut factored = h.clone();
        factored.llt_in_place(&settings).unwrap();

        // rebuild l l^t from the factored lower triangle
        let lf = factored.to_dense();
        let mut l = ScalarArray::zeros(n, n);
        for j in 0..n {
            for i in j..n {
                l[(i, j)] = lf[(i, j)];
            }
        }
        let mut rec = ScalarArray::zeros(n, n);
        rec.gemm(1.0, &l, false, &l, true, 0.0);
        assert!(relative_diff(&rec, &m) <= 1e-12);

        // and the wrapped solve inverts m
        let fac = Factorization::llt(&h, &settings).unwrap();
        let b = ScalarArray::<f64>::random(n, 3, &mut rng);
        let mut x = b.clone();
        fac.solve(&mut x).unwrap();
        let mut ax = ScalarArray::zeros(n, 3);
        ax.gemm(1.0, &m, false, &x, false, 0.0);
        assert!(relative_diff(&ax, &b) < 1e-10);
    }

    #[test]
    fn block_ldlt_solves_symmetric_systems() {
        let n = 48;
        let settings = tight_settings();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let a = ScalarArray::<f64>::random(n, n, &mut rng);
        let mut m = ScalarArray::zeros(n, n);
        m.gemm(1.0, &a, true, &a, false, 0.0);
        for i in 0..n {
            m[(i, i)] += n as f64;
        }
        let (_tree, h) = loaded_h(n, 8, &m, &settings);
        let fac = Factorization::ldlt(&h, &settings).unwrap();
        assert_eq!(fac.kind(), FactorKind::Ldlt);

        let b = ScalarArray::<f64>::random(n, 2, &mut rng);
        let mut x = b.clone();
        fac.solve(&mut x).unwrap();
        let mut ax = ScalarArray::zeros(n, 2);
        ax.gemm(1.0, &m, false, &x, false, 0.0);
        assert!(relative_diff(&ax, &b) < 1e-9);
    }

    #[test]
    fn block_inverse_hits_the_identity() {
        let n = 32;
        let settings = tight_settings();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut full = ScalarArray::<f64>::random(n, n, &mut rng);
        for i in 0..n {
            full[(i, i)] += n as f64;
        }
        let (_tree, h) = loaded_h(n, 4, &full, &settings);
        let inv = h.inverse(&settings).unwrap();

        let mut id = ScalarArray::zeros(n, n);
        id.gemm(1.0, &full, false, &inv.to_dense(), false, 0.0);
        for i in 0..n {
            id[(i, i)] -= 1.0;
        }
        assert!(id.norm() < 1e-8);
    }

    #[test]
    fn singular_matrix_reports_its_block() {
        let n = 16;
        let settings = tight_settings();
        let zero = ScalarArray::<f64>::zeros(n, n);
        let (_tree, h) = loaded_h(n, 4, &zero, &settings);
        let err = Factorization::lu(&h, &settings).unwrap_err();
        match err {
            Error::Singular { path, pivot } => {
                assert_eq!(pivot, 1);
                assert!(!path.rows.is_empty());
            }
            other => panic!("expected a singular pivot, got {other:?}"),
        }
    }

    #[test]
    fn factoring_an_empty_matrix_is_an_error() {
        let settings = tight_settings();
        let tree = ClusterTree::build(Array2::zeros((0, 3)), None, &settings);
        let adm = Hackbusch::from_settings(&settings);
        let mut h = HMatrix::<f64>::build_skeleton(tree.root(), tree.root(), &adm, &settings);
        assert!(matches!(
            h.lu_in_place(&settings),
            Err(Error::EmptyCluster)
        ));
    }

    #[test]
    fn triangular_solve_inverts_its_factor_on_h_rhs() {
        use crate::algebra::triangular::trsm_h;

        let n = 32;
        let settings = tight_settings();
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let mut full = ScalarArray::<f64>::random(n, n, &mut rng);
        for i in 0..n {
            full[(i, i)] += n as f64;
        }
        let (_tree, h) = loaded_h(n, 4, &full, &settings);
        let mut factored = h.clone();
        factored.lu_in_place(&settings).unwrap();

        let rhs_full = ScalarArray::<f64>::random(n, n, &mut rng);
        let (_t2, mut rhs) = loaded_h(n, 4, &rhs_full, &settings);
        let before = rhs.to_dense();

        // x u = rhs, then recompose x * u and compare
        trsm_h(&factored, Part::Upper, false, Side::Right, &mut rhs, &settings).unwrap();
        let x = rhs.to_dense();
        let fd = factored.to_dense();
        let mut u = ScalarArray::zeros(n, n);
        for j in 0..n {
            for i in 0..=j {
                u[(i, j)] = fd[(i, j)];
            }
        }
        let mut rec = ScalarArray::zeros(n, n);
        rec.gemm(1.0, &x, false, &u, false, 0.0);
        assert!(relative_diff(&rec, &before) < 1e-9);
    }
}
