//! Low-rank compression kernels and the oracle they are driven by.

pub mod aca;
pub mod mgs;

use ndarray::ArrayView2;
use num_traits::Zero;

use crate::core::dense::ScalarArray;
use crate::core::kernel::Kernel;
use crate::core::rk::RkMatrix;
use crate::core::scalar::Scalar;
use crate::error::Result;
use crate::settings::CompressionMethod;

/// Element access to a single (permuted) block of the operator being
/// assembled. Partial compression schemes only ever see rows and columns.
pub trait BlockOracle<T: Scalar>: Sync {
    fn nrows(&self) -> usize;

    fn ncols(&self) -> usize;

    fn entry(&self, i: usize, j: usize) -> T;

    fn row(&self, i: usize, out: &mut [T]) {
        debug_assert_eq!(out.len(), self.ncols());
        for (j, slot) in out.iter_mut().enumerate() {
            *slot = self.entry(i, j);
        }
    }

    fn col(&self, j: usize, out: &mut [T]) {
        debug_assert_eq!(out.len(), self.nrows());
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.entry(i, j);
        }
    }

    /// Materializes the whole block.
    fn full(&self) -> ScalarArray<T> {
        ScalarArray::from_fn(self.nrows(), self.ncols(), |i, j| self.entry(i, j))
    }
}

/// Outcome of a compression attempt.
#[derive(Debug)]
pub struct Compressed<T: Kernel> {
    pub rk: RkMatrix<T>,
    /// The scheme ran out of rank budget before reaching the target.
    pub hit_rank_cap: bool,
}

impl<T: Kernel> Compressed<T> {
    pub(crate) fn converged(rk: RkMatrix<T>) -> Self {
        Compressed {
            rk,
            hit_rank_cap: false,
        }
    }
}

/// Compresses one admissible block with the configured scheme.
pub fn compress_block<T: Kernel>(
    method: CompressionMethod,
    oracle: &dyn BlockOracle<T>,
    epsilon: T::Real,
    seed: Option<u64>,
) -> Result<Compressed<T>> {
    let (m, n) = (oracle.nrows(), oracle.ncols());
    match method {
        CompressionMethod::RkNull => Ok(Compressed::converged(RkMatrix::zero(m, n))),
        CompressionMethod::Svd => {
            let full = oracle.full();
            Ok(Compressed::converged(svd_compress(full.view(), epsilon)?))
        }
        CompressionMethod::AcaFull => Ok(aca::aca_full(&oracle.full(), epsilon)),
        CompressionMethod::AcaPartial => Ok(aca::aca_partial(oracle, epsilon)),
        CompressionMethod::AcaPlus => Ok(aca::aca_plus(oracle, epsilon, seed)),
    }
}

/// Truncated SVD compression: keeps the leading singular triplets with
/// `sigma_i > epsilon * sigma_0` and absorbs the singular values into the
/// left factor.
pub fn svd_compress<T: Kernel>(m: ArrayView2<'_, T>, epsilon: T::Real) -> Result<RkMatrix<T>> {
    let (rows, cols) = m.dim();
    if rows == 0 || cols == 0 {
        return Ok(RkMatrix::zero(rows, cols));
    }
    let svd = T::gesvd(m).map_err(crate::error::Error::from)?;
    let sigma0 = svd.sigma.first().copied().unwrap_or_else(T::Real::zero);
    if !(sigma0 > T::Real::zero()) {
        return Ok(RkMatrix::zero(rows, cols));
    }
    let floor = T::eps() * sigma0 * real_cast::<T>(rows.max(cols));
    let cut = epsilon * sigma0;
    let k = svd
        .sigma
        .iter()
        .take_while(|&&s| s > cut && s > floor)
        .count();
    if k == 0 {
        return Ok(RkMatrix::zero(rows, cols));
    }
    let a = ScalarArray::from_fn(rows, k, |i, j| svd.u[[i, j]].mul_real(svd.sigma[j]));
    // b = conj(v), read straight off the rows of vt
    let b = ScalarArray::from_fn(cols, k, |i, j| svd.vt[[j, i]]);
    Ok(RkMatrix::new(a, b))
}

fn real_cast<T: Scalar>(x: usize) -> T::Real {
    crate::core::scalar::real_of::<T>(x as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    struct DenseOracle(ScalarArray<f64>);

    impl BlockOracle<f64> for DenseOracle {
        fn nrows(&self) -> usize {
            self.0.rows()
        }

        fn ncols(&self) -> usize {
            self.0.cols()
        }

        fn entry(&self, i: usize, j: usize) -> f64 {
            self.0[(i, j)]
        }
    }

    fn low_rank_block(m: usize, n: usize, k: usize, seed: u64) -> ScalarArray<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let a = ScalarArray::<f64>::random(m, k, &mut rng);
        let b = ScalarArray::<f64>::random(n, k, &mut rng);
        let mut out = ScalarArray::zeros(m, n);
        out.gemm(1.0, &a, false, &b, true, 0.0);
        out
    }

    #[test]
    fn svd_compress_reaches_the_target() {
        let full = low_rank_block(30, 24, 4, 5);
        let rk = svd_compress(full.view(), 1e-10).unwrap();
        assert!(rk.rank() <= 8);
        let err = {
            let mut diff = rk.eval();
            diff.axpy(-1.0, &full);
            diff.norm() / full.norm()
        };
        assert!(err < 1e-9);
    }

    #[test]
    fn every_method_reaches_the_target_on_a_smooth_block() {
        // smooth kernel blocks are numerically low rank
        let m = 32;
        let full = ScalarArray::from_fn(m, m, |i, j| {
            1.0 / (1.0 + ((i as f64) - (j as f64 + 40.0)).abs())
        });
        let oracle = DenseOracle(full.clone());
        for method in [
            CompressionMethod::Svd,
            CompressionMethod::AcaFull,
            CompressionMethod::AcaPartial,
            CompressionMethod::AcaPlus,
        ] {
            let out = compress_block(method, &oracle, 1e-8, Some(7)).unwrap();
            let mut diff = out.rk.eval();
            diff.axpy(-1.0, &full);
            assert!(
                diff.norm() <= 1e-6 * full.norm(),
                "{method:?} missed the target: {}",
                diff.norm() / full.norm()
            );
            assert!(out.rk.rank() < m);
        }
    }

    #[test]
    fn rknull_yields_the_zero_block() {
        let oracle = DenseOracle(low_rank_block(8, 6, 2, 1));
        let out = compress_block(CompressionMethod::RkNull, &oracle, 1e-6, None).unwrap();
        assert_eq!(out.rk.rank(), 0);
        assert_eq!(out.rk.eval().norm(), 0.0);
    }

    #[test]
    fn zero_block_compresses_to_rank_zero() {
        let z = ScalarArray::<f64>::zeros(10, 7);
        let rk = svd_compress(z.view(), 1e-6).unwrap();
        assert_eq!(rk.rank(), 0);
    }
}
