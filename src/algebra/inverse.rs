//! Block inverse by Gauss-Jordan elimination over the child grid,
//! equivalent to elimination on the extended matrix `[m | i]`.
//!
//! Products that would alias their destination go through per-step
//! temporaries, acquired at the step boundary and dropped at its end.

use log::debug;
use num_traits::{One, Zero};

use crate::algebra::gemm::gemm;
use crate::core::block::{HMatrix, Kind};
use crate::core::kernel::Kernel;
use crate::core::scalar::Scalar;
use crate::error::{Error, Result};
use crate::settings::Settings;

impl<T: Kernel> HMatrix<T> {
    /// Overwrites the matrix with its inverse.
    pub fn inverse_in_place(&mut self, settings: &Settings) -> Result<()> {
        if self.nrows() == 0 {
            return Err(Error::EmptyCluster);
        }
        debug!("inverting {} x {} h-matrix", self.nrows(), self.ncols());
        inverse_recurse(self, settings)
    }

    /// Non-destructive inverse.
    pub fn inverse(&self, settings: &Settings) -> Result<HMatrix<T>> {
        let mut out = self.clone();
        out.inverse_in_place(settings)?;
        Ok(out)
    }
}

fn inverse_recurse<T: Kernel>(h: &mut HMatrix<T>, settings: &Settings) -> Result<()> {
    if !h.is_internal() {
        let path = h.path();
        let (nr, nc) = (h.nrows(), h.ncols());
        return match &mut h.kind {
            Kind::Dense(d) => d.tile.inverse_in_place().map_err(|err| Error::Singular {
                path,
                pivot: err.info.max(0) as usize,
            }),
            Kind::Rk(_) => Err(Error::InvalidShape {
                rows: nr,
                cols: nc,
                expected_rows: nr,
                expected_cols: nr,
            }),
            Kind::Internal(_) => unreachable!(),
        };
    }
    let n = {
        let Kind::Internal(grid) = &h.kind else { unreachable!() };
        debug_assert_eq!(grid.nrows(), grid.ncols());
        grid.nrows()
    };
    for k in 0..n {
        let Kind::Internal(grid) = &mut h.kind else { unreachable!() };
        let Some(mut pivot) = grid.take(k, k) else { continue };

        // 1. the pivot block becomes its own inverse
        inverse_recurse(&mut pivot, settings)?;

        // 2. row k: m_kj <- m_kk^-1 m_kj
        for j in 0..n {
            if j == k {
                continue;
            }
            let Some(old) = grid.take(k, j) else { continue };
            let mut fresh = old.clone();
            fresh.set_zero();
            gemm(T::one(), &pivot, false, &old, false, T::zero(), &mut fresh, settings)?;
            grid.put(k, j, Some(fresh));
        }

        // 3. trailing: m_ij -= m_ik m_kj, with the old column k and the
        // fresh row k
        for j in 0..n {
            if j == k {
                continue;
            }
            for i in 0..n {
                if i == k {
                    continue;
                }
                let Some(mut target) = grid.take(i, j) else { continue };
                if let (Some(mik), Some(mkj)) = (grid.cell(i, k), grid.cell(k, j)) {
                    gemm(
                        T::neg_one(),
                        mik,
                        false,
                        mkj,
                        false,
                        T::one(),
                        &mut target,
                        settings,
                    )?;
                }
                grid.put(i, j, Some(target));
            }
        }

        // 4. column k: m_ik <- -m_ik m_kk^-1
        for i in 0..n {
            if i == k {
                continue;
            }
            let Some(old) = grid.take(i, k) else { continue };
            let mut fresh = old.clone();
            fresh.set_zero();
            gemm(
                T::neg_one(),
                &old,
                false,
                &pivot,
                false,
                T::zero(),
                &mut fresh,
                settings,
            )?;
            grid.put(i, k, Some(fresh));
        }

        grid.put(k, k, Some(pivot));
    }
    Ok(())
}
