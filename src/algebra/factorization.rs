//! In-place block factorizations and the non-destructive `Factorization`
//! wrapper.
//!
//! All three follow the same outer loop over the diagonal of the child
//! grid: factor the diagonal block, solve the off-diagonal blocks of its
//! row/column against it, then apply the Schur-complement update to the
//! trailing blocks. The loop is strictly sequential in `k`; inside one step
//! the solves and trailing updates are mutually independent.
//!
//! LU keeps its pivots inside the dense leaves that produced them. LDL^T
//! and LL^T touch only the lower triangle; for complex scalars both use the
//! complex-symmetric convention.

use log::debug;
use num_traits::{One, Zero};

use crate::algebra::gemm::gemm;
use crate::algebra::triangular::{solve_triangular_dense, trsm_h};
use crate::core::block::{HMatrix, Kind};
use crate::core::dense::ScalarArray;
use crate::core::kernel::{Kernel, Part, Side};
use crate::core::scalar::Scalar;
use crate::error::{Error, Result};
use crate::settings::Settings;

impl<T: Kernel> HMatrix<T> {
    /// Pivoted block LU, in place: the unit-lower and upper factors overwrite
    /// the matrix, leaf pivots stay with their leaves.
    pub fn lu_in_place(&mut self, settings: &Settings) -> Result<()> {
        if self.nrows() == 0 {
            return Err(Error::EmptyCluster);
        }
        debug!(
            "lu factorization of {} x {} h-matrix",
            self.nrows(),
            self.ncols()
        );
        lu_recurse(self, settings)
    }

    /// Block LDL^T of the lower triangle, in place.
    pub fn ldlt_in_place(&mut self, settings: &Settings) -> Result<()> {
        if self.nrows() == 0 {
            return Err(Error::EmptyCluster);
        }
        debug!(
            "ldlt factorization of {} x {} h-matrix",
            self.nrows(),
            self.ncols()
        );
        ldlt_recurse(self, settings)
    }

    /// Block Cholesky of the lower triangle, in place.
    pub fn llt_in_place(&mut self, settings: &Settings) -> Result<()> {
        if self.nrows() == 0 {
            return Err(Error::EmptyCluster);
        }
        debug!(
            "llt factorization of {} x {} h-matrix",
            self.nrows(),
            self.ncols()
        );
        llt_recurse(self, settings)
    }
}

fn invalid_diag(rows: usize, cols: usize) -> Error {
    Error::InvalidShape {
        rows,
        cols,
        expected_rows: rows,
        expected_cols: rows,
    }
}

fn diag_children<T: Kernel>(h: &HMatrix<T>) -> usize {
    let Kind::Internal(grid) = &h.kind else { unreachable!() };
    debug_assert_eq!(grid.nrows(), grid.ncols());
    grid.nrows()
}

fn lu_recurse<T: Kernel>(h: &mut HMatrix<T>, settings: &Settings) -> Result<()> {
    if !h.is_internal() {
        let path = h.path();
        let (nr, nc) = (h.nrows(), h.ncols());
        return match &mut h.kind {
            Kind::Dense(d) => match d.tile.lu_in_place() {
                Ok(pivots) => {
                    d.pivots = Some(pivots);
                    Ok(())
                }
                Err(err) => Err(Error::Singular {
                    path,
                    pivot: err.info.max(0) as usize,
                }),
            },
            Kind::Rk(_) => Err(invalid_diag(nr, nc)),
            Kind::Internal(_) => unreachable!(),
        };
    }
    let n = diag_children(h);
    for k in 0..n {
        let Kind::Internal(grid) = &mut h.kind else { unreachable!() };
        let Some(mut diag) = grid.take(k, k) else { continue };
        lu_recurse(&mut diag, settings)?;

        // row of u: l_kk u_ki = h_ki
        for i in (k + 1)..n {
            if let Some(target) = grid.cell_mut(k, i) {
                trsm_h(&diag, Part::UnitLower, false, Side::Left, target, settings)?;
            }
        }
        // column of l: l_ik u_kk = h_ik
        for i in (k + 1)..n {
            if let Some(target) = grid.cell_mut(i, k) {
                trsm_h(&diag, Part::Upper, false, Side::Right, target, settings)?;
            }
        }
        // trailing update: h_ij -= l_ik u_kj
        for j in (k + 1)..n {
            for i in (k + 1)..n {
                let Some(mut target) = grid.take(i, j) else { continue };
                if let (Some(l), Some(u)) = (grid.cell(i, k), grid.cell(k, j)) {
                    gemm(T::neg_one(), l, false, u, false, T::one(), &mut target, settings)?;
                }
                grid.put(i, j, Some(target));
            }
        }
        grid.put(k, k, Some(diag));
    }
    Ok(())
}

fn llt_recurse<T: Kernel>(h: &mut HMatrix<T>, settings: &Settings) -> Result<()> {
    if !h.is_internal() {
        let path = h.path();
        let (nr, nc) = (h.nrows(), h.ncols());
        return match &mut h.kind {
            Kind::Dense(d) => T::potrf(d.tile.view_mut()).map_err(|err| Error::Singular {
                path,
                pivot: err.info.max(0) as usize,
            }),
            Kind::Rk(_) => Err(invalid_diag(nr, nc)),
            Kind::Internal(_) => unreachable!(),
        };
    }
    let n = diag_children(h);
    for k in 0..n {
        let Kind::Internal(grid) = &mut h.kind else { unreachable!() };
        let Some(mut diag) = grid.take(k, k) else { continue };
        llt_recurse(&mut diag, settings)?;

        // l_ik l_kk^t = h_ik
        for i in (k + 1)..n {
            if let Some(target) = grid.cell_mut(i, k) {
                trsm_h(&diag, Part::Lower, true, Side::Right, target, settings)?;
            }
        }
        // trailing lower triangle: h_ij -= l_ik l_jk^t
        for j in (k + 1)..n {
            for i in j..n {
                let Some(mut target) = grid.take(i, j) else { continue };
                if let (Some(li), Some(lj)) = (grid.cell(i, k), grid.cell(j, k)) {
                    gemm(T::neg_one(), li, false, lj, true, T::one(), &mut target, settings)?;
                }
                grid.put(i, j, Some(target));
            }
        }
        grid.put(k, k, Some(diag));
    }
    Ok(())
}

fn ldlt_recurse<T: Kernel>(h: &mut HMatrix<T>, settings: &Settings) -> Result<()> {
    if !h.is_internal() {
        let path = h.path();
        let (nr, nc) = (h.nrows(), h.ncols());
        return match &mut h.kind {
            Kind::Dense(d) => T::ldlt(d.tile.view_mut()).map_err(|err| Error::Singular {
                path,
                pivot: err.info.max(0) as usize,
            }),
            Kind::Rk(_) => Err(invalid_diag(nr, nc)),
            Kind::Internal(_) => unreachable!(),
        };
    }
    let n = diag_children(h);
    for k in 0..n {
        let Kind::Internal(grid) = &mut h.kind else { unreachable!() };
        let Some(mut diag) = grid.take(k, k) else { continue };
        ldlt_recurse(&mut diag, settings)?;
        let mut d = vec![T::zero(); diag.nrows()];
        diag.extract_diagonal(&mut d);

        // l_ik d l_kk^t = h_ik
        for i in (k + 1)..n {
            if let Some(target) = grid.cell_mut(i, k) {
                trsm_h(&diag, Part::UnitLower, true, Side::Right, target, settings)?;
                target.scale_by_diag_in_place(&d, true);
            }
        }
        // trailing lower triangle: h_ij -= l_ik d l_jk^t; the i = j case is
        // the symmetric diagonal update
        for j in (k + 1)..n {
            for i in j..n {
                let Some(mut target) = grid.take(i, j) else { continue };
                if let (Some(li), Some(lj)) = (grid.cell(i, k), grid.cell(j, k)) {
                    let scaled = li.scaled_by_diag(&d, false);
                    gemm(
                        T::neg_one(),
                        &scaled,
                        false,
                        lj,
                        true,
                        T::one(),
                        &mut target,
                        settings,
                    )?;
                }
                grid.put(i, j, Some(target));
            }
        }
        grid.put(k, k, Some(diag));
    }
    Ok(())
}

/// Which factorization a `Factorization` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorKind {
    Lu,
    Ldlt,
    Llt,
}

/// A factored copy of an `HMatrix`, ready to solve right-hand sides in the
/// permuted DoF ordering.
#[derive(Debug, Clone)]
pub struct Factorization<T: Kernel> {
    h: HMatrix<T>,
    kind: FactorKind,
    diag: Option<Vec<T>>,
}

impl<T: Kernel> Factorization<T> {
    pub fn lu(h: &HMatrix<T>, settings: &Settings) -> Result<Self> {
        let mut factored = h.clone();
        factored.lu_in_place(settings)?;
        Ok(Factorization {
            h: factored,
            kind: FactorKind::Lu,
            diag: None,
        })
    }

    pub fn ldlt(h: &HMatrix<T>, settings: &Settings) -> Result<Self> {
        let mut factored = h.clone();
        factored.ldlt_in_place(settings)?;
        let mut diag = vec![T::zero(); factored.nrows()];
        factored.extract_diagonal(&mut diag);
        Ok(Factorization {
            h: factored,
            kind: FactorKind::Ldlt,
            diag: Some(diag),
        })
    }

    pub fn llt(h: &HMatrix<T>, settings: &Settings) -> Result<Self> {
        let mut factored = h.clone();
        factored.llt_in_place(settings)?;
        Ok(Factorization {
            h: factored,
            kind: FactorKind::Llt,
            diag: None,
        })
    }

    /// Picks the factorization from the settings: `use_ldlt` wins over
    /// `use_lu`, neither means Cholesky.
    pub fn auto(h: &HMatrix<T>, settings: &Settings) -> Result<Self> {
        if settings.use_ldlt {
            Self::ldlt(h, settings)
        } else if settings.use_lu {
            Self::lu(h, settings)
        } else {
            Self::llt(h, settings)
        }
    }

    pub fn kind(&self) -> FactorKind {
        self.kind
    }

    pub fn matrix(&self) -> &HMatrix<T> {
        &self.h
    }

    /// Solves `a x = rhs` in place for one or many right-hand sides given in
    /// the permuted DoF ordering.
    pub fn solve(&self, rhs: &mut ScalarArray<T>) -> Result<()> {
        if rhs.rows() != self.h.nrows() {
            return Err(Error::InvalidShape {
                rows: rhs.rows(),
                cols: rhs.cols(),
                expected_rows: self.h.nrows(),
                expected_cols: rhs.cols(),
            });
        }
        match self.kind {
            FactorKind::Lu => {
                solve_triangular_dense(
                    &self.h,
                    Part::UnitLower,
                    false,
                    Side::Left,
                    rhs.view_mut(),
                )?;
                solve_triangular_dense(&self.h, Part::Upper, false, Side::Left, rhs.view_mut())
            }
            FactorKind::Llt => {
                solve_triangular_dense(&self.h, Part::Lower, false, Side::Left, rhs.view_mut())?;
                solve_triangular_dense(&self.h, Part::Lower, true, Side::Left, rhs.view_mut())
            }
            FactorKind::Ldlt => {
                solve_triangular_dense(
                    &self.h,
                    Part::UnitLower,
                    false,
                    Side::Left,
                    rhs.view_mut(),
                )?;
                let d = self.diag.as_ref().expect("ldlt keeps its diagonal");
                for j in 0..rhs.cols() {
                    for i in 0..rhs.rows() {
                        rhs[(i, j)] = rhs[(i, j)] / d[i];
                    }
                }
                solve_triangular_dense(
                    &self.h,
                    Part::UnitLower,
                    true,
                    Side::Left,
                    rhs.view_mut(),
                )
            }
        }
    }
}
