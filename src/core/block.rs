//! The block tree. An `HMatrix` node is either `Internal` (a grid of child
//! blocks), a `Dense` leaf, or a low-rank `Rk` leaf.
//!
//! Every node's shape equals the sizes of its (row, col) cluster pair;
//! cluster nodes are shared into the block tree as `Arc` clones and outlive
//! every matrix built over them. Factorizations overwrite nodes in place;
//! LU pivots live next to the dense leaf that produced them.

use std::sync::Arc;

use ndarray::{ArrayView2, ArrayViewMut2};
use num_traits::{Float, One, Zero};

use crate::core::admissibility::{Acceptance, Admissibility};
use crate::core::cluster::ClusterNode;
use crate::core::dense::ScalarArray;
use crate::core::kernel::Kernel;
use crate::core::rk::RkMatrix;
use crate::core::scalar::Scalar;
use crate::error::{BlockPath, Result};
use crate::settings::Settings;

/// Dense leaf payload: the tile, plus the pivots of its LU factorization
/// once one ran.
#[derive(Debug, Clone)]
pub(crate) struct DenseBlock<T: Scalar> {
    pub tile: ScalarArray<T>,
    pub pivots: Option<Vec<usize>>,
}

impl<T: Scalar> DenseBlock<T> {
    pub fn new(tile: ScalarArray<T>) -> Self {
        DenseBlock { tile, pivots: None }
    }
}

/// Child grid of an internal node, stored column-major. Degenerate 1x2 and
/// 2x1 grids arise from single-axis (tall-skinny) subdivision.
#[derive(Debug, Clone)]
pub(crate) struct Grid<T: Kernel> {
    row_clusters: Vec<Arc<ClusterNode>>,
    col_clusters: Vec<Arc<ClusterNode>>,
    cells: Vec<Option<Box<HMatrix<T>>>>,
}

impl<T: Kernel> Grid<T> {
    pub fn nrows(&self) -> usize {
        self.row_clusters.len()
    }

    pub fn ncols(&self) -> usize {
        self.col_clusters.len()
    }

    pub fn row_cluster(&self, i: usize) -> &Arc<ClusterNode> {
        &self.row_clusters[i]
    }

    pub fn col_cluster(&self, j: usize) -> &Arc<ClusterNode> {
        &self.col_clusters[j]
    }

    pub fn row_clusters(&self) -> &[Arc<ClusterNode>] {
        &self.row_clusters
    }

    pub fn col_clusters(&self) -> &[Arc<ClusterNode>] {
        &self.col_clusters
    }

    pub fn cell(&self, i: usize, j: usize) -> Option<&HMatrix<T>> {
        self.cells[i + j * self.nrows()].as_deref()
    }

    pub fn cell_mut(&mut self, i: usize, j: usize) -> Option<&mut HMatrix<T>> {
        let nr = self.nrows();
        self.cells[i + j * nr].as_deref_mut()
    }

    /// Removes a cell so it can be mutated while its siblings are read.
    pub fn take(&mut self, i: usize, j: usize) -> Option<Box<HMatrix<T>>> {
        let nr = self.nrows();
        self.cells[i + j * nr].take()
    }

    pub fn put(&mut self, i: usize, j: usize, cell: Option<Box<HMatrix<T>>>) {
        let nr = self.nrows();
        self.cells[i + j * nr] = cell;
    }

    pub fn cells_mut(&mut self) -> impl Iterator<Item = &mut HMatrix<T>> {
        self.cells.iter_mut().filter_map(|c| c.as_deref_mut())
    }

    /// Raw cell storage, for split-and-join parallel walks.
    pub fn cells_slice_mut(&mut self) -> &mut [Option<Box<HMatrix<T>>>] {
        &mut self.cells
    }

    pub fn cells(&self) -> impl Iterator<Item = &HMatrix<T>> {
        self.cells.iter().filter_map(|c| c.as_deref())
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Kind<T: Kernel> {
    Internal(Grid<T>),
    Dense(DenseBlock<T>),
    Rk(RkMatrix<T>),
}

/// A hierarchical matrix over a (row, col) cluster pair.
#[derive(Debug, Clone)]
pub struct HMatrix<T: Kernel> {
    rows: Arc<ClusterNode>,
    cols: Arc<ClusterNode>,
    pub(crate) kind: Kind<T>,
}

/// Index range of `child` relative to the start of `parent`.
pub(crate) fn relative_range(child: &ClusterNode, parent: &ClusterNode) -> std::ops::Range<usize> {
    debug_assert!(child.begin() >= parent.begin() && child.end() <= parent.end());
    child.begin() - parent.begin()..child.end() - parent.begin()
}

impl<T: Kernel> HMatrix<T> {
    /// Builds the uninitialized block-tree skeleton for a cluster pair:
    /// admissible pairs become (empty) low-rank leaves, small or
    /// unsplittable pairs dense leaves, everything else recurses.
    pub fn build_skeleton(
        rows: &Arc<ClusterNode>,
        cols: &Arc<ClusterNode>,
        admissibility: &dyn Admissibility,
        settings: &Settings,
    ) -> Self {
        let kind = Self::skeleton_kind(rows, cols, admissibility, settings);
        HMatrix {
            rows: rows.clone(),
            cols: cols.clone(),
            kind,
        }
    }

    fn skeleton_kind(
        rows: &Arc<ClusterNode>,
        cols: &Arc<ClusterNode>,
        admissibility: &dyn Admissibility,
        settings: &Settings,
    ) -> Kind<T> {
        let (m, n) = (rows.size(), cols.size());
        if m == 0 || n == 0 {
            return Kind::Dense(DenseBlock::new(ScalarArray::zeros(m, n)));
        }
        let dense_leaf = || Kind::Dense(DenseBlock::new(ScalarArray::zeros(m, n)));
        match admissibility.check(rows, cols) {
            Acceptance::Admissible => {
                if m.min(n) < settings.compression_min_leaf_size {
                    // too small to compress profitably
                    dense_leaf()
                } else {
                    Kind::Rk(RkMatrix::zero(m, n))
                }
            }
            Acceptance::Subdivide {
                rows: want_rows,
                cols: want_cols,
            } => {
                let can_rows = !rows.is_leaf();
                let can_cols = !cols.is_leaf();
                let (split_rows, split_cols) = if want_rows && want_cols {
                    // a symmetric subdivision stops at the first leaf axis
                    if can_rows && can_cols {
                        (true, true)
                    } else {
                        (false, false)
                    }
                } else {
                    (want_rows && can_rows, want_cols && can_cols)
                };
                if !split_rows && !split_cols {
                    return dense_leaf();
                }
                let row_clusters: Vec<Arc<ClusterNode>> = if split_rows {
                    let [l, r] = rows.children().expect("splittable row cluster");
                    vec![l.clone(), r.clone()]
                } else {
                    vec![rows.clone()]
                };
                let col_clusters: Vec<Arc<ClusterNode>> = if split_cols {
                    let [l, r] = cols.children().expect("splittable col cluster");
                    vec![l.clone(), r.clone()]
                } else {
                    vec![cols.clone()]
                };
                let mut cells = Vec::with_capacity(row_clusters.len() * col_clusters.len());
                for cc in &col_clusters {
                    for rc in &row_clusters {
                        if rc.is_empty() || cc.is_empty() {
                            cells.push(None);
                        } else {
                            cells.push(Some(Box::new(Self::build_skeleton(
                                rc,
                                cc,
                                admissibility,
                                settings,
                            ))));
                        }
                    }
                }
                Kind::Internal(Grid {
                    row_clusters,
                    col_clusters,
                    cells,
                })
            }
        }
    }

    /// Wraps an existing dense tile as a single-leaf matrix over the pair.
    pub fn from_dense(rows: &Arc<ClusterNode>, cols: &Arc<ClusterNode>, tile: ScalarArray<T>) -> Self {
        assert_eq!(tile.rows(), rows.size());
        assert_eq!(tile.cols(), cols.size());
        HMatrix {
            rows: rows.clone(),
            cols: cols.clone(),
            kind: Kind::Dense(DenseBlock::new(tile)),
        }
    }

    pub fn rows(&self) -> &Arc<ClusterNode> {
        &self.rows
    }

    pub fn cols(&self) -> &Arc<ClusterNode> {
        &self.cols
    }

    pub fn nrows(&self) -> usize {
        self.rows.size()
    }

    pub fn ncols(&self) -> usize {
        self.cols.size()
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.kind, Kind::Internal(_))
    }

    pub fn is_dense_leaf(&self) -> bool {
        matches!(self.kind, Kind::Dense(_))
    }

    pub fn is_rk_leaf(&self) -> bool {
        matches!(self.kind, Kind::Rk(_))
    }

    pub(crate) fn path(&self) -> BlockPath {
        BlockPath {
            rows: self.rows.name(),
            cols: self.cols.name(),
        }
    }

    /// `y <- alpha * op(self) * x + beta * y` for a dense `x`.
    pub fn apply(
        &self,
        alpha: T,
        trans: bool,
        x: ArrayView2<'_, T>,
        beta: T,
        mut y: ArrayViewMut2<'_, T>,
    ) {
        let (ym, xm) = if trans {
            (self.ncols(), self.nrows())
        } else {
            (self.nrows(), self.ncols())
        };
        debug_assert_eq!(x.nrows(), xm);
        debug_assert_eq!(y.nrows(), ym);
        debug_assert_eq!(x.ncols(), y.ncols());
        if beta == T::zero() {
            y.fill(T::zero());
        } else if beta != T::one() {
            y.mapv_inplace(|v| v * beta);
        }
        self.apply_acc(alpha, trans, x, &mut y);
    }

    fn apply_acc(
        &self,
        alpha: T,
        trans: bool,
        x: ArrayView2<'_, T>,
        y: &mut ArrayViewMut2<'_, T>,
    ) {
        match &self.kind {
            Kind::Dense(d) => {
                let av = if trans {
                    d.tile.view().reversed_axes()
                } else {
                    d.tile.view()
                };
                T::gemm(alpha, av, x, T::one(), y.view_mut());
            }
            Kind::Rk(rk) => rk.apply(alpha, trans, x, T::one(), y.view_mut()),
            Kind::Internal(grid) => {
                for j in 0..grid.ncols() {
                    for i in 0..grid.nrows() {
                        let Some(child) = grid.cell(i, j) else { continue };
                        let (x_range, y_range) = if trans {
                            (
                                relative_range(&child.rows, &self.rows),
                                relative_range(&child.cols, &self.cols),
                            )
                        } else {
                            (
                                relative_range(&child.cols, &self.cols),
                                relative_range(&child.rows, &self.rows),
                            )
                        };
                        let xs = x.slice(ndarray::s![x_range, ..]);
                        let mut ys = y.slice_mut(ndarray::s![y_range, ..]);
                        child.apply_acc(alpha, trans, xs, &mut ys);
                    }
                }
            }
        }
    }

    /// Fully materializes the block.
    pub fn to_dense(&self) -> ScalarArray<T> {
        let mut out = ScalarArray::zeros(self.nrows(), self.ncols());
        self.add_into(&mut out.view_mut());
        out
    }

    pub(crate) fn add_into(&self, out: &mut ArrayViewMut2<'_, T>) {
        match &self.kind {
            Kind::Dense(d) => out.zip_mut_with(&d.tile.view(), |o, &t| *o = *o + t),
            Kind::Rk(rk) => {
                if !rk.is_zero() {
                    T::gemm(
                        T::one(),
                        rk.a().view(),
                        rk.b().view().reversed_axes(),
                        T::one(),
                        out.view_mut(),
                    );
                }
            }
            Kind::Internal(grid) => {
                for j in 0..grid.ncols() {
                    for i in 0..grid.nrows() {
                        let Some(child) = grid.cell(i, j) else { continue };
                        let rr = relative_range(&child.rows, &self.rows);
                        let cr = relative_range(&child.cols, &self.cols);
                        let mut sub = out.slice_mut(ndarray::s![rr, cr]);
                        child.add_into(&mut sub);
                    }
                }
            }
        }
    }

    /// Re-imports a dense block into the existing structure: dense leaves
    /// copy, low-rank leaves recompress at `epsilon`.
    pub fn copy_from_dense(&mut self, x: ArrayView2<'_, T>, epsilon: T::Real) -> Result<()> {
        debug_assert_eq!(x.dim(), (self.nrows(), self.ncols()));
        let parent_rows = self.rows.clone();
        let parent_cols = self.cols.clone();
        match &mut self.kind {
            Kind::Dense(d) => {
                d.tile = ScalarArray::from_view(x);
                d.pivots = None;
                Ok(())
            }
            Kind::Rk(rk) => {
                *rk = crate::compression::svd_compress(x, epsilon)?;
                Ok(())
            }
            Kind::Internal(grid) => {
                for j in 0..grid.ncols() {
                    for i in 0..grid.nrows() {
                        if let Some(child) = grid.cell_mut(i, j) {
                            let rr = relative_range(&child.rows, &parent_rows);
                            let cr = relative_range(&child.cols, &parent_cols);
                            child.copy_from_dense(x.slice(ndarray::s![rr, cr]), epsilon)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Scales the whole block by `alpha`.
    pub fn scale(&mut self, alpha: T) {
        if alpha == T::one() {
            return;
        }
        match &mut self.kind {
            Kind::Dense(d) => d.tile.scale(alpha),
            Kind::Rk(rk) => rk.scale(alpha),
            Kind::Internal(grid) => {
                for cell in grid.cells_mut() {
                    cell.scale(alpha);
                }
            }
        }
    }

    /// Frobenius norm, exact: children cover disjoint index blocks.
    pub fn norm(&self) -> T::Real {
        self.norm_sqr().sqrt()
    }

    pub fn norm_sqr(&self) -> T::Real {
        match &self.kind {
            Kind::Dense(d) => d.tile.norm_sqr(),
            Kind::Rk(rk) => rk.norm_sqr(),
            Kind::Internal(grid) => grid
                .cells()
                .fold(T::Real::zero(), |acc, c| acc + c.norm_sqr()),
        }
    }

    /// Copies the diagonal into `out` (length `min(nrows, ncols)`).
    pub fn extract_diagonal(&self, out: &mut [T]) {
        match &self.kind {
            Kind::Dense(d) => {
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = d.tile[(i, i)];
                }
            }
            Kind::Rk(rk) => {
                for (i, slot) in out.iter_mut().enumerate() {
                    let mut acc = T::zero();
                    for k in 0..rk.rank() {
                        acc = acc + rk.a()[(i, k)] * rk.b()[(i, k)];
                    }
                    *slot = acc;
                }
            }
            Kind::Internal(grid) => {
                let d = grid.nrows().min(grid.ncols());
                for k in 0..d {
                    let Some(child) = grid.cell(k, k) else { continue };
                    let rr = relative_range(&child.rows, &self.rows);
                    child.extract_diagonal(&mut out[rr]);
                }
            }
        }
    }

    /// Column-scaled copy `self * diag(d)` (or `self * diag(d)^-1`).
    pub(crate) fn scaled_by_diag(&self, d: &[T], invert: bool) -> HMatrix<T> {
        debug_assert_eq!(d.len(), self.ncols());
        let mut out = self.clone();
        out.scale_by_diag_in_place(d, invert);
        out
    }

    /// Structure-preserving zero: dense leaves are cleared, low-rank leaves
    /// drop to rank zero, pivots are forgotten.
    pub(crate) fn set_zero(&mut self) {
        match &mut self.kind {
            Kind::Dense(d) => {
                d.tile.fill(T::zero());
                d.pivots = None;
            }
            Kind::Rk(rk) => *rk = RkMatrix::zero(rk.rows(), rk.cols()),
            Kind::Internal(grid) => {
                for cell in grid.cells_mut() {
                    cell.set_zero();
                }
            }
        }
    }

    pub(crate) fn scale_by_diag_in_place(&mut self, d: &[T], invert: bool) {
        let scale = |x: T, j: usize| if invert { x / d[j] } else { x * d[j] };
        match &mut self.kind {
            Kind::Dense(block) => {
                for j in 0..block.tile.cols() {
                    for i in 0..block.tile.rows() {
                        block.tile[(i, j)] = scale(block.tile[(i, j)], j);
                    }
                }
            }
            Kind::Rk(rk) => {
                let b = rk.b_mut();
                for k in 0..b.cols() {
                    for j in 0..b.rows() {
                        b[(j, k)] = scale(b[(j, k)], j);
                    }
                }
            }
            Kind::Internal(grid) => {
                let parent_begin = grid.col_clusters[0].begin();
                let offsets: Vec<usize> = grid
                    .col_clusters
                    .iter()
                    .map(|c| c.begin() - parent_begin)
                    .collect();
                let sizes: Vec<usize> = grid.col_clusters.iter().map(|c| c.size()).collect();
                for j in 0..offsets.len() {
                    let slice = &d[offsets[j]..offsets[j] + sizes[j]];
                    for i in 0..grid.row_clusters.len() {
                        if let Some(child) = grid.cell_mut(i, j) {
                            child.scale_by_diag_in_place(slice, invert);
                        }
                    }
                }
            }
        }
    }

    /// Panics at the first non-finite entry, naming the offending block.
    /// This is the opt-in NaN audit; precondition violations are
    /// assertion-class, not runtime errors.
    pub fn assert_finite(&self) {
        match &self.kind {
            Kind::Dense(d) => {
                if !d.tile.is_all_finite() {
                    panic!("non-finite value in dense block {}", self.path());
                }
            }
            Kind::Rk(rk) => {
                if !rk.is_all_finite() {
                    panic!("non-finite value in low-rank block {}", self.path());
                }
            }
            Kind::Internal(grid) => {
                for cell in grid.cells() {
                    cell.assert_finite();
                }
            }
        }
    }

    /// Scalar count actually stored.
    pub fn compressed_size(&self) -> usize {
        match &self.kind {
            Kind::Dense(d) => d.tile.rows() * d.tile.cols(),
            Kind::Rk(rk) => rk.storage(),
            Kind::Internal(grid) => grid.cells().map(|c| c.compressed_size()).sum(),
        }
    }

    /// Scalar count of the equivalent dense matrix.
    pub fn uncompressed_size(&self) -> usize {
        self.nrows() * self.ncols()
    }

    /// Structural invariants, exercised by tests: shapes match cluster
    /// sizes and child clusters tile their parents.
    pub fn check_structure(&self) -> bool {
        match &self.kind {
            Kind::Dense(d) => {
                d.tile.rows() == self.nrows() && d.tile.cols() == self.ncols()
            }
            Kind::Rk(rk) => rk.rows() == self.nrows() && rk.cols() == self.ncols(),
            Kind::Internal(grid) => {
                let rows_cover: usize = grid.row_clusters.iter().map(|c| c.size()).sum();
                let cols_cover: usize = grid.col_clusters.iter().map(|c| c.size()).sum();
                if rows_cover != self.nrows() || cols_cover != self.ncols() {
                    return false;
                }
                for j in 0..grid.ncols() {
                    for i in 0..grid.nrows() {
                        if let Some(child) = grid.cell(i, j) {
                            if !Arc::ptr_eq(&child.rows, grid.row_cluster(i))
                                || !Arc::ptr_eq(&child.cols, grid.col_cluster(j))
                                || !child.check_structure()
                            {
                                return false;
                            }
                        }
                    }
                }
                true
            }
        }
    }
}
