//! The `ClusterTree` is the geometric spine of the engine. It provides a
//! divisive binary partition of a DoF point cloud such that every cluster
//! covers a contiguous index range in the permuted ordering.
//!
//! Clusters are named in the same way as nodes in a Huffman tree. The root
//! is named "1". A left child appends a "0" to the name of the parent and a
//! right child appends a "1".

use std::sync::Arc;

use bitvec::prelude::*;
use ndarray::{Array2, ArrayView2};

use crate::constants::ANISOTROPY_RATIO;
use crate::core::dense::ScalarArray;
use crate::core::scalar::Scalar;
use crate::executor::TaskExecutor;
use crate::settings::{Settings, SplitStrategy};
use crate::utils::helpers;

/// Axis-aligned bounding box in d dimensions, inflated by per-DoF radii
/// where those are given.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    min: Vec<f64>,
    max: Vec<f64>,
}

impl BoundingBox {
    fn empty(dim: usize) -> Self {
        BoundingBox {
            min: vec![f64::INFINITY; dim],
            max: vec![f64::NEG_INFINITY; dim],
        }
    }

    fn include(&mut self, point: ArrayView2<'_, f64>, index: usize, radius: f64) {
        for axis in 0..self.min.len() {
            let c = point[[index, axis]];
            self.min[axis] = self.min[axis].min(c - radius);
            self.max[axis] = self.max[axis].max(c + radius);
        }
    }

    pub fn dim(&self) -> usize {
        self.min.len()
    }

    pub fn min(&self, axis: usize) -> f64 {
        self.min[axis]
    }

    pub fn max(&self, axis: usize) -> f64 {
        self.max[axis]
    }

    pub fn extent(&self, axis: usize) -> f64 {
        (self.max[axis] - self.min[axis]).max(0.0)
    }

    fn extents(&self) -> Vec<f64> {
        (0..self.dim()).map(|a| self.extent(a)).collect()
    }

    fn longest_axis(&self) -> usize {
        helpers::arg_max(&self.extents()).0
    }

    fn shortest_extent(&self) -> f64 {
        helpers::arg_min(&self.extents()).1
    }

    /// Euclidean norm of the box diagonal.
    pub fn diameter(&self) -> f64 {
        (0..self.dim()).map(|a| self.extent(a).powi(2)).sum::<f64>().sqrt()
    }

    /// Euclidean distance between two boxes; zero if they overlap.
    pub fn distance_to(&self, other: &BoundingBox) -> f64 {
        let mut acc = 0.0;
        for axis in 0..self.dim() {
            let gap = (self.min[axis] - other.max[axis]).max(other.min[axis] - self.max[axis]);
            if gap > 0.0 {
                acc += gap * gap;
            }
        }
        acc.sqrt()
    }
}

/// A node of the cluster tree: a contiguous range `[begin, end)` of the
/// permuted DoF ordering with its geometric metadata.
#[derive(Debug)]
pub struct ClusterNode {
    begin: usize,
    end: usize,
    bbox: BoundingBox,
    history: BitVec,
    children: Option<[Arc<ClusterNode>; 2]>,
}

impl PartialEq for ClusterNode {
    fn eq(&self, other: &Self) -> bool {
        self.history == other.history
    }
}

impl Eq for ClusterNode {}

impl std::fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl ClusterNode {
    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// The index range in the permuted ordering.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.begin..self.end
    }

    /// The number of DoFs in this cluster.
    pub fn size(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn diameter(&self) -> f64 {
        self.bbox.diameter()
    }

    pub fn distance_to(&self, other: &ClusterNode) -> f64 {
        self.bbox.distance_to(&other.bbox)
    }

    /// The number of parent-child hops from the root to this node.
    pub fn depth(&self) -> usize {
        self.history.len() - 1
    }

    /// The name of the node as a hex string.
    pub fn name(&self) -> String {
        let d = self.history.len();
        let padding = if d % 4 == 0 { 0 } else { 4 - d % 4 };
        let bin_name = (0..padding)
            .map(|_| "0")
            .chain(self.history.iter().map(|b| if *b { "1" } else { "0" }))
            .collect::<Vec<_>>();
        bin_name
            .chunks_exact(4)
            .map(|s| {
                let [a, b, c, d] = [s[0], s[1], s[2], s[3]];
                let s = format!("{a}{b}{c}{d}");
                let s = u8::from_str_radix(&s, 2).unwrap();
                format!("{s:01x}")
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Whether this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// A 2-slice of references to the left and right child nodes.
    pub fn children(&self) -> Option<[&Arc<ClusterNode>; 2]> {
        self.children.as_ref().map(|[l, r]| [l, r])
    }

    /// The maximum depth of any leaf under this node.
    pub fn max_leaf_depth(&self) -> usize {
        match &self.children {
            None => self.depth(),
            Some([l, r]) => l.max_leaf_depth().max(r.max_leaf_depth()),
        }
    }

    /// The number of descendants, excluding this node.
    pub fn num_descendants(&self) -> usize {
        match &self.children {
            None => 0,
            Some([l, r]) => 2 + l.num_descendants() + r.num_descendants(),
        }
    }
}

/// A binary cluster tree over a DoF point cloud, owning the coordinates and
/// the permutation it induced. Nodes are shared into block trees by `Arc`.
#[derive(Debug)]
pub struct ClusterTree {
    root: Arc<ClusterNode>,
    permutation: Vec<usize>,
    coords: Array2<f64>,
    radii: Option<Vec<f64>>,
}

impl ClusterTree {
    /// Builds the tree on the calling thread.
    ///
    /// `coords` holds one point per row; `radii`, when given, inflate the
    /// bounding boxes by a per-DoF influence radius.
    pub fn build(coords: Array2<f64>, radii: Option<Vec<f64>>, settings: &Settings) -> Self {
        Self::build_with(coords, radii, settings, &crate::executor::Sequential)
    }

    /// Builds the tree, splitting independent subtrees through the executor.
    pub fn build_with<E: TaskExecutor>(
        coords: Array2<f64>,
        radii: Option<Vec<f64>>,
        settings: &Settings,
        executor: &E,
    ) -> Self {
        let n = coords.nrows();
        if let Some(r) = &radii {
            assert_eq!(r.len(), n, "one radius per point");
        }
        let mut permutation: Vec<usize> = (0..n).collect();
        let builder = TreeBuilder {
            coords: coords.view(),
            radii: radii.as_deref(),
            strategy: settings.clustering,
            max_leaf_size: settings.max_leaf_size.max(1),
        };
        let root = builder.split(&mut permutation, 0, bitvec![1], executor);
        ClusterTree {
            root: Arc::new(root),
            permutation,
            coords,
            radii,
        }
    }

    pub fn root(&self) -> &Arc<ClusterNode> {
        &self.root
    }

    /// The number of DoFs.
    pub fn cardinality(&self) -> usize {
        self.permutation.len()
    }

    /// Original index of each permuted position.
    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    /// Maps a permuted position to its original DoF index.
    pub fn to_original(&self, permuted: usize) -> usize {
        self.permutation[permuted]
    }

    pub fn coords(&self) -> ArrayView2<'_, f64> {
        self.coords.view()
    }

    pub fn radii(&self) -> Option<&[f64]> {
        self.radii.as_deref()
    }

    /// Reorders the rows of `x` (original ordering) into permuted order.
    pub fn permute_rows<T: Scalar>(&self, x: &ScalarArray<T>) -> ScalarArray<T> {
        debug_assert_eq!(x.rows(), self.cardinality());
        ScalarArray::from_fn(x.rows(), x.cols(), |i, j| x[(self.permutation[i], j)])
    }

    /// Inverse of `permute_rows`.
    pub fn unpermute_rows<T: Scalar>(&self, x: &ScalarArray<T>) -> ScalarArray<T> {
        debug_assert_eq!(x.rows(), self.cardinality());
        let mut out = ScalarArray::zeros(x.rows(), x.cols());
        for j in 0..x.cols() {
            for i in 0..x.rows() {
                out[(self.permutation[i], j)] = x[(i, j)];
            }
        }
        out
    }
}

struct TreeBuilder<'a> {
    coords: ArrayView2<'a, f64>,
    radii: Option<&'a [f64]>,
    strategy: SplitStrategy,
    max_leaf_size: usize,
}

impl<'a> TreeBuilder<'a> {
    fn bbox_of(&self, indices: &[usize]) -> BoundingBox {
        let mut bbox = BoundingBox::empty(self.coords.ncols());
        for &i in indices {
            let radius = self.radii.map_or(0.0, |r| r[i]);
            bbox.include(self.coords, i, radius);
        }
        if indices.is_empty() {
            for axis in 0..bbox.dim() {
                bbox.min[axis] = 0.0;
                bbox.max[axis] = 0.0;
            }
        }
        bbox
    }

    /// Recursively splits `indices` (a sub-slice of the permutation starting
    /// at permuted position `offset`) and returns the finished node.
    fn split<E: TaskExecutor>(
        &self,
        indices: &mut [usize],
        offset: usize,
        history: BitVec,
        executor: &E,
    ) -> ClusterNode {
        let size = indices.len();
        let bbox = self.bbox_of(indices);
        let leaf = ClusterNode {
            begin: offset,
            end: offset + size,
            bbox: bbox.clone(),
            history: history.clone(),
            children: None,
        };
        if size <= self.max_leaf_size {
            return leaf;
        }
        let axis = bbox.longest_axis();
        let extent = bbox.extent(axis);
        if extent == 0.0 {
            // coincident points: a single leaf regardless of size
            return leaf;
        }

        indices.sort_unstable_by(|&a, &b| {
            self.coords[[a, axis]]
                .partial_cmp(&self.coords[[b, axis]])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let use_geometric = match self.strategy {
            SplitStrategy::Geometric => true,
            SplitStrategy::Median => false,
            SplitStrategy::Hybrid => {
                let shortest = bbox.shortest_extent();
                shortest == 0.0 || extent / shortest >= ANISOTROPY_RATIO
            }
        };
        let split_at = if use_geometric {
            let mid = bbox.min(axis) + extent / 2.0;
            indices
                .iter()
                .position(|&i| self.coords[[i, axis]] > mid)
                .unwrap_or(size)
                .clamp(1, size - 1)
        } else {
            (size / 2).clamp(1, size - 1)
        };

        let (left_indices, right_indices) = indices.split_at_mut(split_at);
        let left_history = {
            let mut h = history.clone();
            h.push(false);
            h
        };
        let right_history = {
            let mut h = history.clone();
            h.push(true);
            h
        };
        let (left, right) = executor.join(
            || self.split(left_indices, offset, left_history, executor),
            || self.split(right_indices, offset + split_at, right_history, executor),
        );
        ClusterNode {
            begin: offset,
            end: offset + size,
            bbox,
            history,
            children: Some([Arc::new(left), Arc::new(right)]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Threaded;
    use float_cmp::approx_eq;

    fn line_points(n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, 3), |(i, axis)| if axis == 0 { i as f64 } else { 0.0 })
    }

    #[test]
    fn sixteen_points_on_a_line() {
        let settings = Settings::default()
            .with_max_leaf_size(4)
            .with_clustering(SplitStrategy::Median);
        let tree = ClusterTree::build(line_points(16), None, &settings);
        let root = tree.root();

        assert_eq!(root.size(), 16);
        // three levels: root, two halves, four leaves
        assert_eq!(root.max_leaf_depth(), 2);
        assert_eq!(root.num_descendants(), 6);
        assert_eq!(format!("{root}"), "1");
        assert!(approx_eq!(f64, root.diameter(), 15.0));

        // four leaves of size four, contiguous ranges
        let mut leaves = Vec::new();
        fn collect<'a>(node: &'a ClusterNode, out: &mut Vec<&'a ClusterNode>) {
            match node.children() {
                None => out.push(node),
                Some([l, r]) => {
                    collect(l, out);
                    collect(r, out);
                }
            }
        }
        collect(root, &mut leaves);
        assert_eq!(leaves.len(), 4);
        for (k, leaf) in leaves.iter().enumerate() {
            assert_eq!(leaf.size(), 4);
            assert_eq!(leaf.range(), 4 * k..4 * (k + 1));
        }

        // the (0..4, 12..16) pair is admissible for eta = 2
        let first = leaves[0];
        let last = leaves[3];
        let dist = first.distance_to(last);
        assert!(approx_eq!(f64, dist, 9.0));
        assert!(first.diameter().min(last.diameter()) <= 2.0 * dist);
    }

    #[test]
    fn children_partition_the_parent() {
        let settings = Settings::default().with_max_leaf_size(3);
        let coords = Array2::from_shape_fn((37, 2), |(i, j)| ((i * 7 + j * 3) % 13) as f64);
        let tree = ClusterTree::build_with(coords, None, &settings, &Threaded);

        fn check(node: &ClusterNode) {
            if let Some([l, r]) = node.children() {
                assert_eq!(l.begin(), node.begin());
                assert_eq!(l.end(), r.begin());
                assert_eq!(r.end(), node.end());
                assert!(!l.is_empty() && !r.is_empty());
                check(l);
                check(r);
            }
        }
        check(tree.root());

        // the permutation is a bijection
        use itertools::Itertools;
        let sorted: Vec<usize> = tree.permutation().iter().copied().sorted().collect();
        assert_eq!(sorted, (0..tree.cardinality()).collect::<Vec<_>>());
    }

    #[test]
    fn coincident_points_make_a_single_leaf() {
        let settings = Settings::default().with_max_leaf_size(2);
        let coords = Array2::from_elem((9, 3), 1.5);
        let tree = ClusterTree::build(coords, None, &settings);
        assert!(tree.root().is_leaf());
        assert_eq!(tree.root().size(), 9);
        assert_eq!(tree.root().diameter(), 0.0);
    }

    #[test]
    fn empty_and_singleton_inputs() {
        let settings = Settings::default();
        let empty = ClusterTree::build(Array2::zeros((0, 3)), None, &settings);
        assert!(empty.root().is_leaf());
        assert!(empty.root().is_empty());

        let single = ClusterTree::build(Array2::zeros((1, 3)), None, &settings);
        assert!(single.root().is_leaf());
        assert_eq!(single.root().size(), 1);
    }

    #[test]
    fn radii_inflate_the_boxes() {
        let settings = Settings::default();
        let coords = line_points(4);
        let tree = ClusterTree::build(coords, Some(vec![0.5; 4]), &settings);
        let bbox = tree.root().bbox();
        assert!(approx_eq!(f64, bbox.min(0), -0.5));
        assert!(approx_eq!(f64, bbox.max(0), 3.5));
    }

    #[test]
    fn geometric_split_respects_the_midpoint() {
        // 3 points left of the midpoint, 9 to the right: geometric splits
        // unevenly, median splits in half
        let mut coords = Array2::zeros((12, 1));
        for i in 0..3 {
            coords[[i, 0]] = i as f64;
        }
        for i in 3..12 {
            coords[[i, 0]] = 90.0 + i as f64;
        }
        let geo = ClusterTree::build(
            coords.clone(),
            None,
            &Settings::default()
                .with_max_leaf_size(4)
                .with_clustering(SplitStrategy::Geometric),
        );
        let [l, r] = geo.root().children().unwrap();
        assert_eq!(l.size(), 3);
        assert_eq!(r.size(), 9);

        let med = ClusterTree::build(
            coords,
            None,
            &Settings::default()
                .with_max_leaf_size(4)
                .with_clustering(SplitStrategy::Median),
        );
        let [l, r] = med.root().children().unwrap();
        assert_eq!(l.size(), 6);
        assert_eq!(r.size(), 6);
    }
}
