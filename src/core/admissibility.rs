//! Admissibility predicates decide, for a (rowCluster, colCluster) pair,
//! whether the block is compressible or must be subdivided, possibly along
//! one axis only.

use crate::constants::TALL_SKINNY_RATIO;
use crate::core::cluster::ClusterNode;
use crate::settings::Settings;

/// Verdict for a cluster pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// The block is compressible as a low-rank product.
    Admissible,
    /// The block must be subdivided along the indicated axes. Axes that are
    /// leaves in the cluster tree cannot be subdivided; a pair where no
    /// requested axis is splittable becomes a dense leaf.
    Subdivide { rows: bool, cols: bool },
}

/// The predicate contract: pure, reusable across the whole block tree.
pub trait Admissibility: std::fmt::Debug + Send + Sync {
    fn check(&self, rows: &ClusterNode, cols: &ClusterNode) -> Acceptance;
}

/// The standard criterion:
/// `min(diam(r), diam(c)) <= eta * dist(r, c)` with a cap on the element
/// count per admissible block.
#[derive(Debug, Clone)]
pub struct Hackbusch {
    pub eta: f64,
    pub max_elements: usize,
}

impl Hackbusch {
    pub fn from_settings(settings: &Settings) -> Self {
        Hackbusch {
            eta: settings.eta,
            max_elements: settings.max_elements_per_block,
        }
    }
}

impl Admissibility for Hackbusch {
    fn check(&self, rows: &ClusterNode, cols: &ClusterNode) -> Acceptance {
        let dist = rows.distance_to(cols);
        let diam = rows.diameter().min(cols.diameter());
        let small_enough = rows.size() * cols.size() <= self.max_elements;
        if small_enough && diam <= self.eta * dist {
            Acceptance::Admissible
        } else {
            Acceptance::Subdivide {
                rows: true,
                cols: true,
            }
        }
    }
}

/// Forces admissibility of every sufficiently small block, regardless of
/// geometry. Useful for algebraic operators and for tests.
#[derive(Debug, Clone)]
pub struct Always {
    pub max_elements: usize,
}

impl Admissibility for Always {
    fn check(&self, rows: &ClusterNode, cols: &ClusterNode) -> Acceptance {
        if rows.size() * cols.size() <= self.max_elements {
            Acceptance::Admissible
        } else {
            Acceptance::Subdivide {
                rows: true,
                cols: true,
            }
        }
    }
}

/// Wraps a standard predicate with a size-ratio guard: a strongly
/// rectangular pair is subdivided along its long axis only, producing
/// tall-skinny blocks instead of forcing both axes down.
#[derive(Debug, Clone)]
pub struct TallSkinny<A> {
    pub inner: A,
    pub ratio: f64,
}

impl<A: Admissibility> TallSkinny<A> {
    pub fn new(inner: A) -> Self {
        TallSkinny {
            inner,
            ratio: TALL_SKINNY_RATIO,
        }
    }
}

impl<A: Admissibility> Admissibility for TallSkinny<A> {
    fn check(&self, rows: &ClusterNode, cols: &ClusterNode) -> Acceptance {
        let nr = rows.size() as f64;
        let nc = cols.size() as f64;
        let rows_ok = nr <= self.ratio * nc;
        let cols_ok = nc <= self.ratio * nr;
        if rows_ok && cols_ok {
            self.inner.check(rows, cols)
        } else {
            // subdivide only the offending axis
            Acceptance::Subdivide {
                rows: !rows_ok,
                cols: !cols_ok,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cluster::ClusterTree;
    use crate::settings::{Settings, SplitStrategy};
    use ndarray::Array2;

    fn line_tree(n: usize, leaf: usize) -> ClusterTree {
        let coords =
            Array2::from_shape_fn((n, 3), |(i, axis)| if axis == 0 { i as f64 } else { 0.0 });
        let settings = Settings::default()
            .with_max_leaf_size(leaf)
            .with_clustering(SplitStrategy::Median);
        ClusterTree::build(coords, None, &settings)
    }

    #[test]
    fn far_blocks_are_admissible_near_blocks_are_not() {
        let tree = line_tree(16, 4);
        let root = tree.root();
        let [left, right] = root.children().unwrap();
        let [ll, _] = left.children().unwrap();
        let [_, rr] = right.children().unwrap();

        let adm = Hackbusch {
            eta: 2.0,
            max_elements: 1_000_000,
        };
        // (0..4, 12..16): diam 3, dist 9
        assert_eq!(adm.check(ll, rr), Acceptance::Admissible);
        // a block against itself touches: never admissible
        assert_eq!(
            adm.check(ll, ll),
            Acceptance::Subdivide {
                rows: true,
                cols: true
            }
        );
    }

    #[test]
    fn element_cap_blocks_admissibility() {
        let tree = line_tree(16, 4);
        let root = tree.root();
        let [left, right] = root.children().unwrap();
        let [ll, _] = left.children().unwrap();
        let [_, rr] = right.children().unwrap();
        let adm = Hackbusch {
            eta: 2.0,
            max_elements: 8,
        };
        assert_eq!(
            adm.check(ll, rr),
            Acceptance::Subdivide {
                rows: true,
                cols: true
            }
        );
    }

    #[test]
    fn tall_skinny_splits_one_axis() {
        let big = line_tree(64, 4);
        let small = line_tree(4, 4);
        let adm = TallSkinny::new(Always {
            max_elements: 1_000_000,
        });
        // 64 rows against 4 cols: only the row axis is subdivided
        assert_eq!(
            adm.check(big.root(), small.root()),
            Acceptance::Subdivide {
                rows: true,
                cols: false
            }
        );
        assert_eq!(
            adm.check(small.root(), big.root()),
            Acceptance::Subdivide {
                rows: false,
                cols: true
            }
        );
        // balanced pairs fall through to the inner predicate
        assert_eq!(adm.check(small.root(), small.root()), Acceptance::Admissible);
    }
}
