//! Explicit configuration for construction, assembly and algebra.
//!
//! A `Settings` value is threaded through every operation that needs one;
//! there is no process-wide state.

use serde::{Deserialize, Serialize};

/// How admissible leaves are compressed during assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionMethod {
    /// Truncated singular value decomposition of the fully assembled block.
    Svd,
    /// Adaptive cross approximation on the fully assembled block.
    AcaFull,
    /// Adaptive cross approximation driven by the element oracle only.
    AcaPartial,
    /// ACA-partial seeded with a full reference row and column.
    AcaPlus,
    /// No compression: admissible leaves become rank-zero blocks.
    RkNull,
}

/// Cluster-tree splitting strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitStrategy {
    /// Split the longest bounding-box axis at its geometric midpoint.
    Geometric,
    /// Split the longest axis at the median coordinate (balanced sizes).
    Median,
    /// Geometric while the box is sufficiently anisotropic, median otherwise.
    Hybrid,
}

/// Recognized options. Construct with `Settings::default()` and chain the
/// `with_*` methods for the handful of values most callers touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Target relative accuracy during assembly compression.
    pub assembly_epsilon: f64,
    /// Target relative accuracy during algebraic recompression.
    pub recompression_epsilon: f64,
    /// Compression kernel used for admissible leaves.
    pub compression: CompressionMethod,
    /// Cluster-tree splitting strategy.
    pub clustering: SplitStrategy,
    /// Clusters at or below this size are not split further.
    pub max_leaf_size: usize,
    /// Admissible blocks with either side below this size are stored dense.
    pub compression_min_leaf_size: usize,
    /// Upper bound on `|rows| * |cols|` for an admissible block.
    pub max_elements_per_block: usize,
    /// Admissibility parameter: `min(diam) <= eta * dist`.
    pub eta: f64,
    /// Merge all-low-rank sibling grids after assembly when it saves storage.
    pub coarsening: bool,
    /// Recompress low-rank blocks after formatted additions.
    pub recompress: bool,
    /// Compare every compressed leaf against its dense reference.
    pub validate_compression: bool,
    /// Relative error above which a validated leaf is rejected.
    pub validation_error_threshold: f64,
    /// Re-run a rejected leaf through SVD compression.
    pub validation_rerun: bool,
    /// Serialize rejected leaves next to the working directory.
    pub validation_dump: bool,
    /// Prefer LU for `Factorization::auto`.
    pub use_lu: bool,
    /// Prefer LDL^T for `Factorization::auto`; wins over `use_lu`.
    pub use_ldlt: bool,
    /// Panic on the first non-finite entry met after assembly.
    pub nan_audit: bool,
    /// Bound on the number of leaves assembled concurrently.
    pub max_parallel_leaves: usize,
    /// Seed for the stochastic parts of compression (ACA+ reference lines).
    pub seed: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            assembly_epsilon: 1e-4,
            recompression_epsilon: 1e-4,
            compression: CompressionMethod::AcaPlus,
            clustering: SplitStrategy::Median,
            max_leaf_size: 100,
            compression_min_leaf_size: 16,
            max_elements_per_block: 1_000_000,
            eta: 2.0,
            coarsening: false,
            recompress: true,
            validate_compression: false,
            validation_error_threshold: 1e-3,
            validation_rerun: false,
            validation_dump: false,
            use_lu: true,
            use_ldlt: false,
            nan_audit: false,
            max_parallel_leaves: 256,
            seed: None,
        }
    }
}

impl Settings {
    /// Sets both the assembly and recompression target accuracies.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.assembly_epsilon = epsilon;
        self.recompression_epsilon = epsilon;
        self
    }

    pub fn with_compression(mut self, method: CompressionMethod) -> Self {
        self.compression = method;
        self
    }

    pub fn with_clustering(mut self, strategy: SplitStrategy) -> Self {
        self.clustering = strategy;
        self
    }

    pub fn with_max_leaf_size(mut self, size: usize) -> Self {
        self.max_leaf_size = size;
        self
    }

    /// Sets a seed for the stochastic parts of compression, returning new
    /// settings with the seed applied.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_compose() {
        let settings = Settings::default()
            .with_epsilon(1e-8)
            .with_compression(CompressionMethod::Svd)
            .with_clustering(SplitStrategy::Geometric)
            .with_max_leaf_size(32)
            .with_seed(7);
        assert_eq!(settings.assembly_epsilon, 1e-8);
        assert_eq!(settings.recompression_epsilon, 1e-8);
        assert_eq!(settings.compression, CompressionMethod::Svd);
        assert_eq!(settings.clustering, SplitStrategy::Geometric);
        assert_eq!(settings.max_leaf_size, 32);
        assert_eq!(settings.seed, Some(7));
    }

    #[test]
    fn settings_are_serializable() {
        fn assert_serde<T: serde::Serialize + serde::de::DeserializeOwned>() {}
        assert_serde::<Settings>();
        assert_serde::<CompressionMethod>();
        assert_serde::<SplitStrategy>();
    }
}
