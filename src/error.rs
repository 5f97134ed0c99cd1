//! Error kinds surfaced by the hierarchical-matrix engine.

/// Identifies a block of the tree by the hex names of its row and column
/// clusters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPath {
    /// Hex name of the row cluster.
    pub rows: String,
    /// Hex name of the column cluster.
    pub cols: String,
}

impl std::fmt::Display for BlockPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.rows, self.cols)
    }
}

/// Represents errors that can occur in the hierarchical-matrix engine.
///
/// Recursive routines surface the first error they encounter and abort the
/// current subtree; the offending block is carried along where one exists.
/// Shape checks on internal recursion are assertion-class and do not appear
/// here.
#[derive(Debug)]
pub enum Error {
    /// Operand dimensions incompatible with the requested operation.
    InvalidShape {
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },

    /// Zero (or below-tolerance) pivot during a factorization, with the path
    /// to the offending block and the one-based pivot index within it.
    Singular { path: BlockPath, pivot: usize },

    /// Compression hit its rank cap before reaching the target accuracy.
    /// Fatal only when compression validation is enabled and the achieved
    /// error exceeds the configured threshold; a warning otherwise.
    RankExceeded { path: BlockPath, rank: usize },

    /// A factorization or inverse was requested on a node with zero DoFs.
    EmptyCluster,

    /// A dense kernel returned a nonzero info code, surfaced verbatim.
    Kernel { routine: &'static str, info: i32 },

    /// I/O error (tile serialization).
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HmatError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<crate::core::kernel::KernelError> for Error {
    fn from(value: crate::core::kernel::KernelError) -> Self {
        Self::Kernel {
            routine: value.routine,
            info: value.info,
        }
    }
}

/// Engine result
pub type Result<T> = std::result::Result<T, Error>;
