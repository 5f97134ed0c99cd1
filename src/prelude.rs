//! Common imports from hmat.

pub use crate::assembly::{assemble, Generator};
pub use crate::core::admissibility::{Acceptance, Admissibility, Always, Hackbusch, TallSkinny};
pub use crate::core::block::HMatrix;
pub use crate::core::cluster::{BoundingBox, ClusterNode, ClusterTree};
pub use crate::core::dense::ScalarArray;
pub use crate::core::kernel::{Kernel, Part, Side};
pub use crate::core::rk::RkMatrix;
pub use crate::core::scalar::Scalar;
pub use crate::error::{Error, Result};
pub use crate::executor::{Sequential, TaskExecutor, Threaded};
pub use crate::settings::{CompressionMethod, Settings, SplitStrategy};

pub use crate::algebra::{gemm, FactorKind, Factorization};
