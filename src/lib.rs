//! hmat: a hierarchical-matrix (H-matrix) linear algebra engine.
//!
//! Dense operators from boundary-element and integral-equation
//! discretizations are compressed block-wise: interactions between
//! well-separated clusters of DoFs are stored as low-rank factor pairs,
//! near-field blocks stay dense, and a family of recursive block
//! algorithms (GEMM, triangular solves, LU, LDL^T, LL^T, inverse) operates
//! on that structure, touching scalar kernels only at dense leaves.
//!
//! The typical pipeline: build a [`core::cluster::ClusterTree`] over the
//! DoF points, [`assembly::assemble`] the operator through a
//! [`assembly::Generator`], then factor and solve through
//! [`algebra::Factorization`].

pub mod constants;
pub mod error;
pub mod prelude;

pub mod algebra;
pub mod assembly;
pub mod compression;
pub mod core;
pub mod executor;
pub mod settings;
pub mod utils;

pub use crate::assembly::{assemble, Generator};
pub use crate::core::admissibility::{Admissibility, Always, Hackbusch, TallSkinny};
pub use crate::core::block::HMatrix;
pub use crate::core::cluster::ClusterTree;
pub use crate::core::dense::ScalarArray;
pub use crate::core::kernel::Kernel;
pub use crate::core::rk::RkMatrix;
pub use crate::core::scalar::Scalar;
pub use crate::error::{Error, Result};
pub use crate::settings::{CompressionMethod, Settings, SplitStrategy};

pub use crate::algebra::{FactorKind, Factorization};
