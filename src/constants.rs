//! Hard-coded constants for hmat and its dependents.

/// For avoiding divide-by-zero errors.
pub const EPSILON: f64 = 1e-8;

/// Floor for the precision accepted by the public pivoted Gram-Schmidt entry
/// point. Requests below this are clamped.
pub const MIN_MGS_PREC: f64 = 1e-6;

/// Sweep cap for the one-sided Jacobi SVD. No convergence by this point
/// means the input is pathological and the routine reports a kernel failure.
pub const JACOBI_MAX_SWEEPS: usize = 60;

// TODO: Maybe we let this be a user-specified parameter? Perhaps through
// `Settings` once somebody needs to tune it.
/// A bounding box whose longest extent exceeds its shortest by this factor
/// is considered anisotropic by the hybrid splitting strategy.
pub const ANISOTROPY_RATIO: f64 = 2.0;

/// Size ratio used by the tall-skinny admissibility predicate.
pub const TALL_SKINNY_RATIO: f64 = 4.0;
