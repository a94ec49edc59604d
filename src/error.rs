use thiserror::Error;

/// Errors raised while building or updating the localized-orbital embedding.
///
/// Convergence failures of the constrained mean-field solver are not errors; they are reported
/// through [`crate::structs::ScfStatus`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    /* #region construction */
    #[error("localized basis is not orthonormal: |C^T S C - I| = {deviation:.3e} exceeds {tol:.1e}")]
    NonOrthonormalBasis { deviation: f64, tol: f64 },

    #[error("frozen orbitals carry a non-integral number of electrons: {nelec}")]
    NonIntegralFrozenElectrons { nelec: f64 },

    #[error("unsupported localization method `{0}`")]
    UnsupportedLocalization(String),

    #[error("symmetry enforcement requested but the mean-field reference carries no symmetry information")]
    MissingSymmetry,

    #[error("active-space density trace {trace} does not match the active electron count {nelec}")]
    ActiveElectronMismatch { trace: f64, nelec: usize },
    /* #endregion */

    /* #region consistency */
    #[error("fragments disagree on the correlated electron count: trace = {trace}")]
    NonIntegralCorrelatedElectrons { trace: f64 },

    #[error("idempotent subspace must hold an even, non-negative number of electrons, found {nelec}")]
    InvalidIdempotentElectrons { nelec: i64 },

    #[error("dimension mismatch in {context}: expected {expected}, found {found}")]
    DimensionMismatch { context: String, expected: usize, found: usize },

    #[error("symmetry blocks of shape {found:?} cannot span an operator of shape {expected:?}")]
    SymmetryBlockMismatch { expected: Vec<usize>, found: Vec<usize> },

    #[error("unsupported basis combination for two-electron integrals: {0}")]
    UnsupportedBasisCombination(String),
    /* #endregion */

    /* #region resources */
    #[error("density-fitted integrals requested but no density-fitting backend is configured")]
    DensityFittingUnavailable,

    #[error("the two-electron tensor of the localized orbitals is not stored in memory")]
    BulkTensorUnavailable,

    #[error("integral engine cannot provide `{0}`")]
    MissingIntegral(String),
    /* #endregion */
}

pub type Result<T> = std::result::Result<T, EmbeddingError>;
