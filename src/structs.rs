use crate::diis::DIISIncoreFlags;
use crate::prelude::*;

/* #region RHF */

#[derive(Debug, Clone)]
pub struct RHFResults {
    pub mo_coeff: Tsr,
    pub mo_energy: Tsr,
    pub mo_occ: Tsr,
    pub dm: Tsr,
    pub e_nuc: f64,
    pub e_elec: f64,
    pub e_tot: f64,
    pub status: ScfStatus,
}

pub struct ScfFlags {
    /// Maximum number of SCF iterations. Default is 64.
    pub max_cycle: usize,

    /// Energy convergence threshold. Default is 1e-10.
    pub conv_tol_e: f64,

    /// Density matrix convergence threshold (Frobenius norm of the change). Default is 1e-8.
    pub conv_tol_dm: f64,

    /// DIIS flags for Fock extrapolation.
    pub diis: DIISIncoreFlags,
}

impl Default for ScfFlags {
    fn default() -> Self {
        Self { max_cycle: 64, conv_tol_e: 1.0e-10, conv_tol_dm: 1.0e-8, diis: DIISIncoreFlags::default() }
    }
}

/// Outcome of an SCF run.
///
/// Non-convergence is not an error: the outer driver decides whether to retry.
#[derive(Debug, Clone, PartialEq)]
pub struct ScfStatus {
    pub converged: bool,
    pub niter: usize,
    pub e_tot: f64,
    pub ddm: f64,
}

/* #endregion */

/* #region local integrals */

pub struct LocalIntegralsFlags {
    /// Localization scheme for the active orbitals. Default is Lowdin.
    pub localization: LocalizationMethod,

    /// Optional rotation applied to the localized AO basis (`ao2loc <- ao2loc @ rotation^T`).
    pub ao_rotation: Option<Tsr>,

    /// Tolerance on `|C^T S C - I|` of the localized basis. Default is 1e-8.
    pub orthonormality_tol: f64,

    /// Tolerance when rounding electron counts to integers. Default is 1e-6.
    pub integer_tol: f64,

    /// Numerical zero for eigenvalues, singular values and projections. Default is 1e-8.
    pub num_zero_atol: f64,

    /// Linear-dependency threshold of density fitting; its square root screens auxiliary rows
    /// and singular values. Default is 1e-12.
    pub lindep_thr: f64,

    /// Memory ceiling in MB. `None` uses the value of the mean-field reference.
    pub max_memory: Option<f64>,

    /// Enforce point-group symmetry in the constrained mean-field step. Default is false.
    pub enforce_symmetry: bool,

    /// Settings of the constrained mean-field solver.
    pub scf: ScfFlags,
}

impl Default for LocalIntegralsFlags {
    fn default() -> Self {
        Self {
            localization: LocalizationMethod::Lowdin,
            ao_rotation: None,
            orthonormality_tol: 1.0e-8,
            integer_tol: 1.0e-6,
            num_zero_atol: 1.0e-8,
            lindep_thr: 1.0e-12,
            max_memory: None,
            enforce_symmetry: false,
            scf: ScfFlags::default(),
        }
    }
}

/* #endregion */
