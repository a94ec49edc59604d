//! Localized-orbital integrals and effective Hamiltonians of an embedding calculation.
//!
//! [`LocalIntegrals`] is built once from a converged [`MeanFieldReference`] and is read-only
//! afterwards. Everything that changes during the outer self-consistency lives in
//! [`EmbeddingState`] snapshots produced by [`LocalIntegrals::setup_core_scf`] and
//! [`LocalIntegrals::restore_full_system`].

use crate::eri::EriStore;
use crate::la::{eigen_control, eye, matmul, select_columns};
use crate::localize::{localize, symmetry_blocks_in_loc};
use crate::prelude::*;
use crate::rhf::{WorkingSpace, solve_constrained_rhf};

pub struct LocalIntegrals {
    pub(crate) mf: MeanFieldReference,
    pub(crate) flags: LocalIntegralsFlags,

    /* #region active space */
    pub(crate) active: Vec<bool>,
    pub(crate) norbs_tot: usize,
    pub(crate) nelec_tot: usize,
    pub(crate) ao2loc: Tsr,
    /* #endregion */

    /* #region full system, AO basis */
    pub(crate) frozen_dm_ao: Tsr,
    pub(crate) frozen_oei_ao: Tsr,
    /* #endregion */

    /* #region frozen-core Hamiltonian, localized basis */
    pub(crate) active_const: f64,
    pub(crate) active_oei: Tsr,
    pub(crate) full_fock_loc: Tsr,
    pub(crate) full_rdm1_loc: Tsr,
    /* #endregion */

    pub(crate) eri: EriStore,
    pub(crate) loc2symm: Vec<Tsr>,
}

/// Comparison of the stored full-system Fock operator with a fresh SCF in the localized basis.
#[derive(Debug, Clone)]
pub struct MeanFieldCheck {
    /// `|D(activeFOCK) - D(scf)|`.
    pub dm_deviation: f64,

    /// `|activeFOCK - F(D(scf))|`.
    pub fock_deviation: f64,

    pub e_reference: f64,
    pub e_recomputed: f64,
    pub status: ScfStatus,
}

fn round_to_integer(x: f64, tol: f64) -> Option<i64> {
    let r = x.round();
    ((x - r).abs() <= tol).then_some(r as i64)
}

pub(crate) fn columns(m: &TsrView, range: std::ops::Range<usize>) -> Tsr {
    select_columns(m, &range.collect::<Vec<_>>())
}

impl LocalIntegrals {
    /// Localize the active orbitals of `mf` and set up the frozen-core Hamiltonian.
    ///
    /// `active_orbs` lists the molecular orbitals treated as active; the others are frozen with
    /// their mean-field occupations.
    pub fn new(mf: MeanFieldReference, active_orbs: &[usize], flags: LocalIntegralsFlags) -> Result<Self> {
        let nmo = mf.nmo();

        if let Some(&bad) = active_orbs.iter().find(|&&i| i >= nmo) {
            return Err(EmbeddingError::DimensionMismatch { context: "active orbital index".into(), expected: nmo, found: bad });
        }
        let mut active = vec![false; nmo];
        active_orbs.iter().for_each(|&i| active[i] = true);
        let norbs_tot = active.iter().filter(|&&a| a).count();

        // electrons outside the active space
        let mo_occ = mf.mo_occ.to_vec();
        let frozen_occ = (0..nmo).map(|i| if active[i] { 0.0 } else { mo_occ[i] }).collect::<Vec<_>>();
        let nelec_frozen = frozen_occ.iter().sum::<f64>();
        let nelec_active = mf.nelectron as f64 - nelec_frozen;
        let nelec_tot = match round_to_integer(nelec_active, flags.integer_tol) {
            Some(n) if n >= 0 => n as usize,
            _ => return Err(EmbeddingError::NonIntegralFrozenElectrons { nelec: nelec_frozen }),
        };
        info!("Active space: {norbs_tot} orbitals, {nelec_tot} electrons ({nmo} molecular orbitals)");

        // localization
        let ao2loc = localize(&flags.localization, &mf, &active, flags.ao_rotation.as_ref())?;
        if ao2loc.shape() != &[mf.nao(), norbs_tot] {
            return Err(EmbeddingError::DimensionMismatch {
                context: "localized basis columns".into(),
                expected: norbs_tot,
                found: ao2loc.shape()[1],
            });
        }
        let deviation = loc_ortho_of(&mf.ovlp, &ao2loc);
        if deviation.is_nan() || deviation > flags.orthonormality_tol {
            return Err(EmbeddingError::NonOrthonormalBasis { deviation, tol: flags.orthonormality_tol });
        }
        if norbs_tot == mf.nao() {
            let ao_ovlp_inv = matmul(&ao2loc.view(), &ao2loc.t());
            let should_be_eye = matmul(&mf.ovlp.view(), &ao_ovlp_inv.view());
            if !crate::la::is_matrix_eye(&should_be_eye.view()) {
                warn!("S @ ao2loc @ ao2loc^T deviates from the identity");
            }
        }

        // full system and frozen core
        let full_dm_ao = mf.make_rdm1();
        let full_jk_ao = mf.get_veff(&full_dm_ao.view());
        let full_fock_ao = &mf.hcore + &full_jk_ao;
        let frozen_dm_ao = MeanFieldReference::rdm1_from_occ(&mf.mo_coeff, &frozen_occ);
        let frozen_jk_ao = mf.get_veff(&frozen_dm_ao.view());
        let frozen_oei_ao = &full_fock_ao - &full_jk_ao + &frozen_jk_ao;

        let active_const = mf.e_nuc + (&frozen_dm_ao * (&frozen_oei_ao - 0.5_f64 * &frozen_jk_ao)).sum();
        let active_oei = represent_operator_in_basis(&frozen_oei_ao.view(), &ao2loc.view());
        let full_fock_loc = represent_operator_in_basis(&full_fock_ao.view(), &ao2loc.view());
        let loc_ovlp_ao = ao2loc.t() % &mf.ovlp;
        let full_rdm1_loc = represent_operator_in_basis(&full_dm_ao.view(), &loc_ovlp_ao.t());
        let trace = if norbs_tot == 0 { 0.0 } else { full_rdm1_loc.diagonal(None).sum() };
        if (trace - nelec_tot as f64).abs() > flags.num_zero_atol {
            return Err(EmbeddingError::ActiveElectronMismatch { trace, nelec: nelec_tot });
        }

        let max_memory = flags.max_memory.unwrap_or(mf.max_memory);
        let eri = EriStore::select(&mf, &ao2loc, max_memory);

        if flags.enforce_symmetry && mf.symmetry.is_none() {
            return Err(EmbeddingError::MissingSymmetry);
        }
        let loc2symm = symmetry_blocks_in_loc(&ao2loc, &mf.ovlp, mf.symmetry.as_ref(), flags.num_zero_atol)?;

        Ok(Self {
            mf,
            flags,
            active,
            norbs_tot,
            nelec_tot,
            ao2loc,
            frozen_dm_ao,
            frozen_oei_ao,
            active_const,
            active_oei,
            full_fock_loc,
            full_rdm1_loc,
            eri,
            loc2symm,
        })
    }

    /* #region accessors */

    pub fn localized_basis(&self) -> &Tsr {
        &self.ao2loc
    }

    pub fn norbs_tot(&self) -> usize {
        self.norbs_tot
    }

    pub fn nelec_tot(&self) -> usize {
        self.nelec_tot
    }

    pub fn active_mask(&self) -> &[bool] {
        &self.active
    }

    pub fn mean_field(&self) -> &MeanFieldReference {
        &self.mf
    }

    pub fn flags(&self) -> &LocalIntegralsFlags {
        &self.flags
    }

    pub fn eri_store(&self) -> &EriStore {
        &self.eri
    }

    /// Irrep-adapted orthonormal blocks of the localized space (one identity block without symmetry).
    pub fn loc2symm(&self) -> &[Tsr] {
        &self.loc2symm
    }

    /// Frozen-core AO density.
    pub fn frozen_density_ao(&self) -> &Tsr {
        &self.frozen_dm_ao
    }

    /// `|ao2loc^T S ao2loc - I|`.
    pub fn loc_ortho(&self) -> f64 {
        loc_ortho_of(&self.mf.ovlp, &self.ao2loc)
    }

    /// Frozen-core one-body operator `activeOEI` and constant `activeCONST`.
    pub fn one_body_hamiltonian(&self) -> (&Tsr, f64) {
        (&self.active_oei, self.active_const)
    }

    pub fn const_energy(&self) -> f64 {
        self.active_const
    }

    /// Frozen-core one-body operator in the AO basis.
    pub fn frozen_oei_ao(&self) -> &Tsr {
        &self.frozen_oei_ao
    }

    /* #endregion */

    /* #region one-body operators */

    /// Mean-field potential `J - K/2` generated by a localized-basis density.
    pub fn effective_fock(&self, dm_loc: &TsrView) -> Tsr {
        let dm_ao = represent_operator_in_basis(dm_loc, &self.ao2loc.t());
        let jk_ao = self.mf.get_veff(&dm_ao.view());
        represent_operator_in_basis(&jk_ao.view(), &self.ao2loc.view())
    }

    pub fn loc_rhf_jk_bis(&self, dm_loc: &TsrView) -> Tsr {
        self.effective_fock(dm_loc)
    }

    /// `activeOEI + JK(dm_loc)`.
    pub fn loc_rhf_fock_bis(&self, dm_loc: &TsrView) -> Tsr {
        &self.active_oei + self.effective_fock(dm_loc)
    }

    fn check_rows(&self, loc2bas: &TsrView, context: &str) -> Result<()> {
        if loc2bas.shape()[0] != self.norbs_tot {
            return Err(EmbeddingError::DimensionMismatch {
                context: context.into(),
                expected: self.norbs_tot,
                found: loc2bas.shape()[0],
            });
        }
        Ok(())
    }

    fn leading_columns(&self, loc2dmet: &TsrView, num_active: usize, context: &str) -> Result<Tsr> {
        self.check_rows(loc2dmet, context)?;
        if num_active > loc2dmet.shape()[1] {
            return Err(EmbeddingError::DimensionMismatch {
                context: format!("{context}: active columns"),
                expected: loc2dmet.shape()[1],
                found: num_active,
            });
        }
        Ok(columns(loc2dmet, 0..num_active))
    }

    /// `activeOEI` in the first `num_active` columns of `loc2dmet`, symmetrized.
    pub fn dmet_oei(&self, loc2dmet: &TsrView, num_active: usize) -> Result<Tsr> {
        let loc2act = self.leading_columns(loc2dmet, num_active, "dmet_oei")?;
        let oei = represent_operator_in_basis(&self.active_oei.view(), &loc2act.view());
        Ok(symmetrize_matrix(&oei.view()))
    }

    /// `activeOEI + JK(core_dm_loc)` in the first `num_active` columns of `loc2dmet`, symmetrized.
    pub fn dmet_fock(&self, loc2dmet: &TsrView, num_active: usize, core_dm_loc: &TsrView) -> Result<Tsr> {
        let loc2act = self.leading_columns(loc2dmet, num_active, "dmet_fock")?;
        let fock = represent_operator_in_basis(&self.loc_rhf_fock_bis(core_dm_loc).view(), &loc2act.view());
        Ok(symmetrize_matrix(&fock.view()))
    }

    /// One-body operator and Fock operator of a fragment, both symmetrized.
    pub fn fragment_block(&self, loc2frag: &TsrView, num_active: usize, core_dm_loc: &TsrView) -> Result<(Tsr, Tsr)> {
        Ok((self.dmet_oei(loc2frag, num_active)?, self.dmet_fock(loc2frag, num_active, core_dm_loc)?))
    }

    /* #endregion */

    /* #region two-body operators */

    /// Two-electron integrals over four leg bases; the only way integrals leave this object.
    pub fn transform_two_body(&self, loc2bas: [&TsrView; 4], compact: bool) -> Result<Tsr> {
        self.eri.transform(loc2bas, compact, &self.ao2loc, self.mf.engine.as_ref())
    }

    pub fn general_tei(&self, loc2bas: [&TsrView; 4], compact: bool) -> Result<Tsr> {
        self.transform_two_body(loc2bas, compact)
    }

    /// Compressed density-fitting factors of the first `num_active` columns of `loc2dmet`.
    pub fn density_fitted_block(&self, loc2dmet: &TsrView, num_active: Option<usize>) -> Result<Tsr> {
        let num_active = num_active.unwrap_or(loc2dmet.shape()[1]);
        let loc2imp = self.leading_columns(loc2dmet, num_active, "density_fitted_block")?;
        self.eri.density_fitted_block(&loc2imp.view(), self.flags.lindep_thr)
    }

    pub fn dmet_cderi(&self, loc2dmet: &TsrView, num_active: Option<usize>) -> Result<Tsr> {
        self.density_fitted_block(loc2dmet, num_active)
    }

    /// Two-electron tensor of all localized orbitals; fails unless it is stored in memory.
    pub fn bulk_tensor(&self) -> Result<Tsr> {
        self.eri.bulk_tensor()
    }

    /// Impurity two-electron integrals `[n, n, n, n]`, averaged over the eight index permutations.
    pub fn dmet_tei(&self, loc2dmet: &TsrView, num_active: Option<usize>) -> Result<Tsr> {
        let num_active = num_active.unwrap_or(loc2dmet.shape()[1]);
        let loc2imp = self.leading_columns(loc2dmet, num_active, "dmet_tei")?;
        let v = loc2imp.view();
        let tei = self.transform_two_body([&v, &v, &v, &v], false)?;
        Ok(crate::util::symmetrize_eri(&tei))
    }

    /// Mean-field energy of the orbitals of `loc2dmet` beyond the first `norbs_imp` columns.
    ///
    /// Zero exactly when the impurity spans the whole active space.
    pub fn frozen_energy_correction(&self, loc2dmet: &TsrView, norbs_imp: usize, frozen_dm_loc: &TsrView) -> Result<f64> {
        self.check_rows(loc2dmet, "frozen_energy_correction")?;
        let norbs_core = self.norbs_tot.saturating_sub(norbs_imp);
        if norbs_core == 0 {
            return Ok(0.0);
        }
        if loc2dmet.shape()[1] < norbs_imp + norbs_core {
            return Err(EmbeddingError::DimensionMismatch {
                context: "frozen_energy_correction: columns of loc2dmet".into(),
                expected: norbs_imp + norbs_core,
                found: loc2dmet.shape()[1],
            });
        }
        let loc2core = columns(loc2dmet, norbs_imp..norbs_imp + norbs_core);
        let gamma = represent_operator_in_basis(frozen_dm_loc, &loc2core.view());
        let oei = self.dmet_oei(&loc2core.view(), norbs_core)?;
        let fock = self.dmet_fock(&loc2core.view(), norbs_core, frozen_dm_loc)?;
        Ok(0.5 * (&gamma * (oei + fock)).sum())
    }

    pub fn dmet_const(&self, loc2dmet: &TsrView, norbs_imp: usize, frozen_dm_loc: &TsrView) -> Result<f64> {
        self.frozen_energy_correction(loc2dmet, norbs_imp, frozen_dm_loc)
    }

    /* #endregion */

    /* #region diagnostics */

    /// Unconstrained RHF over the whole active space in the localized basis, compared with the
    /// stored full-system Fock operator and the reference energy.
    pub fn verify_mean_field(&self) -> Result<MeanFieldCheck> {
        if self.nelec_tot % 2 != 0 {
            return Err(EmbeddingError::InvalidIdempotentElectrons { nelec: self.nelec_tot as i64 });
        }
        let npair = self.nelec_tot / 2;
        let res = eigen_control(&self.full_fock_loc.view(), &EigenControl::sorted(SortOrder::Ascending))?;
        let dm_guess = crate::rhf::closed_shell_density(&res.evecs.view(), npair);

        let space = WorkingSpace {
            oei: &self.active_oei,
            ao2wrk: &self.ao2loc,
            e_const: self.active_const,
            nocc: npair,
            labels: None,
        };
        let (dm, status) = solve_constrained_rhf(&space, Some(&dm_guess), |dm| self.mf.get_veff(dm), &self.flags.scf)?;
        let fock = self.loc_rhf_fock_bis(&dm.view());
        let e_recomputed = self.active_const + 0.5 * (&dm * (&self.active_oei + &fock)).sum();
        let check = MeanFieldCheck {
            dm_deviation: (&dm_guess - &dm).l2_norm(),
            fock_deviation: (&self.full_fock_loc - &fock).l2_norm(),
            e_reference: self.mf.e_tot,
            e_recomputed,
            status,
        };
        info!("2-norm difference of RDM(activeFOCK) and RDM(activeOEI, ERI)  = {:.3e}", check.dm_deviation);
        info!("2-norm difference of activeFOCK and FOCK(RDM(activeOEI, ERI)) = {:.3e}", check.fock_deviation);
        info!("RHF energy of mean-field input           = {:.10}", check.e_reference);
        info!("RHF energy based on activeOEI and ERI    = {:.10}", check.e_recomputed);
        Ok(check)
    }

    /// Boys-localize the subspace `loc2bas` and hand every resulting state to the fragment whose
    /// `loc2frag` captures most of its weight.
    ///
    /// Within each fragment, `canonicalize` diagonalizes the Fock operator of `rdm1_loc`;
    /// otherwise `natorb` diagonalizes `rdm1_loc` itself. `canonicalize` takes precedence.
    pub fn relocalize_states(
        &self,
        loc2bas: &TsrView,
        fragments: &[FragmentState],
        rdm1_loc: &TsrView,
        natorb: bool,
        canonicalize: bool,
    ) -> Result<Vec<Tsr>> {
        self.check_rows(loc2bas, "relocalize_states")?;
        let dipole = self.mf.engine.dipole().ok_or_else(|| EmbeddingError::MissingIntegral("int1e_r".into()))?;
        let fock_loc = self.loc_rhf_fock_bis(rdm1_loc);
        let ao2bas = matmul(&self.ao2loc.view(), loc2bas);
        let ao2bas = crate::localize::boys(&ao2bas, &dipole, 100, 1.0e-10);
        let loc2bas = self.ao2loc.t() % &self.mf.ovlp % &ao2bas;

        let nbas = loc2bas.shape()[1];
        let weights = fragments
            .iter()
            .map(|frag| {
                crate::la::column_sq_norms(&matmul(&frag.loc2frag.t(), &loc2bas.view()).view())
            })
            .collect::<Vec<_>>();
        let assignment = (0..nbas)
            .map(|c| (0..fragments.len()).max_by(|&a, &b| weights[a][c].total_cmp(&weights[b][c])).unwrap_or(0))
            .collect::<Vec<_>>();

        fragments
            .iter()
            .enumerate()
            .map(|(ifrag, frag)| {
                let picked = (0..nbas).filter(|&c| assignment[c] == ifrag).collect::<Vec<_>>();
                info!("{} states found for fragment {}", picked.len(), frag.name);
                let loc2pick = select_columns(&loc2bas.view(), &picked);
                if picked.is_empty() || !(canonicalize || natorb) {
                    return Ok(loc2pick);
                }
                let (op_pick, sort) = if canonicalize {
                    (represent_operator_in_basis(&fock_loc.view(), &loc2pick.view()), SortOrder::Ascending)
                } else {
                    (represent_operator_in_basis(rdm1_loc, &loc2pick.view()), SortOrder::Descending)
                };
                let res = eigen_control(&op_pick.view(), &EigenControl::sorted(sort))?;
                Ok(matmul(&loc2pick.view(), &res.evecs.view()))
            })
            .collect()
    }

    /* #endregion */
}

/// `|C^T S C - I|`.
fn loc_ortho_of(ovlp: &Tsr, ao2loc: &Tsr) -> f64 {
    let k = ao2loc.shape()[1];
    if k == 0 {
        return 0.0;
    }
    let gram = represent_operator_in_basis(&ovlp.view(), &ao2loc.view());
    (gram - eye(k, ovlp.device())).l2_norm()
}
