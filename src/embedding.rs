//! Idempotent/correlated partition of the active space and its self-consistent update.

use crate::la::{eigen_control, eye, hstack, is_matrix_zero, matmul, svd_control};
use crate::localintegrals::columns;
use crate::prelude::*;
use crate::rhf::{WorkingSpace, closed_shell_density, solve_constrained_rhf};
use itertools::iproduct;

/// What a fragment solver hands back to the embedding.
#[derive(Debug, Clone)]
pub struct FragmentState {
    pub name: String,

    /// Fragment (impurity) orbitals in the localized basis.
    pub loc2frag: Tsr,

    /// Active orbitals of the fragment in the localized basis.
    pub loc2amo: Tsr,

    /// The fragment's estimate of the whole one-body density.
    pub one_rdm_loc: Tsr,

    /// Correlated density contributed by the fragment.
    pub one_rdm_corr_loc: Tsr,

    /// Two-body cumulant in the active orbitals, `[namo, namo, namo, namo]`.
    pub two_cdm_amo: Option<Tsr>,

    /// Precomputed cumulant energy; takes precedence over `two_cdm_amo`.
    pub e2_cum: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingMode {
    FullSystem,
    Embedded,
}

/// Running Hamiltonian and densities of the embedding, replaced as a whole on every update.
#[derive(Debug, Clone)]
pub struct EmbeddingState {
    pub mode: EmbeddingMode,

    /// `activeOEI + JKidem + JKcorr`.
    pub active_fock: Tsr,
    pub jk_idem: Tsr,
    pub jk_corr: Tsr,
    pub one_rdm_corr_loc: Tsr,
    pub loc2idem: Tsr,
    pub nelec_idem: usize,

    /// Idempotent plus correlated density.
    pub one_rdm_loc: Tsr,
    pub e_tot: f64,

    /// Cumulant energy of each fragment.
    pub e2_cum: Vec<f64>,

    /// Status of the constrained mean-field step, absent in the full-system state.
    pub scf: Option<ScfStatus>,
}

impl EmbeddingState {
    /// `activeOEI + JKcorr`.
    pub fn loc_oei(&self) -> Tsr {
        &self.active_fock - &self.jk_idem
    }

    pub fn loc_rhf_fock(&self) -> Tsr {
        self.active_fock.to_owned()
    }
}

/// Natural orbitals of a trial wave function: doubly occupied, active and virtual blocks.
#[derive(Debug, Clone)]
pub struct TrialOrbitals {
    pub loc2no: Tsr,
    pub ao2no: Tsr,
    pub occ_no: Vec<f64>,

    /// Fock eigenvalues for the inactive blocks, zero for the active block.
    pub ene_no: Vec<f64>,

    /// Dominant irrep of every orbital.
    pub labels: Vec<usize>,
}

impl LocalIntegrals {
    /// State with no embedding: the idempotent space is the whole active space.
    pub fn restore_full_system(&self) -> EmbeddingState {
        let n = self.norbs_tot;
        let device = self.ao2loc.device().clone();
        EmbeddingState {
            mode: EmbeddingMode::FullSystem,
            active_fock: self.full_fock_loc.to_owned(),
            jk_idem: &self.full_fock_loc - &self.active_oei,
            jk_corr: rt::zeros(([n, n], &device)),
            one_rdm_corr_loc: rt::zeros(([n, n], &device)),
            loc2idem: eye(n, &device),
            nelec_idem: self.nelec_tot,
            one_rdm_loc: self.full_rdm1_loc.to_owned(),
            e_tot: self.mf.e_tot,
            e2_cum: vec![],
            scf: None,
        }
    }

    pub fn full_system_state(&self) -> EmbeddingState {
        self.restore_full_system()
    }

    fn check_fragment(&self, frag: &FragmentState) -> Result<()> {
        let n = self.norbs_tot;
        let checks = [
            ("loc2amo rows", frag.loc2amo.shape()[0]),
            ("loc2frag rows", frag.loc2frag.shape()[0]),
            ("correlated density", frag.one_rdm_corr_loc.shape()[0]),
            ("correlated density", frag.one_rdm_corr_loc.shape()[1]),
            ("fragment density", frag.one_rdm_loc.shape()[0]),
            ("fragment density", frag.one_rdm_loc.shape()[1]),
        ];
        for (what, found) in checks {
            if found != n {
                return Err(EmbeddingError::DimensionMismatch {
                    context: format!("fragment {}: {what}", frag.name),
                    expected: n,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Cumulant energy `1/2 <V_amo, L_amo>` of one fragment.
    fn fragment_e2_cum(&self, frag: &FragmentState) -> Result<f64> {
        if frag.loc2amo.shape()[1] == 0 {
            return Ok(0.0);
        }
        if let Some(e2) = frag.e2_cum {
            return Ok(e2);
        }
        match &frag.two_cdm_amo {
            Some(cdm) if cdm.l2_norm() > 0.0 => {
                let v = self.dmet_tei(&frag.loc2amo.view(), None)?;
                if v.shape() != cdm.shape() {
                    return Err(EmbeddingError::DimensionMismatch {
                        context: format!("fragment {}: two-body cumulant", frag.name),
                        expected: v.shape()[0],
                        found: cdm.shape()[0],
                    });
                }
                Ok(0.5 * (&v * cdm).sum())
            },
            _ => Ok(0.0),
        }
    }

    /// Inject the correlated densities of `fragments` and re-solve the idempotent remainder of
    /// the active space at the mean-field level.
    ///
    /// The returned state replaces the previous one as a whole. A vanishing total correlated
    /// density yields the full-system state.
    pub fn setup_core_scf(&self, fragments: &[FragmentState]) -> Result<EmbeddingState> {
        let full = self.restore_full_system();
        let n = self.norbs_tot;
        let device = self.ao2loc.device().clone();
        fragments.iter().try_for_each(|frag| self.check_fragment(frag))?;

        // 1. total correlated density
        let mut one_rdm_corr_loc: Tsr = rt::zeros(([n, n], &device));
        for frag in fragments {
            one_rdm_corr_loc += &frag.one_rdm_corr_loc;
        }
        if is_matrix_zero(&one_rdm_corr_loc.view()) {
            info!("Null correlated 1-RDM; default settings for the mean-field wave function");
            return Ok(full);
        }

        // 2. correlated electrons
        let nelec_corr = one_rdm_corr_loc.diagonal(None).sum();
        let nelec_corr_int = nelec_corr.round();
        if (nelec_corr - nelec_corr_int).abs() > 100.0 * self.flags.num_zero_atol {
            return Err(EmbeddingError::NonIntegralCorrelatedElectrons { trace: nelec_corr });
        }
        let nelec_idem = self.nelec_tot as i64 - nelec_corr_int as i64;
        if nelec_idem < 0 || nelec_idem % 2 != 0 {
            return Err(EmbeddingError::InvalidIdempotentElectrons { nelec: nelec_idem });
        }
        let nelec_idem = nelec_idem as usize;

        let e2_cum = fragments.iter().map(|frag| self.fragment_e2_cum(frag)).collect::<Result<Vec<_>>>()?;
        let e2_cum_tot = e2_cum.iter().sum::<f64>();

        // 3. correlated and idempotent subspaces
        let amo_views = fragments.iter().map(|f| f.loc2amo.view()).collect::<Vec<_>>();
        let loc2corr = hstack(&amo_views, n, &device);
        let loc2idem = get_complementary_states(&loc2corr.view(), self.flags.num_zero_atol)?;
        let (orthogonal, err) = are_bases_orthogonal(&loc2idem.view(), &loc2corr.view(), self.flags.num_zero_atol);
        info!("Testing linear algebra: overlap of active and unactive orbitals = {err:.3e}");
        if !orthogonal {
            warn!("Idempotent and correlated subspaces overlap: {err:.3e}");
        }
        if 2 * loc2idem.shape()[1] < nelec_idem {
            return Err(EmbeddingError::InvalidIdempotentElectrons { nelec: nelec_idem as i64 });
        }

        // guess density from the fragments' own estimates
        let mut guess_loc: Tsr = rt::zeros(([n, n], &device));
        for (fa, fb) in iproduct!(fragments, fragments) {
            for f in [fa, fb] {
                guess_loc +=
                    0.5_f64 * project_operator_into_subspace(&f.one_rdm_loc.view(), &fa.loc2frag.view(), &fb.loc2frag.view());
            }
        }

        // 4. correlated potential and the working Hamiltonian
        let jk_corr = self.effective_fock(&one_rdm_corr_loc.view());
        let oei_half = &self.active_oei + 0.5_f64 * &jk_corr;
        let working_const = self.active_const + (&oei_half * &one_rdm_corr_loc).sum() + e2_cum_tot;

        // 5. constrained mean-field problem in the idempotent space
        let (loc2wrk, labels) = if self.flags.enforce_symmetry {
            match symmetry_adapted_subspace(&loc2idem, &self.loc2symm, self.flags.num_zero_atol)? {
                Some((basis, labels)) => (basis, Some(labels)),
                None => {
                    warn!("Idempotent subspace is not symmetry adapted; solving without symmetry constraints");
                    (loc2idem.to_owned(), None)
                },
            }
        } else {
            (loc2idem.to_owned(), None)
        };
        let oei_wrk = represent_operator_in_basis(&(&self.active_oei + &jk_corr).view(), &loc2wrk.view());
        let ao2wrk = matmul(&self.ao2loc.view(), &loc2wrk.view());
        let guess_wrk = represent_operator_in_basis(&guess_loc.view(), &loc2wrk.view());
        let space = WorkingSpace {
            oei: &oei_wrk,
            ao2wrk: &ao2wrk,
            e_const: working_const,
            nocc: nelec_idem / 2,
            labels: labels.as_deref(),
        };
        let (dm_wrk, scf) = solve_constrained_rhf(&space, Some(&guess_wrk), |dm| self.mf.get_veff(dm), &self.flags.scf)?;
        let one_rdm_idem_loc = represent_operator_in_basis(&dm_wrk.view(), &loc2wrk.t());

        // 6. idempotent potential
        let jk_idem = self.effective_fock(&one_rdm_idem_loc.view());
        let active_fock = &self.active_oei + &jk_idem + &jk_corr;

        let trace = |m: &Tsr| if m.size() == 0 { 0.0 } else { m.diagonal(None).sum() };
        info!("trace of oneRDMcorr_loc = {:.10}", trace(&one_rdm_corr_loc));
        info!("trace of oneRDMidem_loc = {:.10}", trace(&one_rdm_idem_loc));
        let one_rdm_loc = &one_rdm_idem_loc + &one_rdm_corr_loc;
        info!(
            "trace of oneRDM_loc in corr basis = {:.10}",
            compute_nelec_in_subspace(&one_rdm_loc.view(), &loc2corr.view())
        );
        let svals = get_overlapping_states(&loc2idem.view(), &loc2corr.view())?;
        info!("trace of <idem|corr|idem> = {:.3e}", svals.iter().map(|s| s * s).sum::<f64>());

        // 7. energy
        let oei_mean = &self.active_oei + 0.5_f64 * (&jk_corr + &jk_idem);
        let e_tot = self.active_const + (&oei_mean * &one_rdm_loc).sum() + e2_cum_tot;
        info!("LASSCF trial wave function total energy: {e_tot:.10}");

        Ok(EmbeddingState {
            mode: EmbeddingMode::Embedded,
            active_fock,
            jk_idem,
            jk_corr,
            one_rdm_corr_loc,
            loc2idem,
            nelec_idem,
            one_rdm_loc,
            e_tot,
            e2_cum,
            scf: Some(scf),
        })
    }

    /// Aufbau density of `oei` in a working subspace plus the correlated density of `state`.
    ///
    /// `nelec` and `loc2wrk` default to the idempotent electrons and subspace of `state`.
    pub fn aufbau_density(
        &self,
        state: &EmbeddingState,
        oei: &TsrView,
        nelec: Option<usize>,
        loc2wrk: Option<&TsrView>,
    ) -> Result<Tsr> {
        let nelec = nelec.unwrap_or(state.nelec_idem);
        let loc2wrk = loc2wrk.map(|x| x.to_owned()).unwrap_or_else(|| state.loc2idem.to_owned());
        let nocc = nelec / 2;
        if nocc > loc2wrk.shape()[1] {
            return Err(EmbeddingError::DimensionMismatch {
                context: "occupied orbitals in the working subspace".into(),
                expected: loc2wrk.shape()[1],
                found: nocc,
            });
        }
        let oei_wrk = represent_operator_in_basis(oei, &loc2wrk.view());
        let res = eigen_control(&oei_wrk.view(), &EigenControl::sorted(SortOrder::Ascending))?;
        let dm_wrk = closed_shell_density(&res.evecs.view(), nocc);
        Ok(represent_operator_in_basis(&dm_wrk.view(), &loc2wrk.t()) + &state.one_rdm_corr_loc)
    }

    /// Mean-field guess density of an impurity problem from the running Fock operator, with a
    /// chemical potential applied to the first `norbs_frag` orbitals.
    pub fn dmet_init_guess_rhf(
        &self,
        state: &EmbeddingState,
        loc2dmet: &TsrView,
        num_active: usize,
        num_pairs: usize,
        norbs_frag: usize,
        chempot_imp: f64,
    ) -> Result<Tsr> {
        let loc2act = columns(loc2dmet, 0..num_active.min(loc2dmet.shape()[1]));
        let mut fock_small = represent_operator_in_basis(&state.active_fock.view(), &loc2act.view());
        if chempot_imp != 0.0 {
            for i in 0..norbs_frag.min(loc2act.shape()[1]) {
                fock_small[[i, i]] -= chempot_imp;
            }
        }
        let res = eigen_control(&fock_small.view(), &EigenControl::sorted(SortOrder::Ascending))?;
        Ok(closed_shell_density(&res.evecs.view(), num_pairs.min(res.evals.len())))
    }

    /// Natural orbitals of the state: canonical inactive orbitals around the natural orbitals of
    /// the active subspace `loc2wmas` (empty by default).
    pub fn get_trial_nos(&self, state: &EmbeddingState, loc2wmas: Option<&TsrView>, fock: Option<&TsrView>) -> Result<TrialOrbitals> {
        let n = self.norbs_tot;
        let device = self.ao2loc.device().clone();
        let loc2wmas = loc2wmas.map(|x| x.to_owned()).unwrap_or_else(|| rt::zeros(([n, 0], &device)));
        let fock = fock.map(|x| x.to_owned()).unwrap_or_else(|| state.active_fock.to_owned());
        let rdm1 = &state.one_rdm_loc;

        let loc2wmcs = get_complementary_states(&loc2wmas.view(), self.flags.num_zero_atol)?;
        let (norbs_wmas, norbs_wmcs) = (loc2wmas.shape()[1], loc2wmcs.shape()[1]);
        let f_wmcs = represent_operator_in_basis(&fock.view(), &loc2wmcs.view());
        let res_wmcs = eigen_control(&f_wmcs.view(), &EigenControl::sorted(SortOrder::Ascending))?;
        let loc2wmcs = matmul(&loc2wmcs.view(), &res_wmcs.evecs.view());
        let d_wmas = represent_operator_in_basis(&rdm1.view(), &loc2wmas.view());
        let res_wmas = eigen_control(&d_wmas.view(), &EigenControl::sorted(SortOrder::Descending))?;
        let loc2wmas = matmul(&loc2wmas.view(), &res_wmas.evecs.view());

        if let Some(symmetry) = &self.mf.symmetry {
            for (what, basis) in [("unactive", &loc2wmcs), ("active", &loc2wmas)] {
                let labels = get_subspace_symmetry_blocks(&basis.view(), &self.loc2symm);
                let counts = symmetry
                    .irrep_names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| format!("{name}: {}", labels.iter().filter(|&&l| l == i).count()))
                    .collect::<Vec<_>>();
                let err = measure_subspace_blockbreaking(&basis.view(), &self.loc2symm);
                info!("Trial wave function {what}-orbital irreps = {{{}}}, err = {err:.3e}", counts.join(", "));
            }
        }

        let nelec_wmas = compute_nelec_in_subspace(&rdm1.view(), &loc2wmas.view()).round() as i64;
        let nelec_core = self.nelec_tot as i64 - nelec_wmas;
        if nelec_core < 0 || nelec_core % 2 != 0 || (nelec_core / 2) as usize > norbs_wmcs {
            return Err(EmbeddingError::InvalidIdempotentElectrons { nelec: nelec_core });
        }
        let norbs_core = (nelec_core / 2) as usize;
        let norbs_virt = norbs_wmcs - norbs_core;

        let core = columns(&loc2wmcs.view(), 0..norbs_core);
        let virt = columns(&loc2wmcs.view(), norbs_core..norbs_wmcs);
        let loc2no = hstack(&[core.view(), loc2wmas.view(), virt.view()], n, &device);
        let occ_no = std::iter::repeat_n(2.0, norbs_core)
            .chain(res_wmas.evals.iter().copied())
            .chain(std::iter::repeat_n(0.0, norbs_virt))
            .collect::<Vec<_>>();
        let ene_no = res_wmcs.evals[..norbs_core]
            .iter()
            .copied()
            .chain(std::iter::repeat_n(0.0, norbs_wmas))
            .chain(res_wmcs.evals[norbs_core..].iter().copied())
            .collect::<Vec<_>>();
        let labels = get_subspace_symmetry_blocks(&loc2no.view(), &self.loc2symm);
        let ao2no = matmul(&self.ao2loc.view(), &loc2no.view());
        Ok(TrialOrbitals { loc2no, ao2no, occ_no, ene_no, labels })
    }
}

/// Rotate an orthonormal subspace onto irrep-pure vectors, if it is spanned by them.
///
/// Returns the adapted basis and the irrep label of each vector, or `None` when the subspace
/// breaks the symmetry.
fn symmetry_adapted_subspace(subspace: &Tsr, loc2symm: &[Tsr], num_zero_atol: f64) -> Result<Option<(Tsr, Vec<usize>)>> {
    let (n, k) = (subspace.shape()[0], subspace.shape()[1]);
    let mut blocks = vec![];
    let mut labels = vec![];
    for (ir, loc2ir) in loc2symm.iter().enumerate() {
        let ovlp = matmul(&loc2ir.t(), &subspace.view());
        let svd = svd_control(&ovlp.view(), &EigenControl::default())?;
        let keep = (0..svd.svals.len()).filter(|&i| svd.svals[i] > 1.0 - 1.0e-6).collect::<Vec<_>>();
        let vecs = matmul(&loc2ir.view(), &crate::la::select_columns(&svd.lvecs.view(), &keep).view());
        labels.extend(std::iter::repeat_n(ir, keep.len()));
        blocks.push(vecs);
    }
    if labels.len() != k {
        return Ok(None);
    }
    let views = blocks.iter().map(|b| b.view()).collect::<Vec<_>>();
    let adapted = hstack(&views, n, subspace.device());
    if measure_basis_nonorthonormality(&adapted.view()) > num_zero_atol.sqrt() {
        return Ok(None);
    }
    Ok(Some((adapted, labels)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meanfield::EriSource;
    use approx::assert_abs_diff_eq;

    fn chain_ints(nsite: usize, source: EriSource, flags: LocalIntegralsFlags) -> LocalIntegrals {
        let _ = env_logger::builder().is_test(true).try_init();
        let model = ModelHamiltonian::hubbard_chain(nsite, 1.0, 2.0);
        let mf = MeanFieldReference::from_model(model, source, &flags.scf);
        let all = (0..nsite).collect::<Vec<_>>();
        LocalIntegrals::new(mf, &all, flags).unwrap()
    }

    /// Canonical orbitals expressed in the localized basis.
    fn loc2mo(ints: &LocalIntegrals) -> Tsr {
        ints.ao2loc.t() % &ints.mf.ovlp % &ints.mf.mo_coeff
    }

    fn fragment(ints: &LocalIntegrals, loc2amo: Tsr, one_rdm_corr_loc: Tsr) -> FragmentState {
        let n = ints.norbs_tot();
        FragmentState {
            name: "frag".into(),
            loc2frag: eye(n, &DeviceTsr::default()),
            loc2amo,
            one_rdm_loc: ints.full_rdm1_loc.to_owned(),
            one_rdm_corr_loc,
            two_cdm_amo: None,
            e2_cum: None,
        }
    }

    /// Fragment holding the HOMO (doubly occupied) and the LUMO (empty) of the reference.
    fn frontier_fragment(ints: &LocalIntegrals) -> FragmentState {
        let mo = loc2mo(ints);
        let nocc = ints.nelec_tot() / 2;
        let loc2amo = columns(&mo.view(), nocc - 1..nocc + 1);
        let homo = columns(&mo.view(), nocc - 1..nocc);
        let corr = 2.0_f64 * (&homo % homo.t());
        fragment(ints, loc2amo, corr)
    }

    #[test]
    fn test_two_orbital_toy() {
        let ints = chain_ints(2, EriSource::InCore, LocalIntegralsFlags::default());
        let frag = fragment(&ints, eye(2, &DeviceTsr::default()), ints.full_rdm1_loc.to_owned());
        let state = ints.setup_core_scf(&[frag]).unwrap();
        assert_eq!(state.mode, EmbeddingMode::Embedded);
        assert_eq!(state.nelec_idem, 0);
        assert_eq!(state.loc2idem.shape(), &[2, 0]);
        assert_abs_diff_eq!(state.jk_idem.l2_norm(), 0.0, epsilon = 1e-14);
        assert_abs_diff_eq!(state.e_tot, ints.mean_field().e_tot, epsilon = 1e-10);
        assert_abs_diff_eq!((&state.active_fock - &ints.full_fock_loc).l2_norm(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_zero_density_keeps_full_system() {
        let ints = chain_ints(4, EriSource::InCore, LocalIntegralsFlags::default());
        let device = DeviceTsr::default();
        let frag = fragment(&ints, columns(&eye(4, &device).view(), 0..2), rt::zeros(([4, 4], &device)));
        let state = ints.setup_core_scf(&[frag]).unwrap();
        assert_eq!(state.mode, EmbeddingMode::FullSystem);
        assert_eq!(state.nelec_idem, 4);
        assert!(state.scf.is_none());
        assert_abs_diff_eq!((&state.active_fock - &ints.full_fock_loc).l2_norm(), 0.0, epsilon = 1e-14);
        assert_abs_diff_eq!(state.e_tot, ints.mean_field().e_tot, epsilon = 1e-14);
        assert_abs_diff_eq!((state.loc_oei() - &ints.active_oei).l2_norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_frontier_fragment_reproduces_reference() {
        let ints = chain_ints(6, EriSource::InCore, LocalIntegralsFlags::default());
        let frag = frontier_fragment(&ints);
        let loc2amo = frag.loc2amo.to_owned();
        let state = ints.setup_core_scf(&[frag]).unwrap();

        assert_eq!(state.mode, EmbeddingMode::Embedded);
        assert_eq!(state.nelec_idem, 4);
        assert_eq!(state.loc2idem.shape(), &[6, 4]);
        assert!(state.scf.as_ref().unwrap().converged);
        assert!(is_basis_orthonormal(&state.loc2idem.view(), 1e-8));
        let (orthogonal, _) = are_bases_orthogonal(&state.loc2idem.view(), &loc2amo.view(), 1e-8);
        assert!(orthogonal);

        // electrons are conserved and the mean-field solution is recovered
        assert_abs_diff_eq!(state.one_rdm_loc.diagonal(None).sum(), 6.0, epsilon = 1e-8);
        assert_abs_diff_eq!((&state.one_rdm_loc - &ints.full_rdm1_loc).l2_norm(), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(state.e_tot, ints.mean_field().e_tot, epsilon = 1e-8);
        assert_abs_diff_eq!((&state.active_fock - &ints.full_fock_loc).l2_norm(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_reset_then_repeat_is_idempotent() {
        let ints = chain_ints(6, EriSource::DensityFitted, LocalIntegralsFlags::default());
        let first = ints.setup_core_scf(&[frontier_fragment(&ints)]).unwrap();
        let reset = ints.restore_full_system();
        assert_eq!(reset.mode, EmbeddingMode::FullSystem);
        assert_abs_diff_eq!(reset.jk_corr.l2_norm(), 0.0);
        assert_abs_diff_eq!(reset.one_rdm_corr_loc.l2_norm(), 0.0);
        let second = ints.setup_core_scf(&[frontier_fragment(&ints)]).unwrap();
        assert_abs_diff_eq!(first.e_tot, second.e_tot, epsilon = 1e-12);
        assert_abs_diff_eq!((&first.active_fock - &second.active_fock).l2_norm(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!((&first.one_rdm_corr_loc - &second.one_rdm_corr_loc).l2_norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_two_fragments_share_the_idempotent_space() {
        let ints = chain_ints(6, EriSource::InCore, LocalIntegralsFlags::default());
        let device = DeviceTsr::default();
        let mo = loc2mo(&ints);
        let pick = |idx: &[usize]| crate::la::select_columns(&mo.view(), idx);
        let site = |range: std::ops::Range<usize>| columns(&eye(6, &device).view(), range);

        // HOMO-1 and LUMO+1 on the left half, HOMO and LUMO on the right half
        let (homo1, homo) = (pick(&[1]), pick(&[2]));
        let mut left = fragment(&ints, pick(&[1, 4]), 2.0_f64 * (&homo1 % homo1.t()));
        left.name = "left".into();
        left.loc2frag = site(0..3);
        let mut right = fragment(&ints, pick(&[2, 3]), 2.0_f64 * (&homo % homo.t()));
        right.name = "right".into();
        right.loc2frag = site(3..6);
        let corr_sum = &left.one_rdm_corr_loc + &right.one_rdm_corr_loc;
        let amos = [left.loc2amo.to_owned(), right.loc2amo.to_owned()];

        let state = ints.setup_core_scf(&[left, right]).unwrap();
        assert_eq!(state.mode, EmbeddingMode::Embedded);
        assert_eq!(state.nelec_idem, 2);
        assert_eq!(state.loc2idem.shape(), &[6, 2]);
        for amo in &amos {
            let (orthogonal, err) = are_bases_orthogonal(&state.loc2idem.view(), &amo.view(), 1e-8);
            assert!(orthogonal, "idempotent space overlaps a fragment: {err:.3e}");
        }
        assert_abs_diff_eq!((&state.one_rdm_corr_loc - &corr_sum).l2_norm(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(state.one_rdm_loc.diagonal(None).sum(), 6.0, epsilon = 1e-8);
        assert_abs_diff_eq!(state.e_tot, ints.mean_field().e_tot, epsilon = 1e-8);
    }

    #[test]
    fn test_unconverged_constrained_scf_is_a_status() {
        let _ = env_logger::builder().is_test(true).try_init();
        let model = ModelHamiltonian::hubbard_chain(6, 1.0, 2.0);
        let mf = MeanFieldReference::from_model(model, EriSource::InCore, &ScfFlags::default());
        let scf = ScfFlags { max_cycle: 1, conv_tol_e: 0.0, conv_tol_dm: 0.0, ..Default::default() };
        let flags = LocalIntegralsFlags { scf, ..Default::default() };
        let ints = LocalIntegrals::new(mf, &(0..6).collect::<Vec<_>>(), flags).unwrap();

        let state = ints.setup_core_scf(&[frontier_fragment(&ints)]).unwrap();
        let status = state.scf.as_ref().unwrap();
        assert!(!status.converged);
        assert_eq!(status.niter, 1);
        assert_eq!(state.nelec_idem, 4);
        assert_abs_diff_eq!(state.one_rdm_loc.diagonal(None).sum(), 6.0, epsilon = 1e-8);
    }

    #[test]
    fn test_backends_give_the_same_state() {
        let direct_flags = LocalIntegralsFlags { max_memory: Some(0.0), ..Default::default() };
        let backends = [
            chain_ints(6, EriSource::DensityFitted, LocalIntegralsFlags::default()),
            chain_ints(6, EriSource::InCore, LocalIntegralsFlags::default()),
            chain_ints(6, EriSource::Engine, LocalIntegralsFlags::default()),
            chain_ints(6, EriSource::Engine, direct_flags),
        ];
        let states = backends.iter().map(|ints| ints.setup_core_scf(&[frontier_fragment(ints)]).unwrap()).collect::<Vec<_>>();
        for state in &states[1..] {
            assert_abs_diff_eq!(state.e_tot, states[0].e_tot, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_nonintegral_correlated_density() {
        let ints = chain_ints(4, EriSource::InCore, LocalIntegralsFlags::default());
        let mut frag = frontier_fragment(&ints);
        frag.one_rdm_corr_loc = 0.75_f64 * &frag.one_rdm_corr_loc;
        assert!(matches!(ints.setup_core_scf(&[frag]), Err(EmbeddingError::NonIntegralCorrelatedElectrons { .. })));
    }

    #[test]
    fn test_odd_idempotent_electrons() {
        let ints = chain_ints(4, EriSource::InCore, LocalIntegralsFlags::default());
        let mut frag = frontier_fragment(&ints);
        frag.one_rdm_corr_loc = 0.5_f64 * &frag.one_rdm_corr_loc;
        assert!(matches!(ints.setup_core_scf(&[frag]), Err(EmbeddingError::InvalidIdempotentElectrons { nelec: 3 })));
    }

    #[test]
    fn test_fragment_dimension_mismatch() {
        let ints = chain_ints(4, EriSource::InCore, LocalIntegralsFlags::default());
        let mut frag = frontier_fragment(&ints);
        frag.loc2amo = rt::zeros(([5, 2], &DeviceTsr::default()));
        assert!(matches!(ints.setup_core_scf(&[frag]), Err(EmbeddingError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_cumulant_energy() {
        let ints = chain_ints(6, EriSource::InCore, LocalIntegralsFlags::default());
        let mut frag = frontier_fragment(&ints);
        let v = ints.dmet_tei(&frag.loc2amo.view(), None).unwrap();
        let cumulant = 0.01_f64 * &v;
        let e2_expected = 0.5 * (&v * &cumulant).sum();
        frag.two_cdm_amo = Some(cumulant);
        let state = ints.setup_core_scf(&[frag.clone()]).unwrap();
        assert_abs_diff_eq!(state.e2_cum[0], e2_expected, epsilon = 1e-12);
        assert_abs_diff_eq!(state.e_tot, ints.mean_field().e_tot + e2_expected, epsilon = 1e-8);

        // a precomputed value wins
        frag.e2_cum = Some(-0.25);
        let state = ints.setup_core_scf(&[frag]).unwrap();
        assert_abs_diff_eq!(state.e2_cum[0], -0.25);
    }

    #[test]
    fn test_enforced_symmetry() {
        let flags = LocalIntegralsFlags { enforce_symmetry: true, ..Default::default() };
        let ints = chain_ints(6, EriSource::InCore, flags);
        assert_eq!(ints.loc2symm().len(), 2);
        let state = ints.setup_core_scf(&[frontier_fragment(&ints)]).unwrap();
        assert_abs_diff_eq!(state.e_tot, ints.mean_field().e_tot, epsilon = 1e-8);

        let adapted = symmetry_adapted_subspace(&state.loc2idem, ints.loc2symm(), 1e-8).unwrap();
        let (basis, labels) = adapted.unwrap();
        assert_eq!(labels.len(), 4);
        assert!(measure_subspace_blockbreaking(&basis.view(), ints.loc2symm()) < 1e-8);
    }

    #[test]
    fn test_aufbau_density_and_impurity_guess() {
        let ints = chain_ints(6, EriSource::InCore, LocalIntegralsFlags::default());
        let state = ints.setup_core_scf(&[frontier_fragment(&ints)]).unwrap();
        let dm = ints.aufbau_density(&state, &state.loc_rhf_fock().view(), None, None).unwrap();
        assert_abs_diff_eq!(dm.diagonal(None).sum(), 6.0, epsilon = 1e-8);
        assert_abs_diff_eq!((&dm - &state.one_rdm_loc).l2_norm(), 0.0, epsilon = 1e-6);

        let loc2dmet = eye(6, &DeviceTsr::default());
        let guess = ints.dmet_init_guess_rhf(&state, &loc2dmet.view(), 4, 2, 2, 0.1).unwrap();
        assert_eq!(guess.shape(), &[4, 4]);
        assert_abs_diff_eq!(guess.diagonal(None).sum(), 4.0, epsilon = 1e-10);
        assert!(crate::la::MatrixTolerance::default().is_idempotent(&(0.5_f64 * &guess).view()));
    }

    #[test]
    fn test_trial_natural_orbitals() {
        let ints = chain_ints(6, EriSource::InCore, LocalIntegralsFlags::default());
        let frag = frontier_fragment(&ints);
        let loc2amo = frag.loc2amo.to_owned();
        let state = ints.setup_core_scf(&[frag]).unwrap();
        let nos = ints.get_trial_nos(&state, Some(&loc2amo.view()), None).unwrap();
        assert_eq!(nos.loc2no.shape(), &[6, 6]);
        assert!(is_basis_orthonormal(&nos.loc2no.view(), 1e-8));
        assert_abs_diff_eq!(nos.occ_no.iter().sum::<f64>(), 6.0, epsilon = 1e-8);
        assert_abs_diff_eq!(nos.occ_no[2], 2.0, epsilon = 1e-8);
        assert_abs_diff_eq!(nos.occ_no[3], 0.0, epsilon = 1e-8);
        assert_eq!(nos.ene_no[2], 0.0);
        assert_eq!(nos.labels.len(), 6);

        // without an active subspace the natural orbitals are the canonical ones
        let full = ints.restore_full_system();
        let nos = ints.get_trial_nos(&full, None, None).unwrap();
        assert_eq!(nos.occ_no, vec![2.0, 2.0, 2.0, 0.0, 0.0, 0.0]);
        let mo_energy = ints.mean_field().mo_energy.to_vec();
        for (e, e_ref) in nos.ene_no.iter().zip(mo_energy) {
            assert_abs_diff_eq!(*e, e_ref, epsilon = 1e-6);
        }
    }
}
