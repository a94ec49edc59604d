use crate::diis::DIISIncore;
use crate::la::{eigen_control, eigen_control_labeled, select_columns};
use crate::prelude::*;

/// Closed-shell density `2 C_occ C_occ^T` from the first `nocc` columns.
pub fn closed_shell_density(mo_coeff: &TsrView, nocc: usize) -> Tsr {
    let occ = mo_coeff.i((.., ..nocc));
    2.0_f64 * crate::la::matmul(&occ, &occ.t())
}

/// Restricted Hartree-Fock in a non-orthogonal AO basis, DIIS-accelerated.
///
/// `get_veff` maps an AO density to `J - K/2`.
pub fn solve_rhf(
    hcore: &Tsr,
    ovlp: &Tsr,
    e_nuc: f64,
    nocc: usize,
    get_veff: impl Fn(&TsrView) -> Tsr,
    flags: &ScfFlags,
) -> RHFResults {
    let time = std::time::Instant::now();
    let device = hcore.device().clone();
    let nao = hcore.shape()[0];

    let mut diis = DIISIncore::new(flags.diis.clone(), &device);
    let (mut mo_energy, mut mo_coeff): (Tsr, Tsr) = rt::linalg::eigh((hcore.view(), ovlp.view())).into();
    let mut dm = closed_shell_density(&mo_coeff.view(), nocc);
    let mut veff = get_veff(&dm.view());
    let mut e_elec = (&dm * (hcore + 0.5_f64 * &veff)).sum();
    let mut status = ScfStatus { converged: false, niter: 0, e_tot: e_nuc + e_elec, ddm: f64::INFINITY };

    for niter in 1..=flags.max_cycle {
        let fock = hcore + &veff;
        let err = &fock % &dm % ovlp - ovlp % &dm % &fock;
        let fock = diis.update(fock, err);
        (mo_energy, mo_coeff) = rt::linalg::eigh((fock.view(), ovlp.view())).into();

        let dm_new = closed_shell_density(&mo_coeff.view(), nocc);
        veff = get_veff(&dm_new.view());
        let e_new = (&dm_new * (hcore + 0.5_f64 * &veff)).sum();
        let ddm = (&dm_new - &dm).l2_norm();
        let de = e_new - e_elec;
        debug!("RHF iter {niter:3}: E = {:20.12}, dE = {de:10.3e}, |dD| = {ddm:10.3e}", e_new + e_nuc);

        dm = dm_new;
        e_elec = e_new;
        status = ScfStatus { converged: de.abs() < flags.conv_tol_e && ddm < flags.conv_tol_dm, niter, e_tot: e_nuc + e_elec, ddm };
        if status.converged {
            break;
        }
    }

    let e_tot = e_nuc + e_elec;
    if status.converged {
        info!("RHF converged in {} iterations, E = {e_tot}", status.niter);
    } else {
        warn!("RHF not converged after {} iterations, |dD| = {:.3e}", status.niter, status.ddm);
    }
    info!("Total elec energy: {e_elec}");
    info!("Elapsed time for RHF: {:.2?}", time.elapsed());

    let mut mo_occ: Tsr = rt::zeros(([nao], &device));
    mo_occ.i_mut(..nocc).fill(2.0);
    RHFResults { mo_coeff, mo_energy, mo_occ, dm, e_nuc, e_elec, e_tot, status }
}

/// Subspace of an orthonormal basis in which the constrained mean-field problem is solved.
pub struct WorkingSpace<'a> {
    /// One-body operator represented in the working basis.
    pub oei: &'a Tsr,

    /// AO coefficients of the working basis (orthonormal under the AO metric).
    pub ao2wrk: &'a Tsr,

    /// Energy shift added to the one- and two-body energy of the working density.
    pub e_const: f64,

    /// Number of doubly occupied orbitals.
    pub nocc: usize,

    /// Symmetry label of every working-basis vector; diagonalization respects these blocks.
    pub labels: Option<&'a [usize]>,
}

impl WorkingSpace<'_> {
    fn aufbau(&self, fock: &Tsr) -> Result<Tsr> {
        let options = EigenControl::sorted(SortOrder::Ascending);
        let res = match self.labels {
            Some(labels) => eigen_control_labeled(&fock.view(), labels, &options)?,
            None => eigen_control(&fock.view(), &options)?,
        };
        let occ = select_columns(&res.evecs.view(), &(0..self.nocc).collect::<Vec<_>>());
        Ok(closed_shell_density(&occ.view(), self.nocc))
    }

    fn veff(&self, dm_wrk: &Tsr, get_veff_ao: &impl Fn(&TsrView) -> Tsr) -> Tsr {
        let dm_ao = represent_operator_in_basis(&dm_wrk.view(), &self.ao2wrk.t());
        represent_operator_in_basis(&get_veff_ao(&dm_ao.view()).view(), &self.ao2wrk.view())
    }
}

/// Closed-shell SCF restricted to a working subspace, with the rest of the system frozen
/// into `space.oei` and `space.e_const`.
///
/// Returns the working-basis density and the convergence status. Non-convergence is logged
/// and reported through the status only.
pub fn solve_constrained_rhf(
    space: &WorkingSpace,
    guess: Option<&Tsr>,
    get_veff_ao: impl Fn(&TsrView) -> Tsr,
    flags: &ScfFlags,
) -> Result<(Tsr, ScfStatus)> {
    let nwrk = space.oei.shape()[0];
    if space.ao2wrk.shape()[1] != nwrk {
        return Err(EmbeddingError::DimensionMismatch {
            context: "working basis of the constrained mean-field problem".into(),
            expected: nwrk,
            found: space.ao2wrk.shape()[1],
        });
    }
    if space.nocc > nwrk {
        return Err(EmbeddingError::DimensionMismatch {
            context: "occupied orbitals in the working space".into(),
            expected: nwrk,
            found: space.nocc,
        });
    }
    let device = space.oei.device().clone();
    if nwrk == 0 || space.nocc == 0 {
        let dm: Tsr = rt::zeros(([nwrk, nwrk], &device));
        return Ok((dm, ScfStatus { converged: true, niter: 0, e_tot: space.e_const, ddm: 0.0 }));
    }

    let mut dm = match guess {
        Some(guess) => guess.to_owned(),
        None => space.aufbau(space.oei)?,
    };
    let mut veff = space.veff(&dm, &get_veff_ao);
    let energy = |dm: &Tsr, veff: &Tsr| space.e_const + (dm * (space.oei + 0.5_f64 * veff)).sum();
    let mut e_tot = energy(&dm, &veff);
    let mut diis = DIISIncore::new(flags.diis.clone(), &device);
    let mut status = ScfStatus { converged: false, niter: 0, e_tot, ddm: f64::INFINITY };

    for niter in 1..=flags.max_cycle {
        let fock = space.oei + &veff;
        let err = &fock % &dm - &dm % &fock;
        let fock = diis.update(fock, err);
        let dm_new = space.aufbau(&fock)?;
        veff = space.veff(&dm_new, &get_veff_ao);
        let e_new = energy(&dm_new, &veff);
        let ddm = (&dm_new - &dm).l2_norm();
        let de = e_new - e_tot;
        trace!("constrained RHF iter {niter:3}: E = {e_new:20.12}, dE = {de:10.3e}, |dD| = {ddm:10.3e}");
        dm = dm_new;
        e_tot = e_new;
        status = ScfStatus { converged: de.abs() < flags.conv_tol_e && ddm < flags.conv_tol_dm, niter, e_tot, ddm };
        if status.converged {
            break;
        }
    }

    if status.converged {
        debug!("constrained RHF converged in {} iterations, E = {:.10}", status.niter, status.e_tot);
    } else {
        warn!("constrained RHF not converged after {} iterations, |dD| = {:.3e}", status.niter, status.ddm);
    }
    Ok((dm, status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meanfield::EriSource;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_constrained_rhf_in_full_space_matches_rhf() {
        let model = ModelHamiltonian::hubbard_chain(6, 1.0, 2.0);
        let flags = ScfFlags::default();
        let mf = MeanFieldReference::from_model(model, EriSource::InCore, &flags);
        // canonical MOs as working basis; the converged density is diag(2, 2, 2, 0, 0, 0)
        let oei = represent_operator_in_basis(&mf.hcore.view(), &mf.mo_coeff.view());
        let space = WorkingSpace { oei: &oei, ao2wrk: &mf.mo_coeff, e_const: mf.e_nuc, nocc: 3, labels: None };
        let (dm, status) = solve_constrained_rhf(&space, None, |dm| mf.get_veff(dm), &flags).unwrap();
        assert!(status.converged);
        assert_abs_diff_eq!(status.e_tot, mf.e_tot, epsilon = 1e-9);
        assert_abs_diff_eq!(dm.diagonal(None).sum(), 6.0, epsilon = 1e-10);
    }

    #[test]
    fn test_constrained_rhf_empty_space() {
        let device = DeviceTsr::default();
        let oei: Tsr = rt::zeros(([0, 0], &device));
        let ao2wrk: Tsr = rt::zeros(([4, 0], &device));
        let space = WorkingSpace { oei: &oei, ao2wrk: &ao2wrk, e_const: -1.5, nocc: 0, labels: None };
        let (dm, status) = solve_constrained_rhf(&space, None, |dm| dm.to_owned(), &ScfFlags::default()).unwrap();
        assert_eq!(dm.shape(), &[0, 0]);
        assert_eq!(status.e_tot, -1.5);
    }
}
