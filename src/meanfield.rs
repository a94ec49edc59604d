//! Converged mean-field reference consumed by [`crate::localintegrals::LocalIntegrals`].

use crate::la::from_rows;
use crate::prelude::*;
use crate::rhf::solve_rhf;

/// AO integral library behind the mean-field reference.
pub trait IntegralEngine {
    fn nao(&self) -> usize;

    /// Full AO two-electron tensor `(uv|ls)`, `[nao, nao, nao, nao]`, recomputed on every call.
    fn int2e(&self) -> Tsr;

    /// Dipole (position) integrals `[3, nao, nao]`, if the library provides them.
    fn dipole(&self) -> Option<Tsr> {
        None
    }
}

impl IntegralEngine for CInt {
    fn nao(&self) -> usize {
        CInt::nao(self)
    }

    fn int2e(&self) -> Tsr {
        util::intor_row_major(self, "int2e")
    }

    fn dipole(&self) -> Option<Tsr> {
        Some(util::intor_row_major(self, "int1e_r"))
    }
}

/// Point-group information: irrep-adapted AO coefficient blocks.
#[derive(Debug, Clone)]
pub struct SymmetryInfo {
    pub group: String,
    pub irrep_names: Vec<String>,
    pub symm_orb: Vec<Tsr>,
}

/// Which two-electron data the reference keeps around besides its integral engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EriSource {
    DensityFitted,
    InCore,
    Engine,
}

pub struct MeanFieldReference {
    pub mo_coeff: Tsr,
    pub mo_occ: Tsr,
    pub mo_energy: Tsr,
    pub hcore: Tsr,
    pub ovlp: Tsr,
    pub e_nuc: f64,
    pub e_tot: f64,
    pub nelectron: usize,

    /// Memory ceiling in MB.
    pub max_memory: f64,

    /// In-core AO two-electron tensor.
    pub eri: Option<Tsr>,

    /// Cholesky-decomposed three-center integrals `[naux, nao, nao]`.
    pub cderi: Option<Tsr>,

    pub symmetry: Option<SymmetryInfo>,
    pub engine: Box<dyn IntegralEngine>,

    pub status: Option<ScfStatus>,
}

impl std::fmt::Debug for MeanFieldReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeanFieldReference")
            .field("nao", &self.nao())
            .field("nelectron", &self.nelectron)
            .field("e_tot", &self.e_tot)
            .field("eri", &self.eri.is_some())
            .field("cderi", &self.cderi.is_some())
            .field("symmetry", &self.symmetry.as_ref().map(|s| s.group.as_str()))
            .finish()
    }
}

pub const DEFAULT_MAX_MEMORY: f64 = 4000.0;

impl MeanFieldReference {
    /// Reference without orbitals; call [`Self::with_orbitals`] or [`Self::run_rhf`] next.
    pub fn bare(
        engine: Box<dyn IntegralEngine>,
        hcore: Tsr,
        ovlp: Tsr,
        e_nuc: f64,
        nelectron: usize,
        eri: Option<Tsr>,
        cderi: Option<Tsr>,
    ) -> Self {
        let nao = engine.nao();
        let device = hcore.device().clone();
        Self {
            mo_coeff: rt::zeros(([nao, 0], &device)),
            mo_occ: rt::zeros(([0], &device)),
            mo_energy: rt::zeros(([0], &device)),
            hcore,
            ovlp,
            e_nuc,
            e_tot: e_nuc,
            nelectron,
            max_memory: DEFAULT_MAX_MEMORY,
            eri,
            cderi,
            symmetry: None,
            engine,
            status: None,
        }
    }

    /// RHF (or RI-RHF when `aux` is given) on a libcint molecule.
    pub fn from_cint(cint: CInt, aux: Option<&CInt>, flags: &ScfFlags) -> Self {
        let mut mf = Self::bare_cint(cint, aux);
        mf.run_rhf(flags);
        mf
    }

    /// Integrals of a libcint molecule without orbitals.
    pub fn bare_cint(cint: CInt, aux: Option<&CInt>) -> Self {
        let hcore = util::intor_row_major(&cint, "int1e_kin") + util::intor_row_major(&cint, "int1e_nuc");
        let ovlp = util::intor_row_major(&cint, "int1e_ovlp");
        let e_nuc = util::get_energy_nuc(&cint);
        info!("Nuclear repulsion energy: {e_nuc}");
        let nelectron = cint.atom_charges().into_iter().sum::<f64>().round() as usize;
        let (eri, cderi) = match aux {
            Some(aux) => (None, Some(util::get_cderi(&cint, aux))),
            None => (Some(util::intor_row_major(&cint, "int2e")), None),
        };
        Self::bare(Box::new(cint), hcore, ovlp, e_nuc, nelectron, eri, cderi)
    }

    /// RHF on a model chain, keeping the two-electron data named by `source`.
    pub fn from_model(model: ModelHamiltonian, source: EriSource, flags: &ScfFlags) -> Self {
        let hcore = model.hcore();
        let ovlp = model.ovlp();
        let (eri, cderi) = match source {
            EriSource::DensityFitted => (None, Some(model.cderi())),
            EriSource::InCore => (Some(model.int2e()), None),
            EriSource::Engine => (None, None),
        };
        let symmetry = Some(model.reflection_symmetry());
        let (e_nuc, nelectron) = (model.e_nuc, model.nelectron);
        let mut mf = Self::bare(Box::new(model), hcore, ovlp, e_nuc, nelectron, eri, cderi);
        mf.symmetry = symmetry;
        mf.run_rhf(flags);
        mf
    }

    pub fn run_rhf(&mut self, flags: &ScfFlags) -> &mut Self {
        let nocc = self.nelectron / 2;
        let results = solve_rhf(&self.hcore, &self.ovlp, self.e_nuc, nocc, |dm| self.get_veff(dm), flags);
        self.mo_coeff = results.mo_coeff;
        self.mo_occ = results.mo_occ;
        self.mo_energy = results.mo_energy;
        self.e_tot = results.e_tot;
        self.status = Some(results.status);
        self
    }

    /// Install externally converged orbitals; orbital energies and total energy are recomputed.
    pub fn with_orbitals(mut self, mo_coeff: Tsr, mo_occ: Tsr) -> Self {
        self.mo_coeff = mo_coeff;
        self.mo_occ = mo_occ;
        let dm = self.make_rdm1();
        let veff = self.get_veff(&dm.view());
        let fock = &self.hcore + &veff;
        let e_elec = (&dm * (&self.hcore + 0.5_f64 * &veff)).sum();
        let fock_mo = crate::basis::represent_operator_in_basis(&fock.view(), &self.mo_coeff.view());
        let nmo = fock_mo.shape()[0];
        self.mo_energy = if nmo == 0 { rt::zeros(([0], self.hcore.device())) } else { fock_mo.diagonal(None).to_owned() };
        self.e_tot = self.e_nuc + e_elec;
        self.status = None;
        self
    }

    pub fn with_max_memory(mut self, max_memory: f64) -> Self {
        self.max_memory = max_memory;
        self
    }

    pub fn nao(&self) -> usize {
        self.hcore.shape()[0]
    }

    pub fn nmo(&self) -> usize {
        self.mo_coeff.shape()[1]
    }

    /// `C diag(occ) C^T`.
    pub fn make_rdm1(&self) -> Tsr {
        Self::rdm1_from_occ(&self.mo_coeff, &self.mo_occ.to_vec())
    }

    pub(crate) fn rdm1_from_occ(mo_coeff: &Tsr, occ: &[f64]) -> Tsr {
        let (nao, nmo) = (mo_coeff.shape()[0], mo_coeff.shape()[1]);
        let occ_diag = from_rows((0..nmo * nmo).map(|i| if i / nmo == i % nmo { occ[i / nmo] } else { 0.0 }).collect(), nmo, nmo, mo_coeff.device());
        if nmo == 0 {
            return rt::zeros(([nao, nao], mo_coeff.device()));
        }
        mo_coeff % occ_diag % mo_coeff.t()
    }

    /// Coulomb and exchange matrices of a symmetric AO density.
    ///
    /// Density-fitted factors are preferred over a stored tensor, which is preferred over
    /// regenerating the tensor from the integral engine.
    pub fn get_jk(&self, dm: &TsrView) -> (Tsr, Tsr) {
        let nao = self.nao();
        if nao == 0 {
            return (dm.to_owned(), dm.to_owned());
        }
        if let Some(cderi) = &self.cderi {
            let naux = cderi.shape()[0];
            let cderi_flat = cderi.reshape([naux, nao * nao]);
            let rho = &cderi_flat % dm.reshape(nao * nao);
            let vj = (cderi_flat.t() % rho).into_shape([nao, nao]);
            let mut vk: Tsr = rt::zeros(([nao, nao], dm.device()));
            for p in 0..naux {
                let b = cderi.i(p);
                vk += &b % dm % &b;
            }
            return (vj, vk);
        }
        let jk_from_eri = |eri: &Tsr| -> (Tsr, Tsr) {
            let vj = (eri * dm).sum_axes([-1, -2]);
            let vk = (eri.swapaxes(1, 2) * dm).sum_axes([-1, -2]);
            (vj, vk)
        };
        match &self.eri {
            Some(eri) => jk_from_eri(eri),
            None => jk_from_eri(&self.engine.int2e()),
        }
    }

    /// `J - K/2` of a closed-shell density.
    pub fn get_veff(&self, dm: &TsrView) -> Tsr {
        let (vj, vk) = self.get_jk(dm);
        vj - 0.5_f64 * vk
    }

    pub fn get_fock(&self, dm: &TsrView) -> Tsr {
        &self.hcore + self.get_veff(dm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_jk_backends_agree() {
        let model = ModelHamiltonian::hubbard_chain(5, 1.0, 2.0);
        let flags = ScfFlags::default();
        let mf_df = MeanFieldReference::from_model(model.clone(), EriSource::DensityFitted, &flags);
        let mf_eri = MeanFieldReference::from_model(model.clone(), EriSource::InCore, &flags);
        let mf_direct = MeanFieldReference::from_model(model, EriSource::Engine, &flags);
        let dm = mf_df.make_rdm1();
        let (vj0, vk0) = mf_df.get_jk(&dm.view());
        for mf in [&mf_eri, &mf_direct] {
            let (vj, vk) = mf.get_jk(&dm.view());
            assert_abs_diff_eq!((vj - &vj0).l2_norm(), 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!((vk - &vk0).l2_norm(), 0.0, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(mf_df.e_tot, mf_eri.e_tot, epsilon = 1e-9);
        assert!(mf_df.status.as_ref().is_some_and(|s| s.converged));
    }

    #[test]
    fn test_with_orbitals_reproduces_energy() {
        let model = ModelHamiltonian::hubbard_chain(4, 1.0, 1.5);
        let flags = ScfFlags::default();
        let mf = MeanFieldReference::from_model(model, EriSource::InCore, &flags);
        let e_ref = mf.e_tot;
        let (mo_coeff, mo_occ) = (mf.mo_coeff.clone(), mf.mo_occ.clone());
        let mf = mf.with_orbitals(mo_coeff, mo_occ);
        assert_abs_diff_eq!(mf.e_tot, e_ref, epsilon = 1e-10);
        assert_abs_diff_eq!((mf.make_rdm1() * &mf.ovlp).sum(), 4.0, epsilon = 1e-10);
    }
}
