//! Construction of the localized orbital basis `ao2loc`.

use crate::la::{eigen_control, eye, from_rows, scale_columns, to_rows};
use crate::prelude::*;
use itertools::Itertools;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub enum LocalizationMethod {
    /// Symmetric orthogonalization `S^{-1/2}` of the AO basis. Requires the full AO space to be active.
    Lowdin,

    /// Foster-Boys localization of the active molecular orbitals.
    Boys,

    MetaLowdin,
    Iao,

    /// User-supplied AO coefficients.
    Custom(Tsr),
}

impl LocalizationMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lowdin => "lowdin",
            Self::Boys => "boys",
            Self::MetaLowdin => "meta_lowdin",
            Self::Iao => "iao",
            Self::Custom(_) => "custom",
        }
    }
}

impl FromStr for LocalizationMethod {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lowdin" => Ok(Self::Lowdin),
            "boys" => Ok(Self::Boys),
            "meta_lowdin" => Ok(Self::MetaLowdin),
            "iao" => Ok(Self::Iao),
            _ => Err(EmbeddingError::UnsupportedLocalization(s.to_string())),
        }
    }
}

/// AO coefficients of the localized orbitals.
pub fn localize(
    method: &LocalizationMethod,
    mf: &MeanFieldReference,
    active: &[bool],
    ao_rotation: Option<&Tsr>,
) -> Result<Tsr> {
    let nao = mf.nao();
    let norbs_tot = active.iter().filter(|&&a| a).count();
    match method {
        LocalizationMethod::Lowdin => {
            if norbs_tot != nao {
                return Err(EmbeddingError::UnsupportedLocalization(format!(
                    "lowdin needs the full AO space active ({norbs_tot} of {nao} orbitals given)"
                )));
            }
            let ao2loc = lowdin(&mf.ovlp)?;
            Ok(match ao_rotation {
                Some(rot) => &ao2loc % rot.t(),
                None => ao2loc,
            })
        },
        LocalizationMethod::Boys => {
            let dipole = mf.engine.dipole().ok_or_else(|| EmbeddingError::MissingIntegral("int1e_r".into()))?;
            let idx = active.iter().enumerate().filter(|(_, a)| **a).map(|(i, _)| i).collect::<Vec<_>>();
            let ao2act = crate::la::select_columns(&mf.mo_coeff.view(), &idx);
            Ok(boys(&ao2act, &dipole, 100, 1.0e-10))
        },
        LocalizationMethod::Custom(ao2loc) => Ok(ao2loc.to_owned()),
        LocalizationMethod::MetaLowdin | LocalizationMethod::Iao => Err(EmbeddingError::UnsupportedLocalization(format!(
            "{} needs a minimal-basis projection that the integral engine does not provide",
            method.name()
        ))),
    }
}

/// `S^{-1/2}`.
pub fn lowdin(ovlp: &Tsr) -> Result<Tsr> {
    let res = eigen_control(&ovlp.view(), &EigenControl::sorted(SortOrder::Ascending))?;
    let inv_sqrt = res.evals.iter().map(|e| 1.0 / e.sqrt()).collect::<Vec<_>>();
    let scaled = scale_columns(&res.evecs.view(), &inv_sqrt);
    Ok(crate::la::matmul(&scaled.view(), &res.evecs.t()))
}

fn boys_spread(x: &[Vec<f64>], k: usize) -> f64 {
    x.iter().map(|xc| (0..k).map(|i| xc[i * k + i].powi(2)).sum::<f64>()).sum()
}

/// Sum of squared orbital centroids `sum_i |<i|r|i>|^2`, the quantity Foster-Boys maximizes.
pub fn boys_objective(ao2orb: &Tsr, dipole: &Tsr) -> f64 {
    let k = ao2orb.shape()[1];
    let x = (0..3)
        .map(|c| to_rows(&represent_operator_in_basis(&dipole.i(c), &ao2orb.view()).view()).0)
        .collect::<Vec<_>>();
    boys_spread(&x, k)
}

/// Foster-Boys localization by Jacobi sweeps over orbital pairs.
pub fn boys(ao2orb: &Tsr, dipole: &Tsr, max_sweep: usize, tol: f64) -> Tsr {
    let (nao, k) = (ao2orb.shape()[0], ao2orb.shape()[1]);
    if k < 2 {
        return ao2orb.to_owned();
    }
    let mut x = (0..3)
        .map(|c| to_rows(&represent_operator_in_basis(&dipole.i(c), &ao2orb.view()).view()).0)
        .collect::<Vec<_>>();
    let (mut coeff, ..) = to_rows(&ao2orb.view());

    for sweep in 0..max_sweep {
        let mut max_angle = 0.0_f64;
        for i in 0..k {
            for j in i + 1..k {
                let (mut a, mut b) = (0.0, 0.0);
                for xc in &x {
                    let (xii, xjj, xij) = (xc[i * k + i], xc[j * k + j], xc[i * k + j]);
                    a += xij * xij - 0.25 * (xii - xjj).powi(2);
                    b += xij * (xii - xjj);
                }
                if a.hypot(b) < 1.0e-14 {
                    continue;
                }
                let gamma = 0.25 * b.atan2(-a);
                if gamma.abs() < 1.0e-14 {
                    continue;
                }
                max_angle = max_angle.max(gamma.abs());
                let (cs, sn) = (gamma.cos(), gamma.sin());
                // i' = c i + s j ; j' = -s i + c j
                for r in 0..nao {
                    let (ci, cj) = (coeff[r * k + i], coeff[r * k + j]);
                    coeff[r * k + i] = cs * ci + sn * cj;
                    coeff[r * k + j] = -sn * ci + cs * cj;
                }
                for xc in x.iter_mut() {
                    for m in 0..k {
                        let (mi, mj) = (xc[m * k + i], xc[m * k + j]);
                        xc[m * k + i] = cs * mi + sn * mj;
                        xc[m * k + j] = -sn * mi + cs * mj;
                    }
                    for m in 0..k {
                        let (im, jm) = (xc[i * k + m], xc[j * k + m]);
                        xc[i * k + m] = cs * im + sn * jm;
                        xc[j * k + m] = -sn * im + cs * jm;
                    }
                }
            }
        }
        trace!("Boys sweep {sweep}: spread = {:.10}, max rotation = {max_angle:.3e}", boys_spread(&x, k));
        if max_angle < tol {
            debug!("Boys localization converged after {} sweeps", sweep + 1);
            break;
        }
    }
    from_rows(coeff, nao, k, ao2orb.device())
}

/// Orthonormal irrep blocks of the localized space, `loc2ir = ao2loc^T S ao2ir`, made mutually
/// orthogonal irrep by irrep.
pub fn symmetry_blocks_in_loc(
    ao2loc: &Tsr,
    ovlp: &Tsr,
    symmetry: Option<&SymmetryInfo>,
    num_zero_atol: f64,
) -> Result<Vec<Tsr>> {
    let norbs = ao2loc.shape()[1];
    let Some(symmetry) = symmetry else {
        return Ok(vec![eye(norbs, ao2loc.device())]);
    };
    let loc_ovlp_ao = ao2loc.t() % ovlp;
    let mut loc2symm = symmetry
        .symm_orb
        .iter()
        .map(|ao2ir| orthonormalize_a_basis(&(&loc_ovlp_ao % ao2ir).view(), num_zero_atol))
        .collect::<Result<Vec<_>>>()?;
    let measure = |blocks: &[Tsr]| {
        let views = blocks.iter().map(|b| b.view()).collect::<Vec<_>>();
        measure_basis_nonorthonormality(&crate::la::hstack(&views, norbs, ao2loc.device()).view())
    };
    info!("Initial loc2symm nonorthonormality: {:.3e}", measure(&loc2symm));
    for (a, b) in (0..loc2symm.len()).tuple_combinations() {
        let proj = crate::la::matmul(&loc2symm[a].view(), &loc2symm[a].t());
        let leak = crate::la::matmul(&proj.view(), &loc2symm[b].view());
        loc2symm[b] = &loc2symm[b] - leak;
    }
    for blk in loc2symm.iter_mut() {
        *blk = orthonormalize_a_basis(&blk.view(), num_zero_atol)?;
    }
    info!("Final loc2symm nonorthonormality: {:.3e}", measure(&loc2symm));
    Ok(loc2symm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meanfield::EriSource;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_parse_methods() {
        assert!(matches!("Lowdin".parse::<LocalizationMethod>(), Ok(LocalizationMethod::Lowdin)));
        assert!(matches!("boys".parse::<LocalizationMethod>(), Ok(LocalizationMethod::Boys)));
        assert!(matches!(
            "pipek_mezey".parse::<LocalizationMethod>(),
            Err(EmbeddingError::UnsupportedLocalization(_))
        ));
    }

    #[test]
    fn test_lowdin_is_orthonormal() {
        let model = ModelHamiltonian::hubbard_chain(5, 1.0, 2.0);
        let ovlp = model.ovlp();
        let x = lowdin(&ovlp).unwrap();
        let gram = x.t() % &ovlp % &x;
        assert!(crate::la::is_matrix_eye(&gram.view()));
        assert!(crate::la::is_matrix_hermitian(&x.view()));
    }

    #[test]
    fn test_boys_increases_spread() {
        let model = ModelHamiltonian::hubbard_chain(6, 1.0, 2.0);
        let mf = MeanFieldReference::from_model(model.clone(), EriSource::InCore, &ScfFlags::default());
        let dipole = model.position();
        let occ = mf.mo_coeff.i((.., ..3)).to_owned();
        let loc = boys(&occ, &dipole, 100, 1.0e-10);
        assert!(boys_objective(&loc, &dipole) >= boys_objective(&occ, &dipole) - 1e-12);
        let gram = loc.t() % &mf.ovlp % &loc;
        assert!(crate::la::is_matrix_eye(&gram.view()));
        // rotation stays inside the occupied space
        let proj_before = &occ % occ.t();
        let proj_after = &loc % loc.t();
        assert_abs_diff_eq!((proj_before - proj_after).l2_norm(), 0.0, epsilon = 1e-10);
    }
}
