//! Algebra of orbital subspaces represented by (mostly orthonormal) coefficient matrices.
//!
//! A basis `loc2bas` has one row per localized orbital and one column per basis vector. All
//! operations accept zero-column bases.

use crate::la::{column_sq_norms, eigen_control, eye, matmul, orthonormal_completion, scale_columns, select_columns, svd_control};
use crate::prelude::*;

/// `basis^T @ op @ basis`.
///
/// Valid for square and rectangular bases; a basis of zero columns yields a 0x0 operator.
pub fn represent_operator_in_basis(op: &TsrView, basis: &TsrView) -> Tsr {
    matmul(&matmul(&basis.t(), op).view(), basis)
}

/// `bra^T @ op @ ket` for a pair of possibly different bases.
pub fn represent_operator_in_bases(op: &TsrView, bra: &TsrView, ket: &TsrView) -> Tsr {
    matmul(&matmul(&bra.t(), op).view(), ket)
}

/// `P_bra @ op @ P_ket` with `P = B B^T`: the part of `op` living between the two subspaces,
/// kept in the original representation.
pub fn project_operator_into_subspace(op: &TsrView, bra: &TsrView, ket: &TsrView) -> Tsr {
    let proj_bra = matmul(bra, &bra.t());
    let proj_ket = matmul(ket, &ket.t());
    matmul(&matmul(&proj_bra.view(), op).view(), &proj_ket.view())
}

/// `|B^T B - 1|` (Frobenius).
pub fn measure_basis_nonorthonormality(basis: &TsrView) -> f64 {
    let k = basis.shape()[1];
    if k == 0 {
        return 0.0;
    }
    let gram = matmul(&basis.t(), basis);
    (gram - eye(k, basis.device())).l2_norm()
}

pub fn is_basis_orthonormal(basis: &TsrView, atol: f64) -> bool {
    measure_basis_nonorthonormality(basis) < atol
}

/// Orthonormalize the columns of `basis`, dropping numerically null directions.
///
/// Full-rank input is orthonormalized symmetrically, so vectors stay as close as possible to
/// the originals; rank-deficient input falls back to canonical orthonormalization.
pub fn orthonormalize_a_basis(basis: &TsrView, num_zero_atol: f64) -> Result<Tsr> {
    let device = basis.device().clone();
    let (n, k) = (basis.shape()[0], basis.shape()[1]);
    if k == 0 {
        return Ok(rt::zeros(([n, 0], &device)));
    }
    let gram = matmul(&basis.t(), basis);
    let res = eigen_control(&gram.view(), &EigenControl::sorted(SortOrder::Descending))?;
    let keep = (0..k).filter(|&i| res.evals[i] > num_zero_atol).collect::<Vec<_>>();
    let evecs = select_columns(&res.evecs.view(), &keep);
    let inv_sqrt = keep.iter().map(|&i| 1.0 / res.evals[i].sqrt()).collect::<Vec<_>>();
    let scaled = scale_columns(&evecs.view(), &inv_sqrt);
    let x = if keep.len() == k { matmul(&scaled.view(), &evecs.t()) } else { scaled };
    Ok(matmul(basis, &x.view()))
}

/// Orthonormal basis spanning the orthogonal complement of the column space of `basis`.
///
/// The ambient space is assumed orthonormal (localized orbitals). An empty input yields the
/// identity, a complete input yields an `n x 0` basis.
pub fn get_complementary_states(basis: &TsrView, num_zero_atol: f64) -> Result<Tsr> {
    let n = basis.shape()[0];
    let basis = if measure_basis_nonorthonormality(basis) > num_zero_atol {
        orthonormalize_a_basis(basis, num_zero_atol)?
    } else {
        basis.to_owned()
    };
    if basis.shape()[1] == n {
        return Ok(rt::zeros(([n, 0], basis.device())));
    }
    let compl = orthonormal_completion(&basis.view());
    // remove the residual overlap with the input and re-orthonormalize
    let residual = matmul(&basis.view(), &matmul(&basis.t(), &compl.view()).view());
    let compl = compl - residual;
    orthonormalize_a_basis(&compl.view(), num_zero_atol)
}

/// Whether the two bases are mutually orthogonal, and the Frobenius norm of `a^T b`.
pub fn are_bases_orthogonal(a: &TsrView, b: &TsrView, atol: f64) -> (bool, f64) {
    let ovlp = matmul(&a.t(), b);
    let err = if ovlp.size() == 0 { 0.0 } else { ovlp.l2_norm() };
    (err < atol, err)
}

/// Singular values of the cross-overlap `a^T b`, largest first.
pub fn get_overlapping_states(a: &TsrView, b: &TsrView) -> Result<Vec<f64>> {
    let ovlp = matmul(&a.t(), b);
    Ok(svd_control(&ovlp.view(), &EigenControl::sorted(SortOrder::Descending))?.svals)
}

/// Weight of every subspace vector on every irrep basis: `weights[i][v] = |irrep_i^T v|^2`.
fn irrep_weights(subspace: &TsrView, irrep_bases: &[Tsr]) -> Vec<Vec<f64>> {
    irrep_bases
        .iter()
        .map(|ir| {
            column_sq_norms(&matmul(&ir.t(), subspace).view())
        })
        .collect()
}

/// Dominant irrep label of each subspace vector.
pub fn get_subspace_symmetry_blocks(subspace: &TsrView, irrep_bases: &[Tsr]) -> Vec<usize> {
    let weights = irrep_weights(subspace, irrep_bases);
    (0..subspace.shape()[1])
        .map(|v| {
            (0..irrep_bases.len()).max_by(|&a, &b| weights[a][v].total_cmp(&weights[b][v])).unwrap_or(0)
        })
        .collect()
}

/// Largest weight any subspace vector carries outside its dominant irrep.
pub fn measure_subspace_blockbreaking(subspace: &TsrView, irrep_bases: &[Tsr]) -> f64 {
    let weights = irrep_weights(subspace, irrep_bases);
    let labels = get_subspace_symmetry_blocks(subspace, irrep_bases);
    labels
        .iter()
        .enumerate()
        .map(|(v, &lbl)| (0..irrep_bases.len()).filter(|&i| i != lbl).map(|i| weights[i][v]).sum::<f64>())
        .fold(0.0, f64::max)
}

/// Trace of `dm` represented in `basis`.
pub fn compute_nelec_in_subspace(dm: &TsrView, basis: &TsrView) -> f64 {
    let dm_sub = represent_operator_in_basis(dm, basis);
    if dm_sub.size() == 0 { 0.0 } else { dm_sub.diagonal(None).sum() }
}

/// `(m + m^T) / 2`.
pub fn symmetrize_matrix(m: &TsrView) -> Tsr {
    0.5_f64 * (m.to_owned() + m.t())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::la::from_rows;
    use approx::assert_abs_diff_eq;

    fn rotation(theta: f64, device: &DeviceTsr) -> Tsr {
        let (c, s) = (theta.cos(), theta.sin());
        #[rustfmt::skip]
        let data = vec![
            c, -s, 0.0, 0.0,
            s, c, 0.0, 0.0,
            0.0, 0.0, c, s,
            0.0, 0.0, -s, c,
        ];
        from_rows(data, 4, 4, device)
    }

    #[test]
    fn test_represent_round_trip() {
        let device = DeviceTsr::default();
        let u = rotation(0.3, &device);
        let op = from_rows((0..16).map(|i| ((i * 7) % 5) as f64).collect(), 4, 4, &device);
        let op = symmetrize_matrix(&op.view());
        let rep = represent_operator_in_basis(&op.view(), &u.view());
        let back = represent_operator_in_basis(&rep.view(), &u.t());
        assert_abs_diff_eq!((back - &op).l2_norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_complement_is_orthogonal() {
        let device = DeviceTsr::default();
        let u = rotation(0.7, &device);
        let sub = u.i((.., 0..3)).to_owned();
        let sub = (&sub + 0.05_f64 * eye(4, &device).i((.., 0..3))).to_owned();
        let compl = get_complementary_states(&sub.view(), 1e-8).unwrap();
        assert_eq!(compl.shape()[1], 1);
        assert!(is_basis_orthonormal(&compl.view(), 1e-10));
        let svals = get_overlapping_states(&compl.view(), &sub.view()).unwrap();
        assert!(svals.iter().all(|&s| s < 1e-8));
        let (ortho, err) = are_bases_orthogonal(&compl.view(), &sub.view(), 1e-8);
        assert!(ortho, "residual overlap {err}");
    }

    #[test]
    fn test_complement_edge_cases() {
        let device = DeviceTsr::default();
        let empty: Tsr = rt::zeros(([4, 0], &device));
        let full = get_complementary_states(&empty.view(), 1e-8).unwrap();
        assert!(crate::la::is_matrix_eye(&full.view()));
        let none = get_complementary_states(&rotation(0.1, &device).view(), 1e-8).unwrap();
        assert_eq!(none.shape()[1], 0);
        assert!(get_overlapping_states(&none.view(), &full.view()).unwrap().is_empty());
    }

    #[test]
    fn test_project_operator_into_subspace() {
        let device = DeviceTsr::default();
        let id = eye(4, &device);
        let op = from_rows((0..16).map(|i| i as f64).collect(), 4, 4, &device);
        let bra = id.i((.., 0..2));
        let ket = id.i((.., 2..4));
        let proj = project_operator_into_subspace(&op.view(), &bra, &ket);
        assert_abs_diff_eq!(proj[[0, 2]], 2.0);
        assert_abs_diff_eq!(proj[[2, 0]], 0.0);
        assert_abs_diff_eq!(proj.sum(), 2.0 + 3.0 + 6.0 + 7.0);
    }

    #[test]
    fn test_symmetry_blocks_for_subspace() {
        let device = DeviceTsr::default();
        let id = eye(4, &device);
        let irreps = vec![id.i((.., 0..2)).to_owned(), id.i((.., 2..4)).to_owned()];
        let u = rotation(0.2, &device);
        let labels = get_subspace_symmetry_blocks(&u.view(), &irreps);
        assert_eq!(labels, vec![0, 0, 1, 1]);
        assert_abs_diff_eq!(measure_subspace_blockbreaking(&u.view(), &irreps), 0.0, epsilon = 1e-14);
        let orth = orthonormalize_a_basis(&(2.0_f64 * &u).view(), 1e-8).unwrap();
        assert!(is_basis_orthonormal(&orth.view(), 1e-10));
    }
}
