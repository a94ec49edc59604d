use crate::la::{from_rows, matmul, to_rows};
use crate::prelude::*;

/* #region libcint */

/// Obtain integrals (in row-major, same to PySCF but reverse of libcint).
///
/// # Usage
///
/// ```norun
/// let tsr = intor_row_major(&cint_data, "int1e_kin");
/// ```
pub fn intor_row_major(cint_data: &CInt, intor: &str) -> Tsr {
    let device = DeviceTsr::default();

    // intor, "s1", full_shls_slice
    let (out, shape) = cint_data.integrate_row_major(intor, None, None).into();

    rt::asarray((out, shape.c(), &device))
}

pub fn intor_3c2e_row_major(cint_data: &CInt, aux_cint_data: &CInt, intor: &str) -> Tsr {
    let device = DeviceTsr::default();

    let (out, shape) = CInt::integrate_cross_row_major(intor, [cint_data, cint_data, aux_cint_data], None, None).into();

    rt::asarray((out, shape.c(), &device))
}

/// Cholesky-decomposed three-center integrals `cderi[P, u, v]` with `(uv|ls) = sum_P cderi[P, u, v] cderi[P, l, s]`.
pub fn get_cderi(cint_data: &CInt, aux_cint_data: &CInt) -> Tsr {
    let nao = cint_data.nao();
    let naux = aux_cint_data.nao();

    let int3c2e = intor_3c2e_row_major(cint_data, aux_cint_data, "int3c2e");
    let int2c2e = intor_row_major(aux_cint_data, "int2c2e");

    let int2c2e_l = rt::linalg::cholesky((int2c2e.view(), Lower));
    let cderi = rt::linalg::solve_triangular((int2c2e_l.view(), int3c2e.reshape([nao * nao, naux]).t(), Lower));
    cderi.into_shape([naux, nao, nao]).into_contig(RowMajor)
}

pub fn get_energy_nuc(cint_data: &CInt) -> f64 {
    let device = DeviceTsr::default();

    let atom_coords = {
        let coords = cint_data.atom_coords();
        let coords = coords.into_iter().flatten().collect::<Vec<f64>>();
        rt::asarray((coords, &device)).into_shape((-1, 3))
    };
    let atom_charges = rt::asarray((cint_data.atom_charges(), &device));
    let mut dist = rt::sci::cdist((atom_coords.view(), atom_coords.view()));
    dist.diagonal_mut(None).fill(f64::INFINITY);
    0.5 * (&atom_charges * atom_charges.i((.., None)) / dist).sum()
}

/* #endregion */

/* #region rank-4 tensors */

/// Contract the first leg of a rank-4 tensor with `coeff` and rotate it to the last position:
/// `out[q, r, s, i] = sum_p eri[p, q, r, s] coeff[p, i]`.
///
/// Applying this four times with the four leg bases performs a full basis change.
pub fn contract_first_leg(eri: &Tsr, coeff: &TsrView) -> Tsr {
    let shape = eri.shape().to_vec();
    let (n0, rest) = (shape[0], shape[1] * shape[2] * shape[3]);
    let m = coeff.shape()[1];
    if n0 * rest * m == 0 {
        return rt::zeros(([shape[1], shape[2], shape[3], m], eri.device()));
    }
    let scr = eri.reshape([n0, rest]).t() % coeff.view();
    scr.into_shape([shape[1], shape[2], shape[3], m])
}

/// Full four-leg basis change `(pq|rs) -> (ij|kl)`.
pub fn transform_eri_legs(eri: &Tsr, coeffs: [&TsrView; 4]) -> Tsr {
    coeffs.into_iter().fold(eri.to_owned(), |acc, c| contract_first_leg(&acc, c))
}

/// Number of lower-triangular pairs of `n` orbitals.
pub fn npair(n: usize) -> usize {
    n * (n + 1) / 2
}

/// Pack a `[n1, n2, n3, n4]` tensor into pair storage.
///
/// `pack_bra` folds the `(i, j)` legs into `i >= j` pairs (requires `n1 == n2`), `pack_ket` does
/// the same for `(k, l)`. The result is 2-D: `[nbra, nket]`.
pub fn pack_eri(eri: &Tsr, pack_bra: bool, pack_ket: bool) -> Tsr {
    let shape = eri.shape().to_vec();
    let (n1, n2, n3, n4) = (shape[0], shape[1], shape[2], shape[3]);
    let data = if eri.size() == 0 { vec![] } else { eri.reshape(-1).to_vec() };

    let pairs = |na: usize, nb: usize, packed: bool| -> Vec<(usize, usize)> {
        if packed {
            (0..na).flat_map(|i| (0..=i).map(move |j| (i, j))).collect()
        } else {
            (0..na).flat_map(|i| (0..nb).map(move |j| (i, j))).collect()
        }
    };
    let bra = pairs(n1, n2, pack_bra);
    let ket = pairs(n3, n4, pack_ket);

    let mut out = Vec::with_capacity(bra.len() * ket.len());
    for &(i, j) in &bra {
        for &(k, l) in &ket {
            out.push(data[((i * n2 + j) * n3 + k) * n4 + l]);
        }
    }
    from_rows(out, bra.len(), ket.len(), eri.device())
}

/// Inverse of [`pack_eri`] for fully packed `[npair, npair]` input of `n` orbitals.
pub fn unpack_eri(packed: &Tsr, n: usize) -> Tsr {
    let (data, _, nket) = to_rows(&packed.view());
    let idx = |i: usize, j: usize| if i >= j { i * (i + 1) / 2 + j } else { j * (j + 1) / 2 + i };
    let mut out = vec![0.0; n * n * n * n];
    for i in 0..n {
        for j in 0..n {
            for k in 0..n {
                for l in 0..n {
                    out[((i * n + j) * n + k) * n + l] = data[idx(i, j) * nket + idx(k, l)];
                }
            }
        }
    }
    if out.is_empty() {
        return rt::zeros(([n, n, n, n], packed.device()));
    }
    rt::asarray((out, vec![n, n, n, n].c(), packed.device()))
}

/// Leg pair in pair-packed form: `t[ij, ab] = c1[i, a] c2[j, b] + c1[j, a] c2[i, b]` for `i > j`
/// and `c1[i, a] c2[i, b]` on the diagonal, giving `[npair, n1 * n2]`.
pub fn pair_transform(c1: &TsrView, c2: &TsrView) -> Tsr {
    let n = c1.shape()[0];
    let (n1, n2) = (c1.shape()[1], c2.shape()[1]);
    if n * n1 * n2 == 0 {
        return rt::zeros(([npair(n), n1 * n2], c1.device()));
    }
    let outer = c1.i((.., None, .., None)) * c2.i((None, .., None, ..));
    let sym = &outer + outer.swapaxes(0, 1);
    let weight = (0..n).flat_map(|i| (0..=i).map(move |j| if i == j { 0.5 } else { 1.0 })).collect::<Vec<_>>();
    let weight = rt::asarray((weight, c1.device()));
    pack_eri(&sym, true, false) * weight.i((.., None))
}

/// Four-leg basis change applied directly to four-fold packed `[npair, npair]` storage.
pub fn transform_packed_eri(packed: &Tsr, coeffs: [&TsrView; 4]) -> Tsr {
    let dims = coeffs.map(|c| c.shape()[1]);
    let bra = pair_transform(coeffs[0], coeffs[1]);
    let ket = pair_transform(coeffs[2], coeffs[3]);
    matmul(&matmul(&bra.t(), &packed.view()).view(), &ket.view()).into_shape(dims)
}

/// Average a real rank-4 tensor over the eight permutations of the `(ij|kl)` symmetry group.
pub fn symmetrize_eri(eri: &Tsr) -> Tsr {
    let n = eri.shape()[0];
    if n == 0 {
        return eri.to_owned();
    }
    let data = eri.reshape(-1).to_vec();
    let at = |i: usize, j: usize, k: usize, l: usize| data[((i * n + j) * n + k) * n + l];
    let mut out = vec![0.0; data.len()];
    for i in 0..n {
        for j in 0..n {
            for k in 0..n {
                for l in 0..n {
                    out[((i * n + j) * n + k) * n + l] = (at(i, j, k, l)
                        + at(j, i, k, l)
                        + at(i, j, l, k)
                        + at(j, i, l, k)
                        + at(k, l, i, j)
                        + at(l, k, i, j)
                        + at(k, l, j, i)
                        + at(l, k, j, i))
                        / 8.0;
                }
            }
        }
    }
    rt::asarray((out, vec![n, n, n, n].c(), eri.device()))
}

/* #endregion */
