//! Hubbard-like chain with a non-orthogonal site basis and low-rank two-electron integrals.
//!
//! The two-electron tensor is defined through explicit factors
//! `(pq|rs) = sum_P B[P, p, q] B[P, r, s]`, so the same integrals can be served as a
//! density-fitting tensor, as a stored four-index tensor, or regenerated on demand.

use crate::la::{eye, from_rows};
use crate::meanfield::IntegralEngine;
use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct ModelHamiltonian {
    pub nsite: usize,

    /// Nearest-neighbour hopping `-t`.
    pub hopping: f64,

    /// On-site repulsion `U`.
    pub onsite: f64,

    /// Nearest-neighbour bond-density repulsion `V`.
    pub bond: f64,

    /// Nearest-neighbour overlap of the site basis.
    pub site_overlap: f64,

    /// Staggered on-site potential, breaks the degeneracy of the symmetric chain.
    pub site_potential: f64,

    pub nelectron: usize,
    pub e_nuc: f64,
}

impl ModelHamiltonian {
    /// Half-filled open chain.
    pub fn hubbard_chain(nsite: usize, hopping: f64, onsite: f64) -> Self {
        Self {
            nsite,
            hopping,
            onsite,
            bond: 0.25 * onsite,
            site_overlap: 0.1,
            site_potential: 0.0,
            nelectron: nsite - nsite % 2,
            e_nuc: 0.0,
        }
    }

    fn device(&self) -> DeviceTsr {
        DeviceTsr::default()
    }

    pub fn ovlp(&self) -> Tsr {
        let n = self.nsite;
        let mut s = eye(n, &self.device());
        for p in 0..n.saturating_sub(1) {
            s[[p, p + 1]] = self.site_overlap;
            s[[p + 1, p]] = self.site_overlap;
        }
        s
    }

    pub fn hcore(&self) -> Tsr {
        let n = self.nsite;
        let mut h: Tsr = rt::zeros(([n, n], &self.device()));
        for p in 0..n {
            h[[p, p]] = if p % 2 == 0 { self.site_potential } else { -self.site_potential };
        }
        for p in 0..n.saturating_sub(1) {
            h[[p, p + 1]] = -self.hopping;
            h[[p + 1, p]] = -self.hopping;
        }
        h
    }

    pub fn naux(&self) -> usize {
        self.nsite + self.nsite.saturating_sub(1)
    }

    /// Factors `B[P, p, q]`: one on-site factor per site followed by one bond factor per bond.
    pub fn cderi(&self) -> Tsr {
        let n = self.nsite;
        let naux = self.naux();
        let mut data = vec![0.0; naux * n * n];
        let su = self.onsite.sqrt();
        for p in 0..n {
            data[(p * n + p) * n + p] = su;
        }
        let sv = (0.5 * self.bond).sqrt();
        for p in 0..n.saturating_sub(1) {
            let aux = n + p;
            data[(aux * n + p) * n + p + 1] = sv;
            data[(aux * n + p + 1) * n + p] = sv;
        }
        if data.is_empty() {
            return rt::zeros(([naux, n, n], &self.device()));
        }
        rt::asarray((data, vec![naux, n, n].c(), &self.device()))
    }

    /// Position operator along the chain, `[3, n, n]`; sites sit at `x = p`.
    pub fn position(&self) -> Tsr {
        let n = self.nsite;
        let s = self.ovlp();
        let mut r: Tsr = rt::zeros(([3, n, n], &self.device()));
        for p in 0..n {
            for q in 0..n {
                r[[0, p, q]] = 0.5 * (p + q) as f64 * s[[p, q]];
            }
        }
        r
    }

    /// Mirror symmetry of the chain: even (`A`) and odd (`B`) combinations of mirrored sites.
    pub fn reflection_symmetry(&self) -> SymmetryInfo {
        let n = self.nsite;
        let half = std::f64::consts::FRAC_1_SQRT_2;
        let mut even = vec![];
        let mut odd = vec![];
        for p in 0..n / 2 {
            let q = n - 1 - p;
            let mut e = vec![0.0; n];
            let mut o = vec![0.0; n];
            e[p] = half;
            e[q] = half;
            o[p] = half;
            o[q] = -half;
            even.push(e);
            odd.push(o);
        }
        if n % 2 == 1 {
            let mut e = vec![0.0; n];
            e[n / 2] = 1.0;
            even.push(e);
        }
        let as_columns = |vecs: Vec<Vec<f64>>| {
            let ncol = vecs.len();
            let data = (0..n).flat_map(|r| vecs.iter().map(move |v| v[r]).collect::<Vec<_>>()).collect();
            from_rows(data, n, ncol, &self.device())
        };
        SymmetryInfo {
            group: "Cs".into(),
            irrep_names: vec!["A'".into(), "A\"".into()],
            symm_orb: vec![as_columns(even), as_columns(odd)],
        }
    }
}

impl IntegralEngine for ModelHamiltonian {
    fn nao(&self) -> usize {
        self.nsite
    }

    fn int2e(&self) -> Tsr {
        let n = self.nsite;
        let naux = self.naux();
        let cderi = self.cderi();
        if n == 0 {
            return rt::zeros(([0, 0, 0, 0], &self.device()));
        }
        let flat = cderi.reshape([naux, n * n]);
        (flat.t() % &flat).into_shape([n, n, n, n])
    }

    fn dipole(&self) -> Option<Tsr> {
        Some(self.position())
    }
}
