//! Storage backends of the two-electron integrals and their transformation to arbitrary
//! localized-orbital bases.

use crate::la::{from_rows, matmul, to_rows};
use crate::prelude::*;
use crate::util::{npair, pack_eri, transform_eri_legs, transform_packed_eri, unpack_eri};

/// Maps bases and operators between the localized representation and the representation in
/// which a stored tensor is expressed.
#[derive(Debug, Clone)]
pub enum EriConversion {
    /// The tensor is stored in the localized basis itself.
    Identity,

    /// The tensor is stored in the AO basis.
    Ao { ao2loc: Tsr, loc_ovlp_ao: Tsr },
}

impl EriConversion {
    pub fn ao(ao2loc: &Tsr, ovlp: &Tsr) -> Self {
        Self::Ao { ao2loc: ao2loc.to_owned(), loc_ovlp_ao: ao2loc.t() % ovlp }
    }

    /// `loc2bas -> eri2bas`.
    pub fn loc2eri_bas(&self, loc2bas: &TsrView) -> Tsr {
        match self {
            Self::Identity => loc2bas.to_owned(),
            Self::Ao { ao2loc, .. } => matmul(&ao2loc.view(), loc2bas),
        }
    }

    /// Localized operator to the storage representation.
    pub fn loc2eri_op(&self, op: &TsrView) -> Tsr {
        match self {
            Self::Identity => op.to_owned(),
            Self::Ao { ao2loc, .. } => represent_operator_in_basis(op, &ao2loc.t()),
        }
    }

    /// `eri2bas -> loc2bas`.
    pub fn eri2loc_bas(&self, eri2bas: &TsrView) -> Tsr {
        match self {
            Self::Identity => eri2bas.to_owned(),
            Self::Ao { loc_ovlp_ao, .. } => matmul(&loc_ovlp_ao.view(), eri2bas),
        }
    }

    /// Storage-representation operator to the localized basis.
    pub fn eri2loc_op(&self, op: &TsrView) -> Tsr {
        match self {
            Self::Identity => op.to_owned(),
            Self::Ao { ao2loc, .. } => represent_operator_in_basis(op, &ao2loc.view()),
        }
    }
}

/// A stored tensor bundled with the conversion of its basis.
#[derive(Debug, Clone)]
pub struct TaggedEri {
    /// `[n, n, n, n]`, pair-packed `[npair, npair]`, or `[naux, n, n]` for density fitting.
    pub data: Tsr,

    /// Dimension of the storage basis.
    pub nbas: usize,

    /// Whether `data` holds lower-triangular pairs.
    pub packed: bool,

    pub conversion: EriConversion,
}

impl TaggedEri {
    /// Unpacked `[n, n, n, n]` copy; transformations work on the packed data directly.
    fn full(&self) -> Tsr {
        if self.packed { unpack_eri(&self.data, self.nbas) } else { self.data.to_owned() }
    }
}

#[derive(Debug)]
pub enum EriStore {
    InCore(TaggedEri),
    DensityFitted(TaggedEri),

    /// Integrals are regenerated from the integral engine on every request.
    Direct,
}

fn same_basis(a: &TsrView, b: &TsrView) -> bool {
    a.shape() == b.shape() && to_rows(a).0 == to_rows(b).0
}

/// Memory footprint (MB) of the two four-fold symmetric tensors needed to build the local ERI.
pub fn incore_eri_footprint(norbs: usize) -> f64 {
    2.0 * (norbs as f64).powi(4) / 1.0e6
}

impl EriStore {
    /// Pick the backend: density fitting, then a stored AO tensor, then a local tensor built in
    /// memory, and direct evaluation as the last resort.
    pub fn select(mf: &MeanFieldReference, ao2loc: &Tsr, max_memory: f64) -> Self {
        let norbs = ao2loc.shape()[1];
        let nao = mf.nao();
        if let Some(cderi) = &mf.cderi {
            info!("Found density-fitting three-center integrals on the mean-field reference");
            let conversion = EriConversion::ao(ao2loc, &mf.ovlp);
            return Self::DensityFitted(TaggedEri { data: cderi.to_owned(), nbas: nao, packed: false, conversion });
        }
        if let Some(eri) = &mf.eri {
            info!("Found two-electron integrals on the mean-field reference");
            let conversion = EriConversion::ao(ao2loc, &mf.ovlp);
            let data = pack_eri(eri, true, true);
            return Self::InCore(TaggedEri { data, nbas: nao, packed: true, conversion });
        }
        let footprint = incore_eri_footprint(norbs);
        if footprint < 0.95 * max_memory {
            info!("Storing eris in memory ({footprint:.1} MB of {max_memory:.1} MB)");
            let ao2loc_view = ao2loc.view();
            let eri = transform_eri_legs(&mf.engine.int2e(), [&ao2loc_view; 4]);
            let data = pack_eri(&crate::util::symmetrize_eri(&eri), true, true);
            return Self::InCore(TaggedEri { data, nbas: norbs, packed: true, conversion: EriConversion::Identity });
        }
        warn!("Direct calculation: {footprint:.1} MB of local integrals exceed 95% of {max_memory:.1} MB");
        Self::Direct
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::InCore(_) => "in-core",
            Self::DensityFitted(_) => "density-fitted",
            Self::Direct => "direct",
        }
    }

    /// Two-electron integrals over four localized-basis legs.
    ///
    /// With `compact`, each leg pair sharing one basis is folded into lower-triangular pairs and
    /// the result is `[nbra, nket]`; otherwise it is `[n1, n2, n3, n4]`.
    pub fn transform(
        &self,
        loc2bas: [&TsrView; 4],
        compact: bool,
        ao2loc: &Tsr,
        engine: &dyn IntegralEngine,
    ) -> Result<Tsr> {
        let norbs = ao2loc.shape()[1];
        if let Some(bad) = loc2bas.iter().find(|b| b.shape()[0] != norbs) {
            return Err(EmbeddingError::UnsupportedBasisCombination(format!(
                "leg basis with {} rows in a space of {norbs} localized orbitals",
                bad.shape()[0]
            )));
        }
        let dims = loc2bas.map(|b| b.shape()[1]);
        debug!(
            "Transforming ERI ({}) to {dims:?}, up to {:.1} MB",
            self.backend_name(),
            8.0 * dims.iter().product::<usize>() as f64 / 1.0e6
        );

        let eri = match self {
            Self::InCore(tagged) => {
                let a2b = loc2bas.map(|b| tagged.conversion.loc2eri_bas(b));
                let a2b_views = [a2b[0].view(), a2b[1].view(), a2b[2].view(), a2b[3].view()];
                let legs = [&a2b_views[0], &a2b_views[1], &a2b_views[2], &a2b_views[3]];
                if tagged.packed { transform_packed_eri(&tagged.data, legs) } else { transform_eri_legs(&tagged.data, legs) }
            },
            Self::DensityFitted(tagged) => {
                let a2b = loc2bas.map(|b| tagged.conversion.loc2eri_bas(b));
                let bra = half_transform(&tagged.data, &a2b[0].view(), &a2b[1].view());
                let ket = half_transform(&tagged.data, &a2b[2].view(), &a2b[3].view());
                let tei = matmul(&bra.t(), &ket.view());
                tei.into_shape([dims[0], dims[1], dims[2], dims[3]])
            },
            Self::Direct => {
                debug!("Regenerating AO two-electron integrals");
                let a2b = loc2bas.map(|b| matmul(&ao2loc.view(), b));
                let a2b_views = [a2b[0].view(), a2b[1].view(), a2b[2].view(), a2b[3].view()];
                transform_eri_legs(&engine.int2e(), [&a2b_views[0], &a2b_views[1], &a2b_views[2], &a2b_views[3]])
            },
        };

        if !compact {
            return Ok(eri);
        }
        let pack_bra = same_basis(loc2bas[0], loc2bas[1]);
        let pack_ket = same_basis(loc2bas[2], loc2bas[3]);
        Ok(pack_eri(&eri, pack_bra, pack_ket))
    }

    /// Compressed density-fitting factors `[nkept, npair]` of the subspace `loc2bas`.
    ///
    /// Auxiliary rows whose largest element is below `sqrt(lindep_thr)` are discarded; the rest is
    /// truncated by a singular-value decomposition at the same threshold.
    pub fn density_fitted_block(&self, loc2bas: &TsrView, lindep_thr: f64) -> Result<Tsr> {
        let Self::DensityFitted(tagged) = self else {
            return Err(EmbeddingError::DensityFittingUnavailable);
        };
        let time = std::time::Instant::now();
        let nact = loc2bas.shape()[1];
        let naux = tagged.data.shape()[0];
        let a2b = tagged.conversion.loc2eri_bas(loc2bas);
        let cderi = half_transform(&tagged.data, &a2b.view(), &a2b.view()).into_shape([naux, 1, nact, nact]);
        let cderi = pack_eri(&cderi, false, true);
        let imp_eri_size = 8.0 * (npair(nact) * (npair(nact) + 1) / 2) as f64 / 1.0e6;
        info!(
            "Size comparison: cderi is ({naux},{nact},{nact}) -> {:.1} MB compacted; eri is ({nact},{nact},{nact},{nact}) -> {imp_eri_size:.1} MB compacted",
            8.0 * cderi.size() as f64 / 1.0e6
        );

        // compression 1: zero rows
        let thr = lindep_thr.sqrt();
        let (data, nrow, ncol) = to_rows(&cderi.view());
        let kept_rows = (0..nrow)
            .filter(|&r| data[r * ncol..(r + 1) * ncol].iter().fold(0.0_f64, |acc, x| acc.max(x.abs())) > thr)
            .collect::<Vec<_>>();
        info!("From {naux} auxiliary functions, {} have nonzero rows of the 3-center integral", kept_rows.len());
        let screened = kept_rows.iter().flat_map(|&r| data[r * ncol..(r + 1) * ncol].to_vec()).collect::<Vec<_>>();
        let screened = from_rows(screened, kept_rows.len(), ncol, loc2bas.device());

        // compression 2: svd
        let options = EigenControl { only_nonzero_vals: true, num_zero_atol: thr, ..Default::default() };
        let svd = crate::la::svd_control(&screened.view(), &options)?;
        info!(
            "From {} nonzero aux-function rows, {} nonzero singular values found ({:.2?})",
            kept_rows.len(),
            svd.svals.len(),
            time.elapsed()
        );
        // sigma V^T, one row per retained singular value
        let nsv = svd.svals.len();
        let scaled = crate::la::scale_columns(&svd.rvecs.view(), &svd.svals);
        Ok(from_rows(to_rows(&scaled.t()).0, nsv, scaled.shape()[0], loc2bas.device()))
    }

    /// The stored two-electron tensor of the localized orbitals, `[n, n, n, n]`.
    pub fn bulk_tensor(&self) -> Result<Tsr> {
        match self {
            Self::InCore(tagged) if matches!(tagged.conversion, EriConversion::Identity) => Ok(tagged.full()),
            _ => Err(EmbeddingError::BulkTensorUnavailable),
        }
    }
}

/// `out[P, i, j] = sum_uv c1[u, i] cderi[P, u, v] c2[v, j]`, flattened to `[naux, n1 * n2]`.
fn half_transform(cderi: &Tsr, c1: &TsrView, c2: &TsrView) -> Tsr {
    let naux = cderi.shape()[0];
    let (n1, n2) = (c1.shape()[1], c2.shape()[1]);
    let device = cderi.device().clone();
    if naux * n1 * n2 == 0 {
        return rt::zeros(([naux, n1 * n2], &device));
    }
    let out: Tsr = rt::zeros(([naux, n1, n2], &device));
    (0..naux).into_par_iter().for_each(|p| {
        let mut out = unsafe { out.force_mut() };
        out.i_mut(p).assign(&(c1.t() % cderi.i(p) % c2));
    });
    out.into_shape([naux, n1 * n2])
}
