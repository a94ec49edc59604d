//! In-core DIIS extrapolation of Fock matrices.

use crate::prelude::*;
use std::collections::HashMap;

/// Which stored vector is dropped once the subspace is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DIISPopStrategy {
    /// Drop the oldest vector.
    Iteration,

    /// Drop the vector whose error has the largest norm.
    ErrDiagonal,
}

#[derive(Debug, Clone)]
pub struct DIISIncoreFlags {
    /// Maximum number of vectors in the DIIS space. Default is 8.
    pub space: usize,

    /// Minimum number of vectors before extrapolating. Default is 2.
    pub min_space: usize,

    /// Default is `DIISPopStrategy::ErrDiagonal`.
    pub pop_strategy: DIISPopStrategy,
}

impl Default for DIISIncoreFlags {
    fn default() -> Self {
        Self { space: 8, min_space: 2, pop_strategy: DIISPopStrategy::ErrDiagonal }
    }
}

/// Stored subspace. Slots are 1-based so that row/column 0 of `bmat` holds the Lagrange
/// constraint `[0, 1, ..., 1]`.
struct DIISSpace {
    bmat: Tsr,
    vecs: HashMap<usize, Tsr>,
    errs: HashMap<usize, Tsr>,
    stamps: HashMap<usize, usize>,
    last: Option<usize>,
    counter: usize,
    shape: Vec<usize>,
}

pub struct DIISIncore {
    pub flags: DIISIncoreFlags,
    space: DIISSpace,
}

impl DIISIncore {
    pub fn new(flags: DIISIncoreFlags, device: &DeviceTsr) -> Self {
        let nslot = flags.space.max(1) + 1;
        let mut bmat: Tsr = rt::zeros(([nslot, nslot], device));
        bmat.i_mut((0, 1..)).fill(1.0);
        bmat.i_mut((1.., 0)).fill(1.0);
        let space = DIISSpace {
            bmat,
            vecs: HashMap::new(),
            errs: HashMap::new(),
            stamps: HashMap::new(),
            last: None,
            counter: 0,
            shape: vec![],
        };
        Self { flags, space }
    }

    pub fn len(&self) -> usize {
        self.space.vecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.space.vecs.is_empty()
    }

    fn oldest_slot(&self) -> Option<usize> {
        self.space.stamps.iter().min_by_key(|&(_, &stamp)| stamp).map(|(&slot, _)| slot)
    }

    fn worst_slot(&self) -> Option<usize> {
        self.space
            .errs
            .keys()
            .copied()
            .max_by(|&a, &b| self.space.bmat[[a, a]].total_cmp(&self.space.bmat[[b, b]]))
    }

    /// Slot that receives the next vector.
    fn next_slot(&self) -> usize {
        let nvec = self.len();
        if nvec < self.flags.space.max(1) {
            return (1..=self.flags.space.max(1)).find(|s| !self.space.vecs.contains_key(s)).unwrap_or(nvec + 1);
        }
        let candidate = match self.flags.pop_strategy {
            DIISPopStrategy::Iteration => self.oldest_slot(),
            DIISPopStrategy::ErrDiagonal => self.worst_slot(),
        };
        // dropping the vector just inserted would stall the extrapolation
        let candidate = if candidate.is_some() && candidate == self.space.last {
            warn!("DIIS: latest vector carries the largest error; dropping the oldest vector instead");
            self.oldest_slot()
        } else {
            candidate
        };
        candidate.unwrap_or(1)
    }

    fn drop_slot(&mut self, slot: usize) {
        self.space.vecs.remove(&slot);
        self.space.errs.remove(&slot);
        self.space.stamps.remove(&slot);
        self.space.bmat.i_mut((slot, 1..)).fill(0.0);
        self.space.bmat.i_mut((1.., slot)).fill(0.0);
    }

    /// Add a vector together with its error vector (for SCF, the orbital gradient `FDS - SDF`).
    pub fn insert(&mut self, vec: Tsr, err: Tsr) {
        let slot = self.next_slot();
        if self.space.vecs.contains_key(&slot) {
            self.drop_slot(slot);
        }
        self.space.shape = vec.shape().to_vec();
        let err = err.into_shape(-1);
        for (&other, other_err) in &self.space.errs {
            let dot = (&err * other_err).sum();
            self.space.bmat[[slot, other]] = dot;
            self.space.bmat[[other, slot]] = dot;
        }
        self.space.bmat[[slot, slot]] = (&err * &err).sum();

        self.space.vecs.insert(slot, vec.into_shape(-1));
        self.space.errs.insert(slot, err);
        self.space.stamps.insert(slot, self.space.counter);
        self.space.counter += 1;
        self.space.last = Some(slot);
    }

    /// Extrapolated vector, or `None` when nothing has been inserted yet.
    pub fn extrapolate(&self) -> Option<Tsr> {
        let last = self.space.last?;
        let latest = self.space.vecs.get(&last)?;
        if self.len() < self.flags.min_space {
            return Some(latest.to_owned().into_shape(self.space.shape.clone()));
        }

        // compact the occupied slots into a dense (n + 1) x (n + 1) system
        let mut slots = self.space.vecs.keys().copied().collect::<Vec<_>>();
        slots.sort_unstable();
        let n = slots.len();
        let device = latest.device().clone();
        let mut b: Tsr = rt::zeros(([n + 1, n + 1], &device));
        b.i_mut((0, 1..)).fill(1.0);
        b.i_mut((1.., 0)).fill(1.0);
        for (i, &si) in slots.iter().enumerate() {
            for (j, &sj) in slots.iter().enumerate() {
                b[[i + 1, j + 1]] = self.space.bmat[[si, sj]];
            }
        }

        // pseudo-inverse through eigendecomposition; tiny eigenvalues are discarded
        let (w, v): (Tsr, Tsr) = rt::linalg::eigh(b.view()).into();
        let eps = 30.0 * f64::EPSILON;
        let w_inv = w.mapv(|x| if x.abs() < eps { 0.0 } else { 1.0 / x });
        let mut g: Tsr = rt::zeros(([n + 1], &device));
        g[[0]] = 1.0;
        let c = (v.view() * w_inv) % v.t() % g;

        let mut out = latest.zeros_like();
        for (i, slot) in slots.iter().enumerate() {
            if let Some(vec) = self.space.vecs.get(slot) {
                out += vec * c[[i + 1]];
            }
        }
        trace!("DIIS coefficients over {n} vectors: {:?}", (1..=n).map(|i| c[[i]]).collect::<Vec<_>>());
        Some(out.into_shape(self.space.shape.clone()))
    }

    /// Insert, then extrapolate. Falls back to the inserted vector if extrapolation is impossible.
    pub fn update(&mut self, vec: Tsr, err: Tsr) -> Tsr {
        let fallback = vec.to_owned();
        self.insert(vec, err);
        self.extrapolate().unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_diis_linear_sequence() {
        // x_{k+1} = 0.5 x_k + 1 converges to 2; error is the residual x - (0.5 x + 1)
        let device = DeviceTsr::default();
        let mut diis = DIISIncore::new(DIISIncoreFlags::default(), &device);
        let mut x = 0.0;
        for _ in 0..4 {
            let vec: Tsr = rt::asarray((vec![0.5 * x + 1.0], &device));
            let err: Tsr = rt::asarray((vec![0.5 * x + 1.0 - x], &device));
            x = diis.update(vec, err)[[0]];
        }
        assert_abs_diff_eq!(x, 2.0, epsilon = 1e-8);
    }

    #[test]
    fn test_diis_space_is_bounded() {
        let device = DeviceTsr::default();
        let flags = DIISIncoreFlags { space: 3, pop_strategy: DIISPopStrategy::Iteration, ..Default::default() };
        let mut diis = DIISIncore::new(flags, &device);
        assert!(diis.extrapolate().is_none());
        for k in 0..6 {
            let vec: Tsr = rt::asarray((vec![k as f64, 1.0], &device));
            let err: Tsr = rt::asarray((vec![1.0 / (k + 1) as f64, 0.0], &device));
            diis.insert(vec, err);
        }
        assert_eq!(diis.len(), 3);
        assert_eq!(diis.extrapolate().map(|x| x.shape().to_vec()), Some(vec![2]));
    }
}
