//! Matrix predicates and controlled eigen/singular-value decompositions.

use crate::prelude::*;

/* #region tensor helpers */

/// Row-major copy of a matrix together with its shape.
pub(crate) fn to_rows(m: &TsrView) -> (Vec<f64>, usize, usize) {
    let shape = m.shape();
    let (nrow, ncol) = (shape[0], shape[1]);
    if nrow * ncol == 0 {
        return (vec![], nrow, ncol);
    }
    (m.reshape(-1).to_vec(), nrow, ncol)
}

pub(crate) fn from_rows(data: Vec<f64>, nrow: usize, ncol: usize, device: &DeviceTsr) -> Tsr {
    if nrow * ncol == 0 {
        return rt::zeros(([nrow, ncol], device));
    }
    rt::asarray((data, vec![nrow, ncol].c(), device))
}

pub(crate) fn eye(n: usize, device: &DeviceTsr) -> Tsr {
    let mut m: Tsr = rt::zeros(([n, n], device));
    if n > 0 {
        m.diagonal_mut(None).fill(1.0);
    }
    m
}

/// Matrix product tolerant of zero-sized inner or outer dimensions.
pub(crate) fn matmul(a: &TsrView, b: &TsrView) -> Tsr {
    let (m, k, n) = (a.shape()[0], a.shape()[1], b.shape()[1]);
    if m * k * n == 0 {
        return rt::zeros(([m, n], a.device()));
    }
    a.view() % b.view()
}

/// Column-wise concatenation of matrices sharing a row count.
pub(crate) fn hstack(blocks: &[TsrView], nrow: usize, device: &DeviceTsr) -> Tsr {
    let ncol = blocks.iter().map(|b| b.shape()[1]).sum::<usize>();
    let mut out: Tsr = rt::zeros(([nrow, ncol], device));
    let mut p0 = 0;
    for blk in blocks {
        let p1 = p0 + blk.shape()[1];
        if p1 > p0 && nrow > 0 {
            out.i_mut((.., p0..p1)).assign(blk);
        }
        p0 = p1;
    }
    out
}

pub(crate) fn select_columns(m: &TsrView, idx: &[usize]) -> Tsr {
    let (data, nrow, ncol) = to_rows(m);
    let mut out = Vec::with_capacity(nrow * idx.len());
    for r in 0..nrow {
        out.extend(idx.iter().map(|&c| data[r * ncol + c]));
    }
    from_rows(out, nrow, idx.len(), m.device())
}

pub(crate) fn submatrix(m: &TsrView, rows: &[usize], cols: &[usize]) -> Tsr {
    let (data, _, ncol) = to_rows(m);
    let data = &data;
    let out = rows.iter().flat_map(|&r| cols.iter().map(move |&c| data[r * ncol + c])).collect();
    from_rows(out, rows.len(), cols.len(), m.device())
}

/// `m @ diag(scale)`, broadcast over rows.
pub(crate) fn scale_columns(m: &TsrView, scale: &[f64]) -> Tsr {
    if m.size() == 0 {
        return m.to_owned();
    }
    let scale: Tsr = rt::asarray((scale.to_vec(), m.device()));
    m * &scale
}

/// Squared Frobenius norm of every column.
pub(crate) fn column_sq_norms(m: &TsrView) -> Vec<f64> {
    if m.size() == 0 {
        return vec![0.0; m.shape()[1]];
    }
    m.mapv(|x| x * x).sum_axes([0]).to_vec()
}

pub(crate) fn max_abs(m: &TsrView) -> f64 {
    if m.size() == 0 {
        return 0.0;
    }
    m.reshape(-1).to_vec().into_iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}

/* #endregion */

/* #region predicates */

/// Element-wise closeness in the numpy `allclose` sense: `|a - b| <= atol + rtol * |b|`.
#[derive(Debug, Clone, Copy)]
pub struct MatrixTolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Default for MatrixTolerance {
    fn default() -> Self {
        Self { rtol: 1.0e-5, atol: 1.0e-8 }
    }
}

impl MatrixTolerance {
    fn allclose(&self, a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= self.atol + self.rtol * y.abs())
    }

    pub fn is_zero(&self, m: &TsrView) -> bool {
        let (data, ..) = to_rows(m);
        let zeros = vec![0.0; data.len()];
        self.allclose(&data, &zeros)
    }

    pub fn is_eye(&self, m: &TsrView) -> bool {
        let (data, nrow, ncol) = to_rows(m);
        if nrow != ncol {
            return false;
        }
        let (eye, ..) = to_rows(&eye(nrow, m.device()).view());
        self.allclose(&data, &eye)
    }

    pub fn is_idempotent(&self, m: &TsrView) -> bool {
        let (nrow, ncol) = (m.shape()[0], m.shape()[1]);
        if nrow != ncol {
            return false;
        }
        let m2 = matmul(m, m);
        self.allclose(&to_rows(m).0, &to_rows(&m2.view()).0)
    }

    pub fn is_diagonal(&self, m: &TsrView) -> bool {
        let (data, nrow, ncol) = to_rows(m);
        let diag = (0..nrow * ncol).map(|idx| if idx / ncol == idx % ncol { data[idx] } else { 0.0 }).collect::<Vec<_>>();
        self.allclose(&data, &diag)
    }

    pub fn is_hermitian(&self, m: &TsrView) -> bool {
        let (nrow, ncol) = (m.shape()[0], m.shape()[1]);
        if nrow != ncol {
            return false;
        }
        self.allclose(&to_rows(m).0, &to_rows(&m.t()).0)
    }
}

/// Tolerance of [`is_matrix_zero`] and [`is_matrix_eye`]: unit relative slack, `1e-8` absolute.
pub const UNIT_RTOL: MatrixTolerance = MatrixTolerance { rtol: 1.0, atol: 1.0e-8 };

pub fn is_matrix_zero(m: &TsrView) -> bool {
    UNIT_RTOL.is_zero(m)
}

pub fn is_matrix_eye(m: &TsrView) -> bool {
    UNIT_RTOL.is_eye(m)
}

pub fn is_matrix_idempotent(m: &TsrView) -> bool {
    MatrixTolerance::default().is_idempotent(m)
}

pub fn is_matrix_diagonal(m: &TsrView) -> bool {
    MatrixTolerance::default().is_diagonal(m)
}

pub fn is_matrix_hermitian(m: &TsrView) -> bool {
    MatrixTolerance::default().is_hermitian(m)
}

/* #endregion */

/* #region controlled decompositions */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
    Unsorted,
}

/// Options of [`eigen_control`] and [`svd_control`].
#[derive(Debug, Clone)]
pub struct EigenControl {
    /// Sort order of the returned eigen/singular values. Default is descending.
    pub sort: SortOrder,

    /// Discard pairs whose value magnitude is below `num_zero_atol`.
    pub only_nonzero_vals: bool,

    /// Snap values below `num_zero_atol` exactly to zero.
    pub round_zero_vals: bool,

    /// Metric of a generalized eigenproblem `A x = e B x`.
    pub b_matrix: Option<Tsr>,

    /// Default is 1e-8.
    pub num_zero_atol: f64,
}

impl Default for EigenControl {
    fn default() -> Self {
        Self {
            sort: SortOrder::Descending,
            only_nonzero_vals: false,
            round_zero_vals: false,
            b_matrix: None,
            num_zero_atol: 1.0e-8,
        }
    }
}

impl EigenControl {
    pub fn sorted(sort: SortOrder) -> Self {
        Self { sort, ..Default::default() }
    }
}

#[derive(Debug, Clone)]
pub struct EigenResult {
    pub evals: Vec<f64>,
    pub evecs: Tsr,
    /// Symmetry label of each eigenvector (all zero without symmetry blocks).
    pub labels: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct SvdResult {
    pub lvecs: Tsr,
    pub svals: Vec<f64>,
    pub rvecs: Tsr,
}

fn sort_indices(vals: &[f64], sort: SortOrder) -> Vec<usize> {
    let mut idx = (0..vals.len()).collect::<Vec<_>>();
    match sort {
        SortOrder::Ascending => idx.sort_by(|&a, &b| vals[a].total_cmp(&vals[b])),
        SortOrder::Descending => idx.sort_by(|&a, &b| vals[b].total_cmp(&vals[a])),
        SortOrder::Unsorted => (),
    }
    idx
}

/// Keep (and reorder) eigenpairs according to `idx`.
fn take_pairs(evals: &[f64], evecs: &TsrView, labels: &[usize], idx: &[usize]) -> EigenResult {
    EigenResult {
        evals: idx.iter().map(|&i| evals[i]).collect(),
        evecs: select_columns(evecs, idx),
        labels: idx.iter().map(|&i| labels[i]).collect(),
    }
}

fn filter_and_sort(result: EigenResult, options: &EigenControl) -> EigenResult {
    let EigenResult { evals, evecs, labels } = result;
    let mut idx = (0..evals.len()).collect::<Vec<_>>();
    if options.only_nonzero_vals {
        idx.retain(|&i| evals[i].abs() > options.num_zero_atol);
    }
    let kept = idx.iter().map(|&i| evals[i]).collect::<Vec<_>>();
    let order = sort_indices(&kept, options.sort);
    let idx = order.into_iter().map(|o| idx[o]).collect::<Vec<_>>();
    let mut result = take_pairs(&evals, &evecs.view(), &labels, &idx);
    if options.round_zero_vals {
        result.evals.iter_mut().filter(|e| e.abs() < options.num_zero_atol).for_each(|e| *e = 0.0);
    }
    result
}

/// Hermitian eigendecomposition with controlled sorting, truncation and rounding.
///
/// The mean of the diagonal is subtracted before diagonalization and added back to the
/// eigenvalues, which keeps rounding error under control for near-degenerate large diagonals.
pub fn eigen_control(matrix: &TsrView, options: &EigenControl) -> Result<EigenResult> {
    let device = matrix.device().clone();
    let (nrow, ncol) = (matrix.shape()[0], matrix.shape()[1]);
    if nrow != ncol {
        return Err(EmbeddingError::DimensionMismatch {
            context: "eigen_control operand".into(),
            expected: nrow,
            found: ncol,
        });
    }
    let n = nrow;
    if n == 0 {
        return Ok(EigenResult { evals: vec![], evecs: rt::zeros(([0, 0], &device)), labels: vec![] });
    }

    let diag_avg = matrix.diagonal(None).sum() / n as f64;
    let metric = match &options.b_matrix {
        Some(b) => b.to_owned(),
        None => eye(n, &device),
    };
    let shifted = matrix.to_owned() - diag_avg * &metric;
    let shifted = 0.5_f64 * (&shifted + shifted.t());

    let (mut evals, evecs) = if options.b_matrix.is_none() && is_matrix_diagonal(&shifted.view()) {
        (shifted.diagonal(None).to_vec(), eye(n, &device))
    } else if options.b_matrix.is_some() {
        let (w, v): (Tsr, Tsr) = rt::linalg::eigh((shifted.view(), metric.view())).into();
        (w.to_vec(), v)
    } else {
        let (w, v): (Tsr, Tsr) = rt::linalg::eigh(shifted.view()).into();
        (w.to_vec(), v)
    };
    evals.iter_mut().for_each(|e| *e += diag_avg);

    let labels = vec![0; evals.len()];
    Ok(filter_and_sort(EigenResult { evals, evecs, labels }, options))
}

/// Eigendecomposition block by block, where `labels[p]` names the symmetry block of basis
/// vector `p`. Eigenvectors are lifted back to the full basis and sorted globally.
pub fn eigen_control_labeled(matrix: &TsrView, labels: &[usize], options: &EigenControl) -> Result<EigenResult> {
    let device = matrix.device().clone();
    let n = matrix.shape()[0];
    if labels.len() != n {
        return Err(EmbeddingError::DimensionMismatch {
            context: "symmetry labels".into(),
            expected: n,
            found: labels.len(),
        });
    }

    let mut uniq = labels.to_vec();
    uniq.sort_unstable();
    uniq.dedup();

    let mut evals = vec![];
    let mut evecs_blocks = vec![];
    let mut out_labels = vec![];
    for &lbl in &uniq {
        let idx = (0..n).filter(|&p| labels[p] == lbl).collect::<Vec<_>>();
        let mat_blk = submatrix(matrix, &idx, &idx);
        let blk_options = EigenControl {
            b_matrix: options.b_matrix.as_ref().map(|b| submatrix(&b.view(), &idx, &idx)),
            ..options.clone()
        };
        let res = eigen_control(&mat_blk.view(), &blk_options)?;
        let nvec = res.evals.len();
        let (blk_data, ..) = to_rows(&res.evecs.view());
        let mut lifted = vec![0.0; n * nvec];
        for (r, &p) in idx.iter().enumerate() {
            lifted[p * nvec..(p + 1) * nvec].copy_from_slice(&blk_data[r * nvec..(r + 1) * nvec]);
        }
        evals.extend(res.evals);
        evecs_blocks.push(from_rows(lifted, n, nvec, &device));
        out_labels.extend(std::iter::repeat_n(lbl, nvec));
    }

    let views = evecs_blocks.iter().map(|b| b.view()).collect::<Vec<_>>();
    let evecs = hstack(&views, n, &device);
    let order = sort_indices(&evals, options.sort);
    Ok(take_pairs(&evals, &evecs.view(), &out_labels, &order))
}

/// Eigendecomposition in a symmetry-adapted basis given as a list of orthonormal sub-bases.
///
/// The union of `blocks` must span the operand exactly; it is converted to per-vector labels
/// and handed to [`eigen_control_labeled`].
pub fn eigen_control_symmetry_blocks(matrix: &TsrView, blocks: &[Tsr], options: &EigenControl) -> Result<EigenResult> {
    let device = matrix.device().clone();
    let n = matrix.shape()[0];
    let ncol = blocks.iter().map(|b| b.shape()[1]).sum::<usize>();
    if let Some(bad) = blocks.iter().find(|b| b.shape()[0] != n) {
        return Err(EmbeddingError::SymmetryBlockMismatch { expected: matrix.shape().to_vec(), found: bad.shape().to_vec() });
    }
    if matrix.shape()[1] != ncol {
        return Err(EmbeddingError::SymmetryBlockMismatch { expected: matrix.shape().to_vec(), found: vec![n, ncol] });
    }
    let views = blocks.iter().map(|b| b.view()).collect::<Vec<_>>();
    let symm_umat = hstack(&views, n, &device);
    let labels = blocks.iter().enumerate().flat_map(|(i, b)| std::iter::repeat_n(i, b.shape()[1])).collect::<Vec<_>>();

    let symm_matr = matmul(&matmul(&symm_umat.t(), matrix).view(), &symm_umat.view());
    let symm_options = EigenControl {
        b_matrix: options.b_matrix.as_ref().map(|b| matmul(&matmul(&symm_umat.t(), &b.view()).view(), &symm_umat.view())),
        ..options.clone()
    };
    let res = eigen_control_labeled(&symm_matr.view(), &labels, &symm_options)?;
    let evecs = matmul(&symm_umat.view(), &res.evecs.view());
    Ok(EigenResult { evals: res.evals, evecs, labels: res.labels })
}

/// Orthonormal basis of the orthogonal complement of an orthonormal column set.
///
/// Eigenvectors of the complementary projector `1 - B B^T` with eigenvalue near one.
pub(crate) fn orthonormal_completion(basis: &TsrView) -> Tsr {
    let device = basis.device().clone();
    let (n, k) = (basis.shape()[0], basis.shape()[1]);
    if k == 0 {
        return eye(n, &device);
    }
    let proj = eye(n, &device) - matmul(basis, &basis.t());
    let proj = 0.5_f64 * (&proj + proj.t());
    let (w, v): (Tsr, Tsr) = rt::linalg::eigh(proj.view()).into();
    let idx = w.to_vec().into_iter().enumerate().filter(|(_, x)| *x > 0.5).map(|(i, _)| i).collect::<Vec<_>>();
    select_columns(&v.view(), &idx)
}

/// Thin singular-value decomposition with the sort and truncation options of [`eigen_control`].
pub fn svd_control(matrix: &TsrView, options: &EigenControl) -> Result<SvdResult> {
    let device = matrix.device().clone();
    let (m, n) = (matrix.shape()[0], matrix.shape()[1]);
    let k = m.min(n);
    if k == 0 {
        return Ok(SvdResult { lvecs: rt::zeros(([m, 0], &device)), svals: vec![], rvecs: rt::zeros(([n, 0], &device)) });
    }

    let (lvecs, s, vt): (Tsr, Tsr, Tsr) = rt::linalg::svd((matrix.to_owned(), false)).into();
    let rvecs = vt.t().to_owned();
    let svals = s.to_vec();

    let mut idx = (0..k).collect::<Vec<_>>();
    if options.only_nonzero_vals {
        idx.retain(|&i| svals[i].abs() > options.num_zero_atol);
    }
    let kept = idx.iter().map(|&i| svals[i]).collect::<Vec<_>>();
    let idx = sort_indices(&kept, options.sort).into_iter().map(|o| idx[o]).collect::<Vec<_>>();
    let mut svals_out = idx.iter().map(|&i| svals[i]).collect::<Vec<_>>();
    if options.round_zero_vals {
        svals_out.iter_mut().filter(|s| s.abs() < options.num_zero_atol).for_each(|s| *s = 0.0);
    }
    Ok(SvdResult {
        lvecs: select_columns(&lvecs.view(), &idx),
        svals: svals_out,
        rvecs: select_columns(&rvecs.view(), &idx),
    })
}

/* #endregion */

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample_symmetric(device: &DeviceTsr) -> Tsr {
        #[rustfmt::skip]
        let data = vec![
            4.0, 1.0, 0.5, 0.0,
            1.0, 3.0, 0.2, 0.1,
            0.5, 0.2, 2.0, 0.3,
            0.0, 0.1, 0.3, 1.0,
        ];
        from_rows(data, 4, 4, device)
    }

    #[test]
    fn test_predicates() {
        let device = DeviceTsr::default();
        let id = eye(3, &device);
        assert!(is_matrix_eye(&id.view()));
        assert!(is_matrix_idempotent(&id.view()));
        assert!(is_matrix_diagonal(&id.view()));
        assert!(is_matrix_hermitian(&id.view()));
        assert!(!is_matrix_zero(&id.view()));
        assert!(is_matrix_zero(&rt::zeros(([2, 3], &device)).view()));

        let a = sample_symmetric(&device);
        assert!(is_matrix_hermitian(&a.view()));
        assert!(!is_matrix_diagonal(&a.view()));
        assert!(!is_matrix_idempotent(&a.view()));
        let rect: Tsr = rt::zeros(([2, 3], &device));
        assert!(!is_matrix_eye(&rect.view()));

        // unit relative slack on the diagonal, absolute slack only off it
        let mut loose = eye(3, &device);
        loose[[0, 0]] = 1.5;
        assert!(is_matrix_eye(&loose.view()));
        assert!(!MatrixTolerance::default().is_eye(&loose.view()));
        loose[[0, 1]] = 1.0e-6;
        assert!(!is_matrix_eye(&loose.view()));
        let mut tiny: Tsr = rt::zeros(([2, 2], &device));
        tiny[[1, 0]] = 5.0e-9;
        assert!(is_matrix_zero(&tiny.view()));
        tiny[[1, 0]] = 1.0e-7;
        assert!(!is_matrix_zero(&tiny.view()));
    }

    #[test]
    fn test_eigen_control_reconstructs_operator() {
        let device = DeviceTsr::default();
        let a = sample_symmetric(&device);
        let res = eigen_control(&a.view(), &EigenControl::default()).unwrap();
        assert!(res.evals.windows(2).all(|w| w[0] >= w[1]));
        let lam = from_rows(
            (0..16).map(|i| if i / 4 == i % 4 { res.evals[i / 4] } else { 0.0 }).collect(),
            4,
            4,
            &device,
        );
        let recon = &res.evecs % lam % res.evecs.t();
        assert_abs_diff_eq!((recon - &a).l2_norm(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_eigen_control_filters_and_rounds() {
        let device = DeviceTsr::default();
        let a = from_rows(vec![1.0, 0.0, 0.0, 0.0, 1e-12, 0.0, 0.0, 0.0, -2.0], 3, 3, &device);
        let options = EigenControl { sort: SortOrder::Ascending, only_nonzero_vals: true, ..Default::default() };
        let res = eigen_control(&a.view(), &options).unwrap();
        assert_eq!(res.evals.len(), 2);
        assert_abs_diff_eq!(res.evals[0], -2.0, epsilon = 1e-12);

        let options = EigenControl { sort: SortOrder::Ascending, round_zero_vals: true, ..Default::default() };
        let res = eigen_control(&a.view(), &options).unwrap();
        assert_eq!(res.evals[1], 0.0);
    }

    #[test]
    fn test_generalized_eigenproblem() {
        let device = DeviceTsr::default();
        let a = sample_symmetric(&device);
        let b = 2.0_f64 * eye(4, &device);
        let plain = eigen_control(&a.view(), &EigenControl::default()).unwrap();
        let options = EigenControl { b_matrix: Some(b), ..Default::default() };
        let general = eigen_control(&a.view(), &options).unwrap();
        for (x, y) in plain.evals.iter().zip(&general.evals) {
            assert_abs_diff_eq!(0.5 * x, *y, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_symmetry_blocks_match_labels() {
        let device = DeviceTsr::default();
        // block-diagonal operator in a rotated basis
        let block = from_rows(vec![2.0, 0.5, 0.0, 0.0, 0.5, 1.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.3, 0.0, 0.0, 0.3, 0.5], 4, 4, &device);
        let c = std::f64::consts::FRAC_1_SQRT_2;
        let rot = from_rows(vec![c, 0.0, c, 0.0, 0.0, c, 0.0, c, c, 0.0, -c, 0.0, 0.0, c, 0.0, -c], 4, 4, &device);
        let op = &rot % &block % rot.t();
        let blocks = vec![rot.i((.., 0..2)).to_owned(), rot.i((.., 2..4)).to_owned()];

        let symm = eigen_control_symmetry_blocks(&op.view(), &blocks, &EigenControl::default()).unwrap();
        let plain = eigen_control(&op.view(), &EigenControl::default()).unwrap();
        for (x, y) in symm.evals.iter().zip(&plain.evals) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-10);
        }
        assert_eq!(symm.labels.iter().filter(|&&l| l == 0).count(), 2);

        let bad = vec![rot.i((.., 0..2)).to_owned()];
        assert!(matches!(
            eigen_control_symmetry_blocks(&op.view(), &bad, &EigenControl::default()),
            Err(EmbeddingError::SymmetryBlockMismatch { .. })
        ));

        // blocks with the wrong row count are rejected before they are stacked
        let short = vec![eye(3, &device), eye(3, &device).i((.., 0..1)).to_owned()];
        match eigen_control_symmetry_blocks(&eye(4, &device).view(), &short, &EigenControl::default()) {
            Err(EmbeddingError::SymmetryBlockMismatch { expected, found }) => {
                assert_eq!(expected, vec![4, 4]);
                assert_eq!(found, vec![3, 3]);
            },
            other => panic!("unexpected result: {other:?}"),
        }
        let mixed = vec![rot.i((.., 0..2)).to_owned(), eye(3, &device).i((.., 0..2)).to_owned()];
        assert!(matches!(
            eigen_control_symmetry_blocks(&op.view(), &mixed, &EigenControl::default()),
            Err(EmbeddingError::SymmetryBlockMismatch { .. })
        ));
    }

    #[test]
    fn test_column_scaling() {
        let device = DeviceTsr::default();
        let a = from_rows(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3, &device);
        let scaled = scale_columns(&a.view(), &[2.0, 0.0, -1.0]);
        let expect = from_rows(vec![2.0, 0.0, -3.0, 8.0, 0.0, -6.0], 2, 3, &device);
        assert_abs_diff_eq!((scaled - expect).l2_norm(), 0.0, epsilon = 1e-14);
        let norms = column_sq_norms(&a.view());
        for (x, y) in norms.iter().zip([17.0, 29.0, 45.0]) {
            assert_abs_diff_eq!(*x, y, epsilon = 1e-12);
        }

        let empty: Tsr = rt::zeros(([0, 2], &device));
        assert_eq!(column_sq_norms(&empty.view()), vec![0.0, 0.0]);
        assert_eq!(scale_columns(&empty.view(), &[1.0, 1.0]).shape(), &[0, 2]);
    }

    #[test]
    fn test_svd_control() {
        let device = DeviceTsr::default();
        let a = from_rows(vec![3.0, 0.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0], 2, 4, &device);
        let res = svd_control(&a.view(), &EigenControl::default()).unwrap();
        assert_abs_diff_eq!(res.svals[0], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(res.svals[1], 2.0, epsilon = 1e-12);
        let lam = from_rows(vec![res.svals[0], 0.0, 0.0, res.svals[1]], 2, 2, &device);
        let recon = &res.lvecs % lam % res.rvecs.t();
        assert_abs_diff_eq!((recon - &a).l2_norm(), 0.0, epsilon = 1e-10);

        // rank-deficient tall matrix keeps orthonormal partners
        let b = from_rows(vec![1.0, 0.0, 1.0, 0.0, 0.0, 0.0], 3, 2, &device);
        let res = svd_control(&b.view(), &EigenControl::default()).unwrap();
        assert_abs_diff_eq!(res.svals[1], 0.0, epsilon = 1e-12);
        let gram = res.lvecs.t() % &res.lvecs;
        assert!(is_matrix_eye(&gram.view()));

        // tiny singular values keep their relative accuracy
        let c = std::f64::consts::FRAC_1_SQRT_2;
        let u = from_rows(vec![c, c, c, -c], 2, 2, &device);
        let v = from_rows(vec![0.6, 0.8, -0.8, 0.6], 2, 2, &device);
        let s = from_rows(vec![1.0, 0.0, 0.0, 1.0e-10], 2, 2, &device);
        let g = &u % s % v.t();
        let res = svd_control(&g.view(), &EigenControl { num_zero_atol: 0.0, ..EigenControl::default() }).unwrap();
        assert_abs_diff_eq!(res.svals[0], 1.0, epsilon = 1e-14);
        assert_abs_diff_eq!(res.svals[1], 1.0e-10, epsilon = 1e-14);
        let overlap = (res.rvecs.i((.., 1)) * v.i((.., 1))).sum();
        assert_abs_diff_eq!(overlap.abs(), 1.0, epsilon = 1e-4);

        let empty: Tsr = rt::zeros(([3, 0], &device));
        let res = svd_control(&empty.view(), &EigenControl::default()).unwrap();
        assert!(res.svals.is_empty());
        assert_eq!(res.lvecs.shape(), &[3, 0]);
    }
}
