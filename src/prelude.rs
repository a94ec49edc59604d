#![allow(unused)]

/* #region for API callers */

pub use crate::basis::*;
pub use crate::embedding::{EmbeddingMode, EmbeddingState, FragmentState, TrialOrbitals};
pub use crate::error::{EmbeddingError, Result};
pub use crate::eri::{EriConversion, EriStore, TaggedEri};
pub use crate::la::{EigenControl, EigenResult, SortOrder, SvdResult};
pub use crate::localintegrals::LocalIntegrals;
pub use crate::localize::LocalizationMethod;
pub use crate::meanfield::{IntegralEngine, MeanFieldReference, SymmetryInfo};
pub use crate::model::ModelHamiltonian;
pub use crate::structs::{LocalIntegralsFlags, RHFResults, ScfFlags, ScfStatus};

/* #endregion */

/* #region for developers */

// RSTSR backend specification
#[cfg(not(feature = "use_openblas"))]
pub type DeviceTsr = DeviceFaer;
#[cfg(feature = "use_openblas")]
pub type DeviceTsr = DeviceOpenBLAS;

pub(crate) use libcint::prelude::*;
pub(crate) use log::{debug, info, trace, warn};
pub(crate) use rayon::prelude::*;
pub use rstsr::prelude::*;

pub(crate) use crate::*;

pub type Tsr<D = IxD> = Tensor<f64, DeviceTsr, D>;
pub type TsrView<'a, D = IxD> = TensorView<'a, f64, DeviceTsr, D>;
pub type TsrMut<'a, D = IxD> = TensorMut<'a, f64, DeviceTsr, D>;

/* #endregion */
