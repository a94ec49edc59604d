#![allow(clippy::deref_addrof)]

pub mod prelude;

pub mod basis;
pub mod diis;
pub mod embedding;
pub mod error;
pub mod eri;
pub mod la;
pub mod localintegrals;
pub mod localize;
pub mod meanfield;
pub mod model;
pub mod rhf;
pub mod structs;
pub mod util;

#[test]
fn playground_rhf() {
    use crate::prelude::*;

    let _ = env_logger::builder().is_test(true).try_init();
    let cint_data = init_h2o_def2_tzvp();
    let mf = MeanFieldReference::from_cint(cint_data, None, &ScfFlags::default());
    println!("RHF energy: {}", mf.e_tot);
    assert!(mf.status.as_ref().is_some_and(|s| s.converged));
}

#[test]
fn playground_ri_rhf() {
    use crate::prelude::*;

    let _ = env_logger::builder().is_test(true).try_init();
    let cint_data = init_h2o_def2_tzvp();
    let aux_cint_data = init_h2o_def2_jk();
    let mf = MeanFieldReference::from_cint(cint_data, Some(&aux_cint_data), &ScfFlags::default());
    println!("RI-RHF energy: {}", mf.e_tot);
    assert!(mf.cderi.is_some());
}

#[test]
fn playground_lowdin_local_integrals() {
    use crate::prelude::*;

    let _ = env_logger::builder().is_test(true).try_init();
    let cint_data = init_h2o_def2_tzvp();
    let aux_cint_data = init_h2o_def2_jk();
    let mf = MeanFieldReference::from_cint(cint_data, Some(&aux_cint_data), &ScfFlags::default());
    let e_ref = mf.e_tot;
    let nmo = mf.nmo();
    let active = (0..nmo).collect::<Vec<_>>();
    let ints = LocalIntegrals::new(mf, &active, LocalIntegralsFlags::default()).unwrap();
    println!("Localized orbitals: {}, electrons: {}", ints.norbs_tot(), ints.nelec_tot());
    println!("ERI backend: {}", ints.eri_store().backend_name());
    assert!(ints.loc_ortho() < 1e-8);
    assert_eq!(ints.nelec_tot(), 10);

    let check = ints.verify_mean_field().unwrap();
    println!("RHF energy recomputed in the localized basis: {}", check.e_recomputed);
    assert!((check.e_recomputed - e_ref).abs() < 1e-6);
}

#[test]
fn playground_boys_frozen_core() {
    use crate::prelude::*;

    let _ = env_logger::builder().is_test(true).try_init();
    let cint_data = init_h2o_def2_tzvp();
    let mf = MeanFieldReference::from_cint(cint_data, None, &ScfFlags::default());
    let nmo = mf.nmo();
    let active = (1..nmo).collect::<Vec<_>>();
    let flags = LocalIntegralsFlags { localization: LocalizationMethod::Boys, ..Default::default() };
    let ints = LocalIntegrals::new(mf, &active, flags).unwrap();
    assert_eq!(ints.nelec_tot(), 8);
    println!("Frozen-core constant: {}", ints.const_energy());
}
