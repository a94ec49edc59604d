use clap::{Args, Parser, Subcommand};
use dmet_localints::prelude::*;
use libcint::prelude::*;
use log::info;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct CliParser {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CliArgs {
    #[clap(short, long = "mol", help = "Path to the json file containing molecular data")]
    mol_file: String,

    #[clap(short, long = "aux", help = "Path to the json file containing auxiliary basis data (enables density fitting)")]
    aux_file: Option<String>,

    #[clap(short, long, default_value = "lowdin", help = "Localization method: lowdin or boys")]
    localization: String,

    #[clap(long, default_value_t = 0, help = "Number of lowest molecular orbitals kept frozen")]
    frozen: usize,

    #[clap(long = "max-memory", help = "Memory ceiling in MB for the two-electron integrals")]
    max_memory: Option<f64>,
}

#[derive(Args, Debug)]
struct CliArgsStandalone {
    #[clap(flatten)]
    common: CliArgs,

    #[clap(long = "mo_coeff", help = "Path to the npy file of molecular orbital coefficients [nao, nmo]")]
    mo_coeff_file: String,

    #[clap(long = "mo_occ", help = "Path to the npy file of molecular orbital occupations [nmo]")]
    mo_occ_file: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[clap(name = "loc-ints", about = "Build localized-orbital integrals on top of an RHF calculation")]
    LocInts(CliArgs),

    #[clap(
        name = "loc-ints-standalone",
        about = "Build localized-orbital integrals with SCF orbitals provided by user"
    )]
    LocIntsStandalone(CliArgsStandalone),
}

type AnyResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn tensor_from_file(fname: &str) -> AnyResult<Tsr> {
    // c-contiguous numpy array
    let device = DeviceTsr::default();
    let bytes = std::fs::read(fname)?;
    let npy = npyz::NpyFile::new(&bytes[..])?;
    let shape = npy.shape().iter().map(|x| *x as usize).collect::<Vec<usize>>();
    let data: Vec<f64> = npy.into_vec()?;
    Ok(rt::asarray((data, shape.c(), &device)))
}

fn load_molecule(args: &CliArgs) -> (CInt, Option<CInt>) {
    let cint_data = CInt::from_json(&args.mol_file);
    let aux_cint_data = args.aux_file.as_ref().map(|f| CInt::from_json(f));
    (cint_data, aux_cint_data)
}

fn run_local_integrals(mf: MeanFieldReference, args: &CliArgs) -> AnyResult<()> {
    let time = std::time::Instant::now();
    let localization = args.localization.parse::<LocalizationMethod>()?;
    let active = (args.frozen..mf.nmo()).collect::<Vec<_>>();
    let flags = LocalIntegralsFlags { localization, max_memory: args.max_memory, ..Default::default() };
    let ints = LocalIntegrals::new(mf, &active, flags)?;
    println!("Localized orbitals: {}", ints.norbs_tot());
    println!("Active electrons: {}", ints.nelec_tot());
    println!("ERI backend: {}", ints.eri_store().backend_name());
    println!("|C^T S C - I|: {:.3e}", ints.loc_ortho());

    let check = ints.verify_mean_field()?;
    println!("RHF energy of mean-field input: {:.10}", check.e_reference);
    println!("RHF energy in the localized basis: {:.10}", check.e_recomputed);
    info!("Elapsed time for local integrals: {:.2?}", time.elapsed());
    Ok(())
}

fn main() -> AnyResult<()> {
    env_logger::init();
    let args = CliParser::parse();

    match args.command {
        Command::LocInts(cli_args) => {
            let (cint_data, aux_cint_data) = load_molecule(&cli_args);
            let mf = MeanFieldReference::from_cint(cint_data, aux_cint_data.as_ref(), &ScfFlags::default());
            run_local_integrals(mf, &cli_args)
        },
        Command::LocIntsStandalone(cli_args) => {
            let (cint_data, aux_cint_data) = load_molecule(&cli_args.common);
            let mo_coeff = tensor_from_file(&cli_args.mo_coeff_file)?;
            let mo_occ = tensor_from_file(&cli_args.mo_occ_file)?;
            let mf = MeanFieldReference::bare_cint(cint_data, aux_cint_data.as_ref()).with_orbitals(mo_coeff, mo_occ);
            run_local_integrals(mf, &cli_args.common)
        },
    }
}
