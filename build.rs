use std::path::PathBuf;

const LIB_ENVS: [&str; 4] = ["REST_EXT_DIR", "LD_LIBRARY_PATH", "DYLD_LIBRARY_PATH", "PATH"];
const SYSTEM_ROOTS: [&str; 3] = ["/usr", "/usr/local", "/opt"];
const LIB_SUBDIRS: [&str; 5] = ["", "lib", "lib64", "lib/x86_64-linux-gnu", "lib/aarch64-linux-gnu"];

/// Directories that may hold `libopenblas`, from the library environment variables first and
/// the usual system prefixes after.
fn search_dirs() -> Vec<PathBuf> {
    let sep = if cfg!(windows) { ';' } else { ':' };
    let env_roots = LIB_ENVS
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .flat_map(|paths| paths.split(sep).filter(|p| !p.is_empty()).map(PathBuf::from).collect::<Vec<_>>());
    let mut dirs = vec![];
    for root in env_roots.chain(SYSTEM_ROOTS.iter().map(PathBuf::from)) {
        for sub in LIB_SUBDIRS {
            let dir = root.join(sub);
            match std::fs::canonicalize(&dir) {
                Ok(dir) if !dirs.contains(&dir) => dirs.push(dir),
                _ => (),
            }
        }
    }
    dirs
}

#[allow(unused)]
fn link_openblas() {
    for name in LIB_ENVS {
        println!("cargo:rerun-if-env-changed={name}");
    }
    for dir in search_dirs() {
        println!("cargo:rustc-link-search=native={}", dir.display());
    }
    println!("cargo:rustc-link-lib=openblas");
    println!("cargo:rustc-link-lib=gomp");
}

fn main() {
    #[cfg(feature = "use_openblas")]
    link_openblas();
}
