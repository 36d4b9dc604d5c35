//! External compilers that turn generated source into shared libraries.

use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::OnceLock,
};

use tracing::{debug, warn};

use crate::{device::Backend, Error, Result};

/// A native toolchain. Given the same source it deterministically produces the same library
/// or fails.
pub trait Toolchain: Send + Sync {
    fn backend(&self) -> Backend;

    /// Identifies the compiler build, folded into artifact fingerprints.
    fn identity(&self) -> Result<String>;

    /// Extension the source file must carry for this toolchain.
    fn source_extension(&self) -> &'static str;

    /// Compile `source` into the shared library `output`.
    fn build(&self, source: &Path, output: &Path) -> Result<()>;
}

pub(crate) fn lib_ext() -> &'static str {
    if cfg!(target_os = "macos") {
        ".dylib"
    } else if cfg!(target_os = "windows") {
        ".dll"
    } else {
        ".so"
    }
}

fn run(backend: Backend, cmd: &mut Command) -> Result<()> {
    let program = PathBuf::from(cmd.get_program());
    debug!(%backend, command = ?cmd, "invoking toolchain");
    let output = cmd
        .output()
        .map_err(|source| Error::Toolchain { program, source })?;
    if !output.status.success() {
        return Err(Error::Compile {
            backend,
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
        .bt());
    }
    Ok(())
}

/// First line of `<program> --version`.
fn version_banner(program: &Path) -> Result<String> {
    let output = Command::new(program)
        .arg("--version")
        .output()
        .map_err(|source| Error::Toolchain {
            program: program.to_path_buf(),
            source,
        })?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let banner = stdout.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    Ok(format!("{} {}", program.display(), banner.trim()))
}

fn cached_identity(cell: &OnceLock<String>, program: &Path) -> Result<String> {
    if let Some(identity) = cell.get() {
        return Ok(identity.clone());
    }
    let identity = version_banner(program)?;
    Ok(cell.get_or_init(|| identity).clone())
}

/// `c++` (or `$CXX`) building the CPU backend.
#[derive(Debug)]
pub struct CxxToolchain {
    program: PathBuf,
    include_dir: PathBuf,
    identity: OnceLock<String>,
}

impl CxxToolchain {
    pub fn new(program: impl Into<PathBuf>, include_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            include_dir: include_dir.into(),
            identity: OnceLock::new(),
        }
    }
}

impl Toolchain for CxxToolchain {
    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    fn identity(&self) -> Result<String> {
        cached_identity(&self.identity, &self.program)
    }

    fn source_extension(&self) -> &'static str {
        "cpp"
    }

    fn build(&self, source: &Path, output: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-std=c++11", "-O3", "-fPIC", "-Wall", "-Wextra"]);
        if cfg!(target_os = "macos") {
            cmd.arg("-dynamiclib");
        } else {
            cmd.arg("-shared");
        }
        cmd.arg("-I")
            .arg(&self.include_dir)
            .arg(source)
            .arg("-o")
            .arg(output);
        run(Backend::Cpu, &mut cmd)
    }
}

/// `nvcc` building the CUDA backend in two steps: object, then shared library.
#[derive(Debug)]
pub struct NvccToolchain {
    program: PathBuf,
    include_dir: PathBuf,
    identity: OnceLock<String>,
}

impl NvccToolchain {
    pub fn new(program: impl Into<PathBuf>, include_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            include_dir: include_dir.into(),
            identity: OnceLock::new(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Toolchain for NvccToolchain {
    fn backend(&self) -> Backend {
        Backend::Cuda
    }

    fn identity(&self) -> Result<String> {
        cached_identity(&self.identity, &self.program)
    }

    fn source_extension(&self) -> &'static str {
        "cu"
    }

    fn build(&self, source: &Path, output: &Path) -> Result<()> {
        let object = output.with_extension("o");

        let mut compile = Command::new(&self.program);
        compile
            .args([
                "-O3",
                "--fmad=false",
                "--compile",
                "-Xcompiler",
                "-fPIC",
                "-std=c++11",
            ])
            .arg("-I")
            .arg(&self.include_dir)
            .arg(source)
            .arg("-o")
            .arg(&object);
        run(Backend::Cuda, &mut compile)?;

        let mut link = Command::new(&self.program);
        link.args(["-shared", "-Xcompiler", "-fPIC"])
            .arg("-o")
            .arg(output)
            .arg(&object);
        let linked = run(Backend::Cuda, &mut link);

        if let Err(err) = std::fs::remove_file(&object) {
            warn!(path = %object.display(), %err, "failed to remove intermediate object");
        }
        linked
    }
}
