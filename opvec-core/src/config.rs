use std::path::{Path, PathBuf};

use crate::{Context, Result};

/// Threads per block used by generated CUDA launchers unless overridden.
pub const DEFAULT_THREADS_PER_BLOCK: u32 = 32;

/// Where artifacts live and which toolchains build them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Versioned cache directory: `<base>/<crate version>`.
    pub cache_root: PathBuf,
    /// C++ compiler for the CPU backend.
    pub cxx: PathBuf,
    /// CUDA installation; `nvcc` is looked up in its `bin` directory.
    pub cuda_home: PathBuf,
    pub threads_per_block: u32,
}

impl Config {
    /// Defaults rooted at `cache_base`, without looking at the environment.
    pub fn new(cache_base: impl AsRef<Path>) -> Self {
        Self {
            cache_root: versioned(cache_base.as_ref()),
            cxx: PathBuf::from("c++"),
            cuda_home: PathBuf::from("/usr/local/cuda"),
            threads_per_block: DEFAULT_THREADS_PER_BLOCK,
        }
    }

    /// Resolve the configuration from `OPVEC_HOME`, `CXX` and `CUDA_HOME`.
    ///
    /// The cache base defaults to `~/.opvec`.
    pub fn from_env() -> Result<Self> {
        let base = match std::env::var_os("OPVEC_HOME") {
            Some(home) => PathBuf::from(home),
            None => dirs::home_dir()
                .context("unable to determine the home directory, set OPVEC_HOME")?
                .join(".opvec"),
        };
        let mut config = Self::new(base);
        if let Some(cxx) = std::env::var_os("CXX") {
            config.cxx = PathBuf::from(cxx);
        }
        if let Some(cuda_home) = std::env::var_os("CUDA_HOME") {
            config.cuda_home = PathBuf::from(cuda_home);
        }
        Ok(config)
    }

    /// Same toolchains, different cache base.
    pub fn with_cache_base(mut self, cache_base: impl AsRef<Path>) -> Self {
        self.cache_root = versioned(cache_base.as_ref());
        self
    }

    pub fn with_threads_per_block(mut self, threads_per_block: u32) -> Self {
        self.threads_per_block = threads_per_block;
        self
    }

    pub fn include_dir(&self) -> PathBuf {
        self.cache_root.join("include")
    }

    pub fn nvcc(&self) -> PathBuf {
        self.cuda_home.join("bin").join("nvcc")
    }
}

fn versioned(base: &Path) -> PathBuf {
    base.join(env!("CARGO_PKG_VERSION"))
}
