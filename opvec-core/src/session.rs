use std::sync::Arc;

use tracing::info;

use crate::{
    cache::{Artifact, ArtifactCache},
    codegen::GeneratedSource,
    config::Config,
    device::{Backend, Device},
    operator::{EvalOptions, OpInstance, Operator},
    runtime::LibraryCache,
    toolchain::{CxxToolchain, Toolchain},
    Error, Result, Tensor,
};

#[cfg(feature = "cuda")]
use crate::{cuda_backend::CudaDevice, toolchain::NvccToolchain};

#[cfg(feature = "cuda")]
struct CudaSupport {
    toolchain: NvccToolchain,
    device: CudaDevice,
}

struct SessionInner {
    config: Config,
    cache: ArtifactCache,
    libraries: LibraryCache,
    cxx: CxxToolchain,
    #[cfg(feature = "cuda")]
    cuda: Option<CudaSupport>,
}

/// Shared state for compiling and running operators: configuration, the artifact cache, the
/// loaded libraries and the available toolchains. Cloning is cheap.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("cache_root", &self.inner.config.cache_root)
            .field("cuda", &self.cuda_enabled())
            .finish()
    }
}

impl Session {
    /// Open the cache described by `config` and probe for CUDA.
    pub fn new(config: Config) -> Result<Self> {
        let cache = ArtifactCache::new(&config.cache_root)?;
        let cxx = CxxToolchain::new(&config.cxx, cache.include_dir());

        #[cfg(feature = "cuda")]
        let cuda = detect_cuda(&config, &cache);
        #[cfg(not(feature = "cuda"))]
        info!("built without the `cuda` feature, running on CPU only");

        info!(cache_root = %config.cache_root.display(), "session ready");
        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                cache,
                libraries: LibraryCache::new(),
                cxx,
                #[cfg(feature = "cuda")]
                cuda,
            }),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(Config::from_env()?)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.inner.cache
    }

    pub fn libraries(&self) -> &LibraryCache {
        &self.inner.libraries
    }

    pub fn cuda_enabled(&self) -> bool {
        #[cfg(feature = "cuda")]
        {
            self.inner.cuda.is_some()
        }
        #[cfg(not(feature = "cuda"))]
        {
            false
        }
    }

    /// The device that runs `backend` kernels.
    pub fn device(&self, backend: Backend) -> Result<Device> {
        match backend {
            Backend::Cpu => Ok(Device::Cpu),
            #[cfg(feature = "cuda")]
            Backend::Cuda => self
                .inner
                .cuda
                .as_ref()
                .map(|cuda| Device::Cuda(cuda.device.clone()))
                .ok_or_else(|| Error::CudaUnavailable.bt()),
            #[cfg(not(feature = "cuda"))]
            Backend::Cuda => Err(Error::CudaUnavailable.bt()),
        }
    }

    fn toolchain(&self, backend: Backend) -> Result<&dyn Toolchain> {
        match backend {
            Backend::Cpu => Ok(&self.inner.cxx),
            #[cfg(feature = "cuda")]
            Backend::Cuda => self
                .inner
                .cuda
                .as_ref()
                .map(|cuda| &cuda.toolchain as &dyn Toolchain)
                .ok_or_else(|| Error::CudaUnavailable.bt()),
            #[cfg(not(feature = "cuda"))]
            Backend::Cuda => Err(Error::CudaUnavailable.bt()),
        }
    }

    /// Compile `source` with the toolchain of its backend, or reuse a cached build.
    pub fn build(&self, source: &GeneratedSource, force: bool) -> Result<Artifact> {
        let toolchain = self.toolchain(source.backend)?;
        self.inner.cache.get_or_build(toolchain, source, force)
    }

    /// Capture `operator` against `inputs` with default options.
    pub fn instantiate<O: Operator + 'static>(
        &self,
        operator: O,
        inputs: &[Tensor],
    ) -> Result<OpInstance> {
        self.instantiate_with(operator, inputs, EvalOptions::default())
    }

    pub fn instantiate_with<O: Operator + 'static>(
        &self,
        operator: O,
        inputs: &[Tensor],
        options: EvalOptions,
    ) -> Result<OpInstance> {
        OpInstance::new(self.clone(), Box::new(operator), inputs.to_vec(), options)
    }
}

#[cfg(feature = "cuda")]
fn detect_cuda(config: &Config, cache: &ArtifactCache) -> Option<CudaSupport> {
    let nvcc = config.nvcc();
    if !nvcc.is_file() {
        info!(nvcc = %nvcc.display(), "nvcc not found, running on CPU only");
        return None;
    }
    match CudaDevice::new(0) {
        Ok(device) => {
            info!(nvcc = %nvcc.display(), "CUDA enabled");
            Some(CudaSupport {
                toolchain: NvccToolchain::new(nvcc, cache.include_dir()),
                device,
            })
        }
        Err(err) => {
            info!(%err, "no usable CUDA device, running on CPU only");
            None
        }
    }
}
