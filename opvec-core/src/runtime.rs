//! Invocation of compiled operator libraries.
//!
//! [`DynamicLibOp`] is the one generic entry point the host runtime knows about: it carries the
//! library paths and symbol names of an operator's forward and gradient kernels and calls them
//! on concrete tensors. Libraries are opened once per process by [`LibraryCache`] and stay
//! loaded.

use std::{
    collections::HashMap,
    ffi::c_void,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use libloading::Library;
use tracing::debug;

use crate::{
    device::{Backend, Device},
    storage::Storage,
    Error, Result, Shape, Tensor, TensorType,
};

/// `int32_t <name>_cpu(const void* const* inputs, void* const* outputs, const int64_t* shape,
/// int32_t rank)`
pub type CpuEntry =
    unsafe extern "C" fn(*const *const c_void, *const *mut c_void, *const i64, i32) -> i32;

/// `int32_t <name>_cuda(const void* const* inputs, void* const* outputs, const int64_t* shape,
/// int32_t rank, void* stream, int32_t threads_per_block)`
///
/// Buffers are device pointers; the pointer arrays themselves live in host memory.
pub type CudaEntry = unsafe extern "C" fn(
    *const *const c_void,
    *const *mut c_void,
    *const i64,
    i32,
    *mut c_void,
    i32,
) -> i32;

/// Process-wide table of opened libraries. Handles are never closed.
#[derive(Debug, Default)]
pub struct LibraryCache {
    libraries: Mutex<HashMap<PathBuf, Arc<Library>>>,
}

impl LibraryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, path: &Path) -> Result<Arc<Library>> {
        let mut libraries = self.libraries.lock().expect("library cache poisoned");
        if let Some(found) = libraries.get(path) {
            return Ok(found.clone());
        }
        let library = unsafe { Library::new(path) }.map_err(|err| Error::Load {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        debug!(path = %path.display(), "loaded library");
        let library = Arc::new(library);
        libraries.insert(path.to_path_buf(), library.clone());
        Ok(library)
    }

    pub fn len(&self) -> usize {
        self.libraries.lock().expect("library cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve `function` to a value of type `F`, which must be the symbol's exact signature.
    pub(crate) fn symbol<F: Copy>(&self, function: &NativeFunction) -> Result<(Arc<Library>, F)> {
        let library = self.load(&function.lib_path)?;
        let symbol = unsafe {
            library
                .get::<F>(function.name.as_bytes())
                .map(|symbol| *symbol)
        }
        .map_err(|err| Error::Load {
            path: function.lib_path.clone(),
            message: err.to_string(),
        })?;
        Ok((library, symbol))
    }
}

/// A symbol in a shared library. Empty means "not provided".
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct NativeFunction {
    pub lib_path: PathBuf,
    pub name: String,
}

impl NativeFunction {
    pub fn new(lib_path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            lib_path: lib_path.into(),
            name: name.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty() || self.lib_path.as_os_str().is_empty()
    }
}

/// One compiled computation, available for one or both back ends.
#[derive(Clone, Debug, PartialEq)]
pub struct NativeKernel {
    pub cpu: NativeFunction,
    pub cuda: NativeFunction,
    /// Iteration space passed as `shape`/`rank`.
    pub domain: Shape,
    pub inputs: Vec<TensorType>,
    pub outputs: Vec<TensorType>,
}

impl NativeKernel {
    pub fn function(&self, backend: Backend) -> &NativeFunction {
        match backend {
            Backend::Cpu => &self.cpu,
            Backend::Cuda => &self.cuda,
        }
    }

    fn check_inputs(&self, name: &str, inputs: &[&Tensor]) -> Result<()> {
        let got: Vec<TensorType> = inputs.iter().map(|t| t.tensor_type()).collect();
        if got != self.inputs {
            return Err(Error::ShapeMismatch {
                op: "dynamic_lib",
                expected: format!("{name} inputs {}", describe(&self.inputs)),
                got: describe(&got),
            }
            .bt());
        }
        Ok(())
    }

    /// Run on `device` and return freshly allocated, zero-initialized outputs.
    #[cfg_attr(not(feature = "cuda"), allow(unused_variables))]
    pub fn launch(
        &self,
        libs: &LibraryCache,
        device: &Device,
        inputs: &[&Tensor],
        threads_per_block: u32,
    ) -> Result<Vec<Tensor>> {
        let function = self.function(device.backend());
        if function.is_empty() {
            return Err(Error::msg(format!(
                "no {} entry point was registered",
                device.backend()
            )));
        }
        self.check_inputs(&function.name, inputs)?;
        match device {
            Device::Cpu => self.launch_cpu(libs, function, inputs),
            #[cfg(feature = "cuda")]
            Device::Cuda(cuda) => {
                let (_library, entry) = libs.symbol::<CudaEntry>(function)?;
                cuda.launch(
                    entry,
                    &function.name,
                    &self.domain,
                    inputs,
                    &self.outputs,
                    threads_per_block,
                )
            }
        }
    }

    fn launch_cpu(
        &self,
        libs: &LibraryCache,
        function: &NativeFunction,
        inputs: &[&Tensor],
    ) -> Result<Vec<Tensor>> {
        let (_library, entry) = libs.symbol::<CpuEntry>(function)?;
        let mut outputs = self
            .outputs
            .iter()
            .map(|ty| Storage::zeros(ty.dtype, ty.shape.elem_count()))
            .collect::<Result<Vec<_>>>()?;
        let input_ptrs: Vec<*const c_void> =
            inputs.iter().map(|t| t.storage().as_ptr()).collect();
        let output_ptrs: Vec<*mut c_void> = outputs.iter_mut().map(|s| s.as_mut_ptr()).collect();
        let dims = domain_dims(&self.domain);

        let code = unsafe {
            entry(
                input_ptrs.as_ptr(),
                output_ptrs.as_ptr(),
                dims.as_ptr(),
                dims.len() as i32,
            )
        };
        if code != 0 {
            return Err(Error::Execution {
                entry: function.name.clone(),
                code,
            }
            .bt());
        }
        self.outputs
            .iter()
            .zip(outputs)
            .map(|(ty, storage)| Tensor::from_storage(ty.shape.clone(), storage))
            .collect()
    }
}

pub(crate) fn domain_dims(domain: &Shape) -> Vec<i64> {
    domain.dims().iter().map(|&d| d as i64).collect()
}

fn describe(types: &[TensorType]) -> String {
    let parts: Vec<String> = types.iter().map(|t| t.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

/// The generic "dynamic library" operator the host runtime calls.
///
/// Without a gradient kernel (or with an empty entry for the device in use), backpropagating
/// through the operator fails with [`Error::NoGradient`].
#[derive(Clone, Debug, PartialEq)]
pub struct DynamicLibOp {
    pub name: String,
    pub forward: NativeKernel,
    /// Takes the forward inputs followed by one gradient per forward output and produces one
    /// gradient per forward input.
    pub grad: Option<NativeKernel>,
    pub threads_per_block: u32,
}

impl DynamicLibOp {
    pub fn out_shapes(&self) -> Vec<Shape> {
        self.forward.outputs.iter().map(|t| t.shape.clone()).collect()
    }

    pub fn out_types(&self) -> Vec<crate::ScalarType> {
        self.forward.outputs.iter().map(|t| t.dtype).collect()
    }

    pub fn has_grad(&self, backend: Backend) -> bool {
        self.grad
            .as_ref()
            .is_some_and(|grad| !grad.function(backend).is_empty())
    }

    pub fn call(&self, libs: &LibraryCache, device: &Device, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let inputs: Vec<&Tensor> = inputs.iter().collect();
        self.forward
            .launch(libs, device, &inputs, self.threads_per_block)
    }

    pub fn call_grad(
        &self,
        libs: &LibraryCache,
        device: &Device,
        inputs: &[Tensor],
        output_grads: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        let grad = match &self.grad {
            Some(grad) if !grad.function(device.backend()).is_empty() => grad,
            _ => return Err(Error::NoGradient(self.name.clone()).bt()),
        };
        let all: Vec<&Tensor> = inputs.iter().chain(output_grads).collect();
        grad.launch(libs, device, &all, self.threads_per_block)
    }
}
