//! Launching generated CUDA entry points.
//!
//! The generated `extern "C"` launcher takes device pointers, so this module owns the host side
//! of a launch: upload the inputs, allocate zeroed outputs, call the entry on our stream and
//! copy the results back.

use std::{ffi::c_void, sync::Arc};

use cudarc::driver::{
    CudaContext, CudaSlice, CudaStream, DevicePtr, DevicePtrMut, DeviceRepr, ValidAsZeroBits,
};
use error::{transfer, WrapErr};
use tracing::trace;

use crate::{
    runtime::{domain_dims, CudaEntry},
    bail,
    storage::Storage,
    Error, Result, ScalarType, Shape, Tensor, TensorType,
};

pub(crate) mod error;

#[derive(Clone)]
pub struct CudaDevice {
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

/// Device memory for one tensor, one variant per element type.
enum DeviceBuffer {
    I8(CudaSlice<i8>),
    I16(CudaSlice<i16>),
    I32(CudaSlice<i32>),
    I64(CudaSlice<i64>),
    U8(CudaSlice<u8>),
    U16(CudaSlice<u16>),
    U32(CudaSlice<u32>),
    U64(CudaSlice<u64>),
    F32(CudaSlice<f32>),
    F64(CudaSlice<f64>),
}

macro_rules! with_buffer {
    ($buffer:expr, $slice:ident => $body:expr) => {
        match $buffer {
            DeviceBuffer::I8($slice) => $body,
            DeviceBuffer::I16($slice) => $body,
            DeviceBuffer::I32($slice) => $body,
            DeviceBuffer::I64($slice) => $body,
            DeviceBuffer::U8($slice) => $body,
            DeviceBuffer::U16($slice) => $body,
            DeviceBuffer::U32($slice) => $body,
            DeviceBuffer::U64($slice) => $body,
            DeviceBuffer::F32($slice) => $body,
            DeviceBuffer::F64($slice) => $body,
        }
    };
}

/// Apply `$body` to the vector in `$storage` and wrap the result in the matching variant of
/// `$target`.
macro_rules! map_storage {
    ($storage:expr, $target:ident, $data:ident => $body:expr) => {
        match $storage {
            Storage::I8($data) => $target::I8($body),
            Storage::I16($data) => $target::I16($body),
            Storage::I32($data) => $target::I32($body),
            Storage::I64($data) => $target::I64($body),
            Storage::U8($data) => $target::U8($body),
            Storage::U16($data) => $target::U16($body),
            Storage::U32($data) => $target::U32($body),
            Storage::U64($data) => $target::U64($body),
            Storage::F32($data) => $target::F32($body),
            Storage::F64($data) => $target::F64($body),
        }
    };
}

/// The inverse of `map_storage!`.
macro_rules! map_buffer {
    ($buffer:expr, $target:ident, $slice:ident => $body:expr) => {
        match $buffer {
            DeviceBuffer::I8($slice) => $target::I8($body),
            DeviceBuffer::I16($slice) => $target::I16($body),
            DeviceBuffer::I32($slice) => $target::I32($body),
            DeviceBuffer::I64($slice) => $target::I64($body),
            DeviceBuffer::U8($slice) => $target::U8($body),
            DeviceBuffer::U16($slice) => $target::U16($body),
            DeviceBuffer::U32($slice) => $target::U32($body),
            DeviceBuffer::U64($slice) => $target::U64($body),
            DeviceBuffer::F32($slice) => $target::F32($body),
            DeviceBuffer::F64($slice) => $target::F64($body),
        }
    };
}

impl DeviceBuffer {
    fn device_ptr(&self, stream: &CudaStream) -> *const c_void {
        with_buffer!(self, slice => {
            let (ptr, _sync) = slice.device_ptr(stream);
            ptr as *const c_void
        })
    }

    fn device_ptr_mut(&mut self, stream: &CudaStream) -> *mut c_void {
        with_buffer!(self, slice => {
            let (ptr, _sync) = slice.device_ptr_mut(stream);
            ptr as *mut c_void
        })
    }
}

impl CudaDevice {
    pub(crate) fn new(ordinal: usize) -> Result<Self> {
        let context = CudaContext::new(ordinal).w()?;
        let stream = context.new_stream().w()?;
        Ok(Self { context, stream })
    }

    /// Copy `storage` to the device. Empty tensors get a one-element buffer so every pointer
    /// handed to the launcher is valid.
    fn upload(&self, storage: &Storage) -> Result<DeviceBuffer> {
        let stream = &self.stream;
        let buffer = map_storage!(storage, DeviceBuffer, data => {
            let result = if data.is_empty() {
                stream.alloc_zeros(1)
            } else {
                stream.memcpy_stod(data)
            };
            transfer(result, || format!("{} input elements", data.len()))?
        });
        Ok(buffer)
    }

    fn zeros<T: DeviceRepr + ValidAsZeroBits>(&self, ty: &TensorType) -> Result<CudaSlice<T>> {
        let len = ty.shape.elem_count().max(1);
        transfer(self.stream.alloc_zeros(len), || format!("output {ty}"))
    }

    fn alloc_output(&self, ty: &TensorType) -> Result<DeviceBuffer> {
        Ok(match ty.dtype {
            ScalarType::I8 => DeviceBuffer::I8(self.zeros(ty)?),
            ScalarType::I16 => DeviceBuffer::I16(self.zeros(ty)?),
            ScalarType::I32 => DeviceBuffer::I32(self.zeros(ty)?),
            ScalarType::I64 => DeviceBuffer::I64(self.zeros(ty)?),
            ScalarType::U8 => DeviceBuffer::U8(self.zeros(ty)?),
            ScalarType::U16 => DeviceBuffer::U16(self.zeros(ty)?),
            ScalarType::U32 => DeviceBuffer::U32(self.zeros(ty)?),
            ScalarType::U64 => DeviceBuffer::U64(self.zeros(ty)?),
            ScalarType::F32 => DeviceBuffer::F32(self.zeros(ty)?),
            ScalarType::F64 => DeviceBuffer::F64(self.zeros(ty)?),
            ScalarType::Bool => bail!("tensors cannot hold bool elements"),
        })
    }

    fn download(&self, buffer: &DeviceBuffer, len: usize) -> Result<Storage> {
        let stream = &self.stream;
        let storage = map_buffer!(buffer, Storage, slice => {
            let mut data =
                transfer(stream.memcpy_dtov(slice), || format!("{len} output elements"))?;
            data.truncate(len);
            data
        });
        Ok(storage)
    }

    /// Run a generated CUDA launcher over `domain` and return its outputs as host tensors.
    pub(crate) fn launch(
        &self,
        entry: CudaEntry,
        entry_name: &str,
        domain: &Shape,
        inputs: &[&Tensor],
        outputs: &[TensorType],
        threads_per_block: u32,
    ) -> Result<Vec<Tensor>> {
        self.context.bind_to_thread().w()?;

        let device_inputs = inputs
            .iter()
            .map(|t| self.upload(t.storage()))
            .collect::<Result<Vec<_>>>()?;
        let mut device_outputs = outputs
            .iter()
            .map(|ty| self.alloc_output(ty))
            .collect::<Result<Vec<_>>>()?;

        let input_ptrs: Vec<*const c_void> = device_inputs
            .iter()
            .map(|b| b.device_ptr(&self.stream))
            .collect();
        let output_ptrs: Vec<*mut c_void> = device_outputs
            .iter_mut()
            .map(|b| b.device_ptr_mut(&self.stream))
            .collect();
        let dims = domain_dims(domain);
        let tpb = i32::try_from(threads_per_block).unwrap_or(i32::MAX);

        trace!(entry = entry_name, %domain, threads_per_block, "launching kernel");
        let code = unsafe {
            entry(
                input_ptrs.as_ptr(),
                output_ptrs.as_ptr(),
                dims.as_ptr(),
                dims.len() as i32,
                self.stream.cu_stream() as *mut c_void,
                tpb,
            )
        };
        self.stream.synchronize().w()?;
        if code != 0 {
            return Err(Error::Execution {
                entry: entry_name.to_string(),
                code,
            }
            .bt());
        }

        outputs
            .iter()
            .zip(&device_outputs)
            .map(|(ty, buffer)| {
                let storage = self.download(buffer, ty.shape.elem_count())?;
                Tensor::from_storage(ty.shape.clone(), storage)
            })
            .collect()
    }
}
