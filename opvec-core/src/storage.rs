use std::ffi::c_void;

use crate::{bail, DType, Result, ScalarType};

/// Host memory behind a [`crate::Tensor`], one variant per element type.
#[derive(Clone, Debug, PartialEq)]
pub enum Storage {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Run `$body` with `$data` bound to the typed vector inside a [`Storage`].
macro_rules! with_storage {
    ($storage:expr, $data:ident => $body:expr) => {
        match $storage {
            Storage::I8($data) => $body,
            Storage::I16($data) => $body,
            Storage::I32($data) => $body,
            Storage::I64($data) => $body,
            Storage::U8($data) => $body,
            Storage::U16($data) => $body,
            Storage::U32($data) => $body,
            Storage::U64($data) => $body,
            Storage::F32($data) => $body,
            Storage::F64($data) => $body,
        }
    };
}

/// Build the [`Storage`] variant for `$dtype`, binding `$t` to its element type in `$body`.
macro_rules! storage_for {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            ScalarType::I8 => {
                type $t = i8;
                Ok(Storage::I8($body))
            }
            ScalarType::I16 => {
                type $t = i16;
                Ok(Storage::I16($body))
            }
            ScalarType::I32 => {
                type $t = i32;
                Ok(Storage::I32($body))
            }
            ScalarType::I64 => {
                type $t = i64;
                Ok(Storage::I64($body))
            }
            ScalarType::U8 => {
                type $t = u8;
                Ok(Storage::U8($body))
            }
            ScalarType::U16 => {
                type $t = u16;
                Ok(Storage::U16($body))
            }
            ScalarType::U32 => {
                type $t = u32;
                Ok(Storage::U32($body))
            }
            ScalarType::U64 => {
                type $t = u64;
                Ok(Storage::U64($body))
            }
            ScalarType::F32 => {
                type $t = f32;
                Ok(Storage::F32($body))
            }
            ScalarType::F64 => {
                type $t = f64;
                Ok(Storage::F64($body))
            }
            ScalarType::Bool => bail!("tensors cannot hold bool elements"),
        }
    };
}

impl Storage {
    pub fn zeros(dtype: ScalarType, len: usize) -> Result<Self> {
        storage_for!(dtype, T => vec![T::default(); len])
    }

    /// Convert `values` into `dtype` the way an `as` cast does.
    pub fn from_f64(dtype: ScalarType, values: &[f64]) -> Result<Self> {
        storage_for!(dtype, T => values.iter().map(|v| <T as DType>::from_f64(*v)).collect())
    }

    pub fn dtype(&self) -> ScalarType {
        match self {
            Self::I8(_) => ScalarType::I8,
            Self::I16(_) => ScalarType::I16,
            Self::I32(_) => ScalarType::I32,
            Self::I64(_) => ScalarType::I64,
            Self::U8(_) => ScalarType::U8,
            Self::U16(_) => ScalarType::U16,
            Self::U32(_) => ScalarType::U32,
            Self::U64(_) => ScalarType::U64,
            Self::F32(_) => ScalarType::F32,
            Self::F64(_) => ScalarType::F64,
        }
    }

    pub fn len(&self) -> usize {
        with_storage!(self, data => data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        with_storage!(self, data => data.iter().map(|v| v.to_f64()).collect())
    }

    pub(crate) fn as_ptr(&self) -> *const c_void {
        with_storage!(self, data => data.as_ptr() as *const c_void)
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut c_void {
        with_storage!(self, data => data.as_mut_ptr() as *mut c_void)
    }
}
