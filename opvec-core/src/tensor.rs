use std::{fmt, ops::Deref, sync::Arc};

use crate::{storage::Storage, DType, Error, Result, ScalarType, Shape};

/// Shape and element type of a tensor, the part of a tensor a captured graph depends on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub shape: Shape,
    pub dtype: ScalarType,
}

impl TensorType {
    pub fn new(shape: impl Into<Shape>, dtype: ScalarType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)
    }
}

#[derive(Debug, PartialEq)]
pub struct Tensor_ {
    shape: Shape,
    storage: Storage,
}

/// A dense row-major host tensor. Cloning is cheap; the data is shared.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor(Arc<Tensor_>);

impl Deref for Tensor {
    type Target = Tensor_;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Tensor {
    pub fn new<T: DType>(shape: impl Into<Shape>, data: Vec<T>) -> Result<Self> {
        Self::from_storage(shape, T::into_storage(data))
    }

    pub fn from_storage(shape: impl Into<Shape>, storage: Storage) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != storage.len() {
            return Err(Error::ShapeMismatch {
                op: "tensor",
                expected: format!("{} elements for {shape}", shape.elem_count()),
                got: format!("{} elements", storage.len()),
            }
            .bt());
        }
        Ok(Self(Arc::new(Tensor_ { shape, storage })))
    }

    pub fn zeros(shape: impl Into<Shape>, dtype: ScalarType) -> Result<Self> {
        let shape = shape.into();
        let storage = Storage::zeros(dtype, shape.elem_count())?;
        Self::from_storage(shape, storage)
    }

    pub fn full(shape: impl Into<Shape>, dtype: ScalarType, value: f64) -> Result<Self> {
        let shape = shape.into();
        let values = vec![value; shape.elem_count()];
        Self::from_f64(shape, dtype, &values)
    }

    /// Build a tensor of `dtype` from `f64` values, converting them with `as` semantics.
    pub fn from_f64(shape: impl Into<Shape>, dtype: ScalarType, values: &[f64]) -> Result<Self> {
        Self::from_storage(shape, Storage::from_f64(dtype, values)?)
    }

    pub fn tensor_type(&self) -> TensorType {
        TensorType::new(self.shape.clone(), self.dtype())
    }
}

impl Tensor_ {
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn dtype(&self) -> ScalarType {
        self.storage.dtype()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Copy the data out as `T`. Fails if `T` is not the element type.
    pub fn to_vec<T: DType>(&self) -> Result<Vec<T>> {
        match T::slice(&self.storage) {
            Some(data) => Ok(data.to_vec()),
            None => Err(Error::msg(format!(
                "tensor holds {} elements, requested {}",
                self.dtype(),
                T::SCALAR
            ))),
        }
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.storage.to_f64_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_checks_element_count() {
        assert!(Tensor::new([2, 2], vec![1f32, 2., 3.]).is_err());
        let t = Tensor::new([2, 2], vec![1i32, 2, 3, 4]).unwrap();
        assert_eq!(t.dtype(), ScalarType::I32);
        assert_eq!(t.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4]);
        assert!(t.to_vec::<f32>().is_err());
    }
}
