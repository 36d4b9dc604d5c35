/// cudarc related errors
#[derive(thiserror::Error, Debug)]
pub enum CudaError {
    #[error(transparent)]
    Cuda(#[from] cudarc::driver::DriverError),

    #[error("{cuda} when transferring {what}")]
    Transfer {
        cuda: cudarc::driver::DriverError,
        what: String,
    },
}

impl From<CudaError> for crate::Error {
    fn from(val: CudaError) -> Self {
        crate::Error::Cuda(Box::new(val)).bt()
    }
}

pub trait WrapErr<O> {
    fn w(self) -> std::result::Result<O, crate::Error>;
}

impl<O, E: Into<CudaError>> WrapErr<O> for std::result::Result<O, E> {
    fn w(self) -> std::result::Result<O, crate::Error> {
        self.map_err(|e| crate::Error::Cuda(Box::new(e.into())).bt())
    }
}

/// Attach the name of the buffer being moved to a driver error.
pub(crate) fn transfer<O>(
    result: std::result::Result<O, cudarc::driver::DriverError>,
    what: impl FnOnce() -> String,
) -> crate::Result<O> {
    result.map_err(|cuda| {
        CudaError::Transfer {
            cuda,
            what: what(),
        }
        .into()
    })
}
