//! opvec compiles elementwise tensor operators written once, per output position, into native
//! CPU and CUDA kernels.
//!
//! An [`Operator`] describes what one position of its output computes. Running it against an
//! [`OpBuilder`] records an expression graph instead of computing anything. The graph is then
//! lowered to C++ or CUDA source, built by the system toolchain into a shared library that is
//! cached on disk by content, and loaded and invoked on concrete [`Tensor`]s.
//!
//! ## A quick guide
//! - Create a [`Session`]. It owns the [`Config`], the artifact cache and the loaded libraries.
//! - Implement [`Operator`] for a type whose fields are the operator's scalar parameters.
//! - Bind it to inputs with [`Session::instantiate`], which captures the graph and infers the
//!   output shapes and types.
//! - Run with [`OpInstance::evaluate_c`] or [`OpInstance::evaluate_cuda`]. Gradients run with
//!   [`OpInstance::evaluate_grad_c`] if the operator implements [`Operator::grad`].
//! - Use [`OpInstance::as_host`] to insert the compiled operator into a [`HostGraph`] and
//!   backpropagate through it.
//!
//! ## What can you do with it?
//! ```no_run
//! use opvec_core::{InputTensor, OpBuilder, Operator, OutputTensor, Result, Session, Tensor};
//!
//! struct Clip {
//!     lo: f64,
//!     hi: f64,
//! }
//!
//! impl Operator for Clip {
//!     fn op(&self, b: &OpBuilder, inputs: &[InputTensor]) -> Result<Vec<OutputTensor>> {
//!         let out = b.output_like(&inputs[0]);
//!         let pos = b.position_in(inputs[0].shape().clone())?;
//!         let x = inputs[0].at(&pos);
//!         b.if_(&x.lt(self.lo), |_| {
//!             out.set(&pos, self.lo);
//!             Ok(())
//!         })?
//!         .elif_(&x.gt(self.hi), |_| {
//!             out.set(&pos, self.hi);
//!             Ok(())
//!         })?
//!         .else_(|_| {
//!             out.set(&pos, &x);
//!             Ok(())
//!         })?;
//!         Ok(vec![out])
//!     }
//! }
//!
//! let session = Session::from_env()?;
//! let x = Tensor::new([4], vec![-2.0f32, 0.25, 0.5, 3.0])?;
//! let clip = session.instantiate(Clip { lo: 0.0, hi: 1.0 }, &[x])?;
//! let out = clip.evaluate_c()?;
//! assert_eq!(out[0].to_vec::<f32>()?, vec![0.0, 0.25, 0.5, 1.0]);
//! # Ok::<(), opvec_core::Error>(())
//! ```

mod cache;
mod codegen;
mod config;
#[cfg(feature = "cuda")]
mod cuda_backend;
mod device;
mod dtype;
mod error;
pub mod expr;
mod host;
mod operator;
mod runtime;
mod session;
mod shape;
mod storage;
mod tensor;
mod toolchain;

pub use cache::{Artifact, ArtifactCache, CacheStats};
pub use codegen::{generate, GeneratedSource};
pub use config::{Config, DEFAULT_THREADS_PER_BLOCK};
pub use device::{Backend, Device};
pub use dtype::{DType, Scalar, ScalarType};
pub use error::{Context, Error, Result};
pub use expr::{
    arctan2, logical_and, logical_not, logical_or, maximum, minimum, power, BinaryOpType, Expr,
    Graph, IfChain, InputTensor, OpBuilder, Operand, OutputTensor, Position, UnaryOpType,
    Variable,
};
pub use host::{GradStore, HostGraph, HostTensor};
pub use operator::{EvalOptions, OpInstance, Operator};
pub use runtime::{CpuEntry, CudaEntry, DynamicLibOp, LibraryCache, NativeFunction, NativeKernel};
pub use session::Session;
pub use shape::Shape;
pub use storage::Storage;
pub use tensor::{Tensor, TensorType};
pub use toolchain::{CxxToolchain, NvccToolchain, Toolchain};
