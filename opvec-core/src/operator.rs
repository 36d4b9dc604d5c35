//! User-defined operators and their compiled instances.

use std::{
    cell::{OnceCell, RefCell},
    collections::HashMap,
};

use tracing::debug;

use crate::{
    cache::Artifact,
    codegen::{self, c_identifier, GeneratedSource},
    device::Backend,
    expr::{Graph, InputTensor, OpBuilder, OutputTensor},
    host::{HostGraph, HostTensor},
    runtime::{DynamicLibOp, NativeFunction, NativeKernel},
    session::Session,
    Error, Result, Tensor, TensorType,
};

/// A tensor computation described once per output position.
///
/// `op` and `grad` run symbolically against an [`OpBuilder`]: they record a graph instead of
/// computing. Scalar parameters are fields of the implementing type and are baked into the
/// generated code as constants.
///
/// ```no_run
/// use opvec_core::{InputTensor, OpBuilder, Operator, OutputTensor, Result};
///
/// struct Scale(f64);
///
/// impl Operator for Scale {
///     fn op(&self, b: &OpBuilder, inputs: &[InputTensor]) -> Result<Vec<OutputTensor>> {
///         let out = b.output_like(&inputs[0]);
///         let pos = b.position_in(inputs[0].shape().clone())?;
///         out.set(&pos, inputs[0].at(&pos) * self.0);
///         Ok(vec![out])
///     }
/// }
/// ```
pub trait Operator {
    fn op(&self, b: &OpBuilder, inputs: &[InputTensor]) -> Result<Vec<OutputTensor>>;

    /// Given the forward inputs and one gradient per forward output, return one gradient per
    /// forward input with the input's shape and element type.
    fn grad(
        &self,
        b: &OpBuilder,
        inputs: &[InputTensor],
        output_grads: &[InputTensor],
    ) -> Result<Vec<OutputTensor>> {
        let _ = (b, inputs, output_grads);
        Err(Error::NoGradient(self.name()).bt())
    }

    /// Base name of the generated entry points. Defaults to the snake-cased type name.
    fn name(&self) -> String {
        snake_case(std::any::type_name::<Self>())
    }
}

fn snake_case(type_name: &str) -> String {
    let base = type_name.split('<').next().unwrap_or(type_name);
    let base = base.rsplit("::").next().unwrap_or(base);
    let chars: Vec<char> = base.chars().collect();
    let mut name = String::with_capacity(chars.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1);
            let boundary = match prev {
                Some(p) if p.is_ascii_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_ascii_uppercase() => next.is_some_and(|n| n.is_ascii_lowercase()),
                _ => false,
            };
            if boundary {
                name.push('_');
            }
            name.push(c.to_ascii_lowercase());
        } else {
            name.push(c);
        }
    }
    name
}

pub(crate) fn capture_forward(operator: &dyn Operator, inputs: &[TensorType]) -> Result<Graph> {
    let name = c_identifier(&operator.name());
    let (b, handles) = OpBuilder::new(inputs);
    let outputs = operator.op(&b, &handles)?;
    b.finish(&name, &outputs)
}

pub(crate) fn capture_grad(operator: &dyn Operator, forward: &Graph) -> Result<Graph> {
    let mut types = forward.inputs().to_vec();
    types.extend(forward.outputs().iter().cloned());
    let (b, handles) = OpBuilder::new(&types);
    let (inputs, output_grads) = handles.split_at(forward.inputs().len());
    let outputs = operator.grad(&b, inputs, output_grads)?;
    let graph = b.finish(&format!("{}_grad", forward.name()), &outputs)?;
    if graph.outputs() != forward.inputs() {
        return Err(Error::capture(format!(
            "gradient of `{}` must return one output per input with matching types, expected {:?}, got {:?}",
            forward.name(),
            forward.inputs(),
            graph.outputs()
        )));
    }
    Ok(graph)
}

/// Per-instance evaluation settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvalOptions {
    /// Rebuild on first use even if a cached library exists.
    pub clear_cache: bool,
    /// CUDA block size; the session default when `None`.
    pub threads_per_block: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum GraphKind {
    Forward,
    Grad,
}

/// An operator bound to concrete inputs, with its forward graph already captured.
pub struct OpInstance {
    session: Session,
    operator: Box<dyn Operator>,
    inputs: Vec<Tensor>,
    options: EvalOptions,
    forward: Graph,
    grad: OnceCell<Graph>,
    artifacts: RefCell<HashMap<(GraphKind, Backend), Artifact>>,
}

impl std::fmt::Debug for OpInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpInstance")
            .field("name", &self.forward.name())
            .field("inputs", &self.forward.inputs())
            .field("outputs", &self.forward.outputs())
            .field("options", &self.options)
            .finish()
    }
}

impl OpInstance {
    pub(crate) fn new(
        session: Session,
        operator: Box<dyn Operator>,
        inputs: Vec<Tensor>,
        options: EvalOptions,
    ) -> Result<Self> {
        let types: Vec<TensorType> = inputs.iter().map(|t| t.tensor_type()).collect();
        let forward = capture_forward(operator.as_ref(), &types)?;
        debug!(
            op = forward.name(),
            nodes = forward.nodes().len(),
            outputs = forward.outputs().len(),
            "captured operator"
        );
        Ok(Self {
            session,
            operator,
            inputs,
            options,
            forward,
            grad: OnceCell::new(),
            artifacts: RefCell::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        self.forward.name()
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    pub fn options(&self) -> &EvalOptions {
        &self.options
    }

    pub fn output_types(&self) -> &[TensorType] {
        self.forward.outputs()
    }

    pub fn forward_graph(&self) -> &Graph {
        &self.forward
    }

    /// The gradient graph, captured on first use.
    pub fn grad_graph(&self) -> Result<&Graph> {
        if let Some(graph) = self.grad.get() {
            return Ok(graph);
        }
        let graph = capture_grad(self.operator.as_ref(), &self.forward)?;
        debug!(op = graph.name(), nodes = graph.nodes().len(), "captured gradient");
        Ok(self.grad.get_or_init(|| graph))
    }

    fn graph(&self, kind: GraphKind) -> Result<&Graph> {
        match kind {
            GraphKind::Forward => Ok(&self.forward),
            GraphKind::Grad => self.grad_graph(),
        }
    }

    /// Generated forward source for `backend`.
    pub fn source(&self, backend: Backend) -> GeneratedSource {
        codegen::generate(&self.forward, backend)
    }

    pub fn grad_source(&self, backend: Backend) -> Result<GeneratedSource> {
        Ok(codegen::generate(self.grad_graph()?, backend))
    }

    pub fn to_dot(&self) -> String {
        self.forward.to_dot()
    }

    fn threads_per_block(&self) -> u32 {
        self.options
            .threads_per_block
            .unwrap_or(self.session.config().threads_per_block)
    }

    fn artifact(&self, kind: GraphKind, backend: Backend) -> Result<Artifact> {
        if let Some(found) = self.artifacts.borrow().get(&(kind, backend)) {
            return Ok(found.clone());
        }
        let source = codegen::generate(self.graph(kind)?, backend);
        let artifact = self.session.build(&source, self.options.clear_cache)?;
        self.artifacts
            .borrow_mut()
            .insert((kind, backend), artifact.clone());
        Ok(artifact)
    }

    fn kernel(&self, kind: GraphKind, backend: Backend) -> Result<NativeKernel> {
        let artifact = self.artifact(kind, backend)?;
        let graph = self.graph(kind)?;
        let function = NativeFunction::new(&artifact.path, &artifact.entry);
        let (cpu, cuda) = match backend {
            Backend::Cpu => (function, NativeFunction::default()),
            Backend::Cuda => (NativeFunction::default(), function),
        };
        Ok(NativeKernel {
            cpu,
            cuda,
            domain: graph.domain().clone(),
            inputs: graph.inputs().to_vec(),
            outputs: graph.outputs().to_vec(),
        })
    }

    fn run(&self, kind: GraphKind, backend: Backend, inputs: &[&Tensor]) -> Result<Vec<Tensor>> {
        let device = self.session.device(backend)?;
        let kernel = self.kernel(kind, backend)?;
        kernel.launch(
            self.session.libraries(),
            &device,
            inputs,
            self.threads_per_block(),
        )
    }

    fn bound_inputs(&self) -> Vec<&Tensor> {
        self.inputs.iter().collect()
    }

    pub fn evaluate_c(&self) -> Result<Vec<Tensor>> {
        self.run(GraphKind::Forward, Backend::Cpu, &self.bound_inputs())
    }

    pub fn evaluate_cuda(&self) -> Result<Vec<Tensor>> {
        self.run(GraphKind::Forward, Backend::Cuda, &self.bound_inputs())
    }

    /// Run the compiled forward kernel on new data with the captured signature.
    pub fn evaluate_c_with(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let inputs: Vec<&Tensor> = inputs.iter().collect();
        self.run(GraphKind::Forward, Backend::Cpu, &inputs)
    }

    pub fn evaluate_cuda_with(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let inputs: Vec<&Tensor> = inputs.iter().collect();
        self.run(GraphKind::Forward, Backend::Cuda, &inputs)
    }

    fn grad_inputs<'a>(&'a self, output_grads: &'a [Tensor]) -> Vec<&'a Tensor> {
        self.inputs.iter().chain(output_grads).collect()
    }

    /// Gradients with respect to the bound inputs, given one gradient per output.
    pub fn evaluate_grad_c(&self, output_grads: &[Tensor]) -> Result<Vec<Tensor>> {
        self.run(GraphKind::Grad, Backend::Cpu, &self.grad_inputs(output_grads))
    }

    pub fn evaluate_grad_cuda(&self, output_grads: &[Tensor]) -> Result<Vec<Tensor>> {
        self.run(GraphKind::Grad, Backend::Cuda, &self.grad_inputs(output_grads))
    }

    /// The CPU kernel, plus the CUDA one when the session has a CUDA device.
    fn registered_kernel(&self, kind: GraphKind) -> Result<NativeKernel> {
        let mut kernel = self.kernel(kind, Backend::Cpu)?;
        if self.session.cuda_enabled() {
            kernel.cuda = self.kernel(kind, Backend::Cuda)?.cuda;
        }
        Ok(kernel)
    }

    /// Build the libraries for every available back end and describe them as a
    /// [`DynamicLibOp`]. The CUDA entry points stay empty without a CUDA device.
    ///
    /// The gradient kernel is included when the operator defines `grad`.
    pub fn dynamic_lib_op(&self) -> Result<DynamicLibOp> {
        let forward = self.registered_kernel(GraphKind::Forward)?;
        let grad = match self.grad_graph() {
            Ok(_) => Some(self.registered_kernel(GraphKind::Grad)?),
            Err(err) if matches!(err.inner(), Error::NoGradient(_)) => None,
            Err(err) => return Err(err),
        };
        Ok(DynamicLibOp {
            name: self.forward.name().to_string(),
            forward,
            grad,
            threads_per_block: self.threads_per_block(),
        })
    }

    /// Add this operator to `graph` as a dynamic library node placed on `backend`, reading
    /// `inputs`. Returns one host tensor per output.
    pub fn as_host(
        &self,
        graph: &mut HostGraph,
        inputs: &[HostTensor],
        backend: Backend,
    ) -> Result<Vec<HostTensor>> {
        let device = self.session.device(backend)?;
        let op = self.dynamic_lib_op()?;
        graph.dynamic_lib(op, inputs, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScalarType::*;

    struct AddScaled;

    impl Operator for AddScaled {
        fn op(&self, b: &OpBuilder, inputs: &[InputTensor]) -> Result<Vec<OutputTensor>> {
            let out = b.output_like(&inputs[0]);
            let pos = b.position_in(inputs[0].shape().clone())?;
            out.set(&pos, inputs[0].at(&pos) + inputs[1].at(&pos) * 2.0);
            Ok(vec![out])
        }

        fn grad(
            &self,
            b: &OpBuilder,
            _inputs: &[InputTensor],
            output_grads: &[InputTensor],
        ) -> Result<Vec<OutputTensor>> {
            let da = b.output_like(&output_grads[0]);
            let pos = b.position_in(output_grads[0].shape().clone())?;
            let g = output_grads[0].at(&pos);
            da.set(&pos, &g);
            Ok(vec![da])
        }
    }

    #[test]
    fn default_names_are_snake_case() {
        assert_eq!(snake_case("my_crate::ops::LSTMCell"), "lstm_cell");
        assert_eq!(snake_case("AddScaled"), "add_scaled");
        assert_eq!(snake_case("ops::Clip<f32>"), "clip");
        assert_eq!(snake_case("Conv2dTranspose"), "conv2d_transpose");
        assert_eq!(AddScaled.name(), "add_scaled");
    }

    #[test]
    fn grad_must_cover_every_input() {
        let types = [TensorType::new([4], F32), TensorType::new([4], F32)];
        let forward = capture_forward(&AddScaled, &types).unwrap();
        assert_eq!(forward.name(), "add_scaled");
        let err = capture_grad(&AddScaled, &forward).unwrap_err();
        match err.inner() {
            Error::Capture(msg) => assert!(msg.contains("one output per input"), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    struct NoGrad;

    impl Operator for NoGrad {
        fn op(&self, b: &OpBuilder, inputs: &[InputTensor]) -> Result<Vec<OutputTensor>> {
            let out = b.output_like(&inputs[0]);
            let pos = b.position_in(inputs[0].shape().clone())?;
            out.set(&pos, -inputs[0].at(&pos));
            Ok(vec![out])
        }
    }

    #[test]
    fn missing_grad_is_reported() {
        let forward = capture_forward(&NoGrad, &[TensorType::new([2], F64)]).unwrap();
        let err = capture_grad(&NoGrad, &forward).unwrap_err();
        assert!(matches!(err.inner(), Error::NoGradient(name) if name == "no_grad"));
    }
}
