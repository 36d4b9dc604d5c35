//! A small tape-based tensor runtime hosting compiled operators.
//!
//! Every operation runs eagerly and appends a node to the tape, so node ids are already in
//! topological order and the backward pass is a single reverse sweep. Compiled operators
//! enter the tape as [`DynamicLibOp`] calls: an opaque node whose reverse-mode rule is the
//! operator's gradient kernel.

use std::collections::HashMap;

use tracing::trace;

use crate::{
    device::Device, runtime::DynamicLibOp, session::Session, Error, Result, Tensor, TensorType,
};

/// Handle to a value recorded on a [`HostGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostTensor(usize);

impl HostTensor {
    pub fn id(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
enum HostOp {
    Constant,
    Variable,
    Add(HostTensor, HostTensor),
    Mul(HostTensor, HostTensor),
    Square(HostTensor),
    Scale(HostTensor, f64),
    /// Output `output` of call `call`.
    DynamicLib { call: usize, output: usize },
}

#[derive(Debug)]
struct HostNode {
    value: Tensor,
    op: HostOp,
}

#[derive(Debug)]
struct LibCall {
    op: DynamicLibOp,
    device: Device,
    inputs: Vec<HostTensor>,
    outputs: Vec<HostTensor>,
}

/// Gradients keyed by tensor, summed over every use.
#[derive(Debug, Default)]
pub struct GradStore {
    grads: HashMap<HostTensor, Tensor>,
}

impl GradStore {
    pub fn get(&self, tensor: HostTensor) -> Option<&Tensor> {
        self.grads.get(&tensor)
    }

    fn accumulate(&mut self, tensor: HostTensor, grad: Tensor) -> Result<()> {
        let sum = match self.grads.remove(&tensor) {
            Some(existing) => zip_map(&existing, &grad, |a, b| a + b)?,
            None => grad,
        };
        self.grads.insert(tensor, sum);
        Ok(())
    }
}

/// The host graph: values, the operations that produced them, and the session used to call
/// compiled libraries.
#[derive(Debug)]
pub struct HostGraph {
    session: Session,
    nodes: Vec<HostNode>,
    calls: Vec<LibCall>,
}

impl HostGraph {
    pub fn new(session: &Session) -> Self {
        Self {
            session: session.clone(),
            nodes: Vec::new(),
            calls: Vec::new(),
        }
    }

    fn push(&mut self, value: Tensor, op: HostOp) -> HostTensor {
        self.nodes.push(HostNode { value, op });
        HostTensor(self.nodes.len() - 1)
    }

    fn node(&self, t: HostTensor) -> Result<&HostNode> {
        self.nodes
            .get(t.0)
            .ok_or_else(|| Error::msg(format!("host tensor {} does not belong to this graph", t.0)))
    }

    /// A leaf that gradients do not flow into.
    pub fn constant(&mut self, value: Tensor) -> HostTensor {
        self.push(value, HostOp::Constant)
    }

    /// A leaf gradients can be requested for.
    pub fn variable(&mut self, value: Tensor) -> HostTensor {
        self.push(value, HostOp::Variable)
    }

    pub fn value(&self, t: HostTensor) -> Result<&Tensor> {
        Ok(&self.node(t)?.value)
    }

    /// Shape and element type of a recorded value.
    pub fn tensor_type(&self, t: HostTensor) -> Result<TensorType> {
        Ok(self.value(t)?.tensor_type())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add(&mut self, a: HostTensor, b: HostTensor) -> Result<HostTensor> {
        let value = zip_map(self.value(a)?, self.value(b)?, |x, y| x + y)?;
        Ok(self.push(value, HostOp::Add(a, b)))
    }

    pub fn mul(&mut self, a: HostTensor, b: HostTensor) -> Result<HostTensor> {
        let value = zip_map(self.value(a)?, self.value(b)?, |x, y| x * y)?;
        Ok(self.push(value, HostOp::Mul(a, b)))
    }

    pub fn square(&mut self, a: HostTensor) -> Result<HostTensor> {
        let value = map(self.value(a)?, |x| x * x)?;
        Ok(self.push(value, HostOp::Square(a)))
    }

    pub fn scale(&mut self, a: HostTensor, factor: f64) -> Result<HostTensor> {
        let value = map(self.value(a)?, |x| x * factor)?;
        Ok(self.push(value, HostOp::Scale(a, factor)))
    }

    /// Call a compiled operator on `device`. Returns one host tensor per declared output.
    pub fn dynamic_lib(
        &mut self,
        op: DynamicLibOp,
        inputs: &[HostTensor],
        device: Device,
    ) -> Result<Vec<HostTensor>> {
        let values = inputs
            .iter()
            .map(|&t| self.value(t).cloned())
            .collect::<Result<Vec<_>>>()?;
        let results = op.call(self.session.libraries(), &device, &values)?;
        trace!(op = %op.name, ?device, "dynamic library call");

        let call = self.calls.len();
        let outputs: Vec<HostTensor> = results
            .into_iter()
            .enumerate()
            .map(|(output, value)| self.push(value, HostOp::DynamicLib { call, output }))
            .collect();
        self.calls.push(LibCall {
            op,
            device,
            inputs: inputs.to_vec(),
            outputs: outputs.clone(),
        });
        Ok(outputs)
    }

    /// Reverse-mode gradients of `output` (seeded with ones) with respect to `wrt`.
    ///
    /// Tensors `output` does not depend on get a zero gradient.
    pub fn gradients(&self, output: HostTensor, wrt: &[HostTensor]) -> Result<Vec<Tensor>> {
        let seed = self.value(output)?;
        let mut store = GradStore::default();
        store.accumulate(
            output,
            Tensor::full(seed.shape().clone(), seed.dtype(), 1.0)?,
        )?;

        for id in (0..=output.0).rev() {
            let t = HostTensor(id);
            let node = &self.nodes[id];
            if let HostOp::DynamicLib { call, output: 0 } = node.op {
                self.backward_call(&mut store, call)?;
                continue;
            }
            let Some(grad) = store.get(t).cloned() else {
                continue;
            };
            match node.op {
                HostOp::Constant | HostOp::Variable | HostOp::DynamicLib { .. } => {}
                HostOp::Add(a, b) => {
                    store.accumulate(a, grad.clone())?;
                    store.accumulate(b, grad)?;
                }
                HostOp::Mul(a, b) => {
                    store.accumulate(a, zip_map(&grad, self.value(b)?, |g, y| g * y)?)?;
                    store.accumulate(b, zip_map(&grad, self.value(a)?, |g, x| g * x)?)?;
                }
                HostOp::Square(a) => {
                    store.accumulate(a, zip_map(&grad, self.value(a)?, |g, x| 2.0 * g * x)?)?;
                }
                HostOp::Scale(a, factor) => {
                    store.accumulate(a, map(&grad, |g| g * factor)?)?;
                }
            }
        }

        wrt.iter()
            .map(|&t| match store.get(t) {
                Some(grad) => Ok(grad.clone()),
                None => {
                    let value = self.value(t)?;
                    Tensor::zeros(value.shape().clone(), value.dtype())
                }
            })
            .collect()
    }

    /// Outputs of a call are pushed contiguously, so by the time the sweep reaches the first
    /// one every output gradient is final.
    fn backward_call(&self, store: &mut GradStore, call: usize) -> Result<()> {
        let call = &self.calls[call];
        if call.outputs.iter().all(|&t| store.get(t).is_none()) {
            return Ok(());
        }
        let output_grads = call
            .outputs
            .iter()
            .map(|&t| match store.get(t) {
                Some(grad) => Ok(grad.clone()),
                None => {
                    let value = self.value(t)?;
                    Tensor::zeros(value.shape().clone(), value.dtype())
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let inputs = call
            .inputs
            .iter()
            .map(|&t| self.value(t).cloned())
            .collect::<Result<Vec<_>>>()?;
        let input_grads =
            call.op
                .call_grad(self.session.libraries(), &call.device, &inputs, &output_grads)?;
        for (&input, grad) in call.inputs.iter().zip(input_grads) {
            store.accumulate(input, grad)?;
        }
        Ok(())
    }
}

fn map(a: &Tensor, f: impl Fn(f64) -> f64) -> Result<Tensor> {
    let values: Vec<f64> = a.to_f64_vec().into_iter().map(f).collect();
    Tensor::from_f64(a.shape().clone(), a.dtype(), &values)
}

fn zip_map(a: &Tensor, b: &Tensor, f: impl Fn(f64, f64) -> f64) -> Result<Tensor> {
    if a.tensor_type() != b.tensor_type() {
        return Err(Error::ShapeMismatch {
            op: "host",
            expected: a.tensor_type().to_string(),
            got: b.tensor_type().to_string(),
        }
        .bt());
    }
    let values: Vec<f64> = a
        .to_f64_vec()
        .into_iter()
        .zip(b.to_f64_vec())
        .map(|(x, y)| f(x, y))
        .collect();
    Tensor::from_f64(a.shape().clone(), a.dtype(), &values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, ScalarType};

    fn graph() -> (tempfile::TempDir, HostGraph) {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(Config::new(dir.path())).unwrap();
        (dir, HostGraph::new(&session))
    }

    #[test]
    fn native_ops_backpropagate() {
        let (_dir, mut g) = graph();
        let x = g.variable(Tensor::new([3], vec![1.0f64, 2.0, 3.0]).unwrap());
        let w = g.constant(Tensor::new([3], vec![0.5f64, -1.0, 2.0]).unwrap());
        // y = 3 * (x * w + x^2)
        let xw = g.mul(x, w).unwrap();
        let x2 = g.square(x).unwrap();
        let s = g.add(xw, x2).unwrap();
        let y = g.scale(s, 3.0).unwrap();

        assert_eq!(
            g.value(y).unwrap().to_vec::<f64>().unwrap(),
            vec![4.5, 6.0, 45.0]
        );
        let grads = g.gradients(y, &[x, w]).unwrap();
        // dy/dx = 3 * (w + 2x), dy/dw = 3 * x
        assert_eq!(grads[0].to_vec::<f64>().unwrap(), vec![7.5, 9.0, 24.0]);
        assert_eq!(grads[1].to_vec::<f64>().unwrap(), vec![3.0, 6.0, 9.0]);
    }

    #[test]
    fn unrelated_tensors_get_zero_gradients() {
        let (_dir, mut g) = graph();
        let x = g.variable(Tensor::new([2], vec![1.0f32, 2.0]).unwrap());
        let z = g.variable(Tensor::new([2], vec![5.0f32, 5.0]).unwrap());
        let y = g.square(x).unwrap();
        let grads = g.gradients(y, &[z]).unwrap();
        assert_eq!(grads[0].dtype(), ScalarType::F32);
        assert_eq!(grads[0].to_vec::<f32>().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn mismatched_types_are_rejected() {
        let (_dir, mut g) = graph();
        let a = g.constant(Tensor::new([2], vec![1.0f32, 2.0]).unwrap());
        let b = g.constant(Tensor::new([3], vec![1.0f32, 2.0, 3.0]).unwrap());
        let err = g.add(a, b).unwrap_err();
        assert!(matches!(err.inner(), Error::ShapeMismatch { .. }));
    }
}
