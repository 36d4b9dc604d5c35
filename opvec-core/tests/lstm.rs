//! An LSTM cell with a hand-written gradient and a hand-written forward-mode derivative,
//! checked against finite differences and against each other.

mod common;

use common::{assert_close, available, evaluate, evaluate_grad, session};
use opvec_core::{
    Backend, Expr, InputTensor, OpBuilder, OpInstance, Operator, OutputTensor, Result, Session,
    Tensor,
};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

const BATCH: usize = 3;
const UNITS: usize = 5;

/// Inputs: gate pre-activations `[batch, 4 * units]` (input, candidate, forget, output) and
/// the previous cell state `[batch, units]`. Outputs: new cell state and new hidden state.
struct LstmCell {
    forget_bias: f64,
}

fn sigmoid(x: &Expr) -> Expr {
    1.0 / ((-x).exp() + 1.0)
}

struct Gates {
    i: Expr,
    j: Expr,
    f: Expr,
    o: Expr,
    c: Expr,
    new_c: Expr,
}

impl LstmCell {
    fn gates(&self, b: &OpBuilder, concat: &InputTensor, c: &InputTensor) -> Result<(Gates, Vec<Expr>)> {
        let units = c.dims()[1];
        let pos = b.position_in(c.shape().clone())?;
        let (row, col) = (&pos[0], &pos[1]);
        let gate = |k: usize| concat.at([row.clone(), col + (k * units) as i64]);

        let i = sigmoid(&gate(0));
        let j = gate(1).tanh();
        let f = sigmoid(&(gate(2) + self.forget_bias));
        let o = sigmoid(&gate(3));
        let c = c.at(&pos);
        let new_c = &c * &f + &i * &j;
        Ok((
            Gates {
                i,
                j,
                f,
                o,
                c,
                new_c,
            },
            pos.indices().to_vec(),
        ))
    }
}

impl Operator for LstmCell {
    fn op(&self, b: &OpBuilder, inputs: &[InputTensor]) -> Result<Vec<OutputTensor>> {
        let (concat, c) = (&inputs[0], &inputs[1]);
        b.ensure(
            concat.dims()[0] == c.dims()[0] && concat.dims()[1] == 4 * c.dims()[1],
            "concat must be [batch, 4 * units]",
        )?;
        let new_c = b.output_like(c);
        let new_h = b.output_like(c);
        let (g, pos) = self.gates(b, concat, c)?;
        new_c.set(pos.clone(), &g.new_c);
        new_h.set(pos, g.new_c.tanh() * &g.o);
        Ok(vec![new_c, new_h])
    }

    fn grad(
        &self,
        b: &OpBuilder,
        inputs: &[InputTensor],
        output_grads: &[InputTensor],
    ) -> Result<Vec<OutputTensor>> {
        let (concat, c) = (&inputs[0], &inputs[1]);
        let units = c.dims()[1];
        let d_concat = b.output_like(concat);
        let d_c = b.output_like(c);
        let (g, pos) = self.gates(b, concat, c)?;
        let d_new_c = output_grads[0].at(pos.clone());
        let d_new_h = output_grads[1].at(pos.clone());

        let tanh_c = g.new_c.tanh();
        let d_total = &d_new_c + &d_new_h * &g.o * (1.0 - &tanh_c * &tanh_c);
        d_c.set(pos.clone(), &d_total * &g.f);

        let d_i = &d_total * &g.j * &g.i * (1.0 - &g.i);
        let d_j = &d_total * &g.i * (1.0 - &g.j * &g.j);
        let d_f = &d_total * &g.c * &g.f * (1.0 - &g.f);
        let d_o = &d_new_h * &tanh_c * &g.o * (1.0 - &g.o);
        for (k, d) in [d_i, d_j, d_f, d_o].into_iter().enumerate() {
            d_concat.set([pos[0].clone(), &pos[1] + (k * units) as i64], d);
        }
        Ok(vec![d_concat, d_c])
    }
}

/// Forward-mode derivative of [`LstmCell`]. Inputs: the cell's two inputs followed by a
/// tangent for each. Outputs: the tangents of the new cell state and new hidden state.
struct LstmJacobian {
    forget_bias: f64,
}

impl Operator for LstmJacobian {
    fn op(&self, b: &OpBuilder, inputs: &[InputTensor]) -> Result<Vec<OutputTensor>> {
        let (concat, c) = (&inputs[0], &inputs[1]);
        let (d_concat, d_c) = (&inputs[2], &inputs[3]);
        b.ensure(
            d_concat.shape() == concat.shape() && d_c.shape() == c.shape(),
            "tangents must match their inputs",
        )?;
        let units = c.dims()[1];
        let cell = LstmCell {
            forget_bias: self.forget_bias,
        };
        let (g, pos) = cell.gates(b, concat, c)?;
        let d_gate = |k: usize| d_concat.at([pos[0].clone(), &pos[1] + (k * units) as i64]);

        let d_i = d_gate(0) * &g.i * (1.0 - &g.i);
        let d_j = d_gate(1) * (1.0 - &g.j * &g.j);
        let d_f = d_gate(2) * &g.f * (1.0 - &g.f);
        let d_o = d_gate(3) * &g.o * (1.0 - &g.o);
        let d_new_c = d_c.at(pos.clone()) * &g.f + &g.c * &d_f + &d_i * &g.j + &g.i * &d_j;
        let tanh_c = g.new_c.tanh();
        let d_new_h = &d_new_c * &g.o * (1.0 - &tanh_c * &tanh_c) + &tanh_c * &d_o;

        let out_c = b.output_like(c);
        let out_h = b.output_like(c);
        out_c.set(pos.clone(), &d_new_c);
        out_h.set(pos, d_new_h);
        Ok(vec![out_c, out_h])
    }
}

fn random(shape: [usize; 2], rng: &mut StdRng) -> Vec<f64> {
    let normal = Normal::new(0.0, 1.0).unwrap();
    (0..shape[0] * shape[1]).map(|_| normal.sample(rng)).collect()
}

fn tensors(concat: &[f64], c: &[f64]) -> Vec<Tensor> {
    vec![
        Tensor::new([BATCH, 4 * UNITS], concat.to_vec()).unwrap(),
        Tensor::new([BATCH, UNITS], c.to_vec()).unwrap(),
    ]
}

fn forward(instance: &OpInstance, backend: Backend, concat: &[f64], c: &[f64]) -> Vec<f64> {
    let inputs = tensors(concat, c);
    let outputs = match backend {
        Backend::Cpu => instance.evaluate_c_with(&inputs),
        Backend::Cuda => instance.evaluate_cuda_with(&inputs),
    }
    .unwrap();
    outputs.iter().flat_map(|t| t.to_f64_vec()).collect()
}

/// `J^T y` through the gradient kernel, flattened as (concat, c).
fn vjp(instance: &OpInstance, backend: Backend, y: &[f64]) -> Vec<f64> {
    let (y_c, y_h) = y.split_at(BATCH * UNITS);
    let grads = [
        Tensor::new([BATCH, UNITS], y_c.to_vec()).unwrap(),
        Tensor::new([BATCH, UNITS], y_h.to_vec()).unwrap(),
    ];
    let out = evaluate_grad(instance, backend, &grads).unwrap();
    out.iter().flat_map(|t| t.to_f64_vec()).collect()
}

/// `J dx` through the forward-mode kernel, flattened as (new_c, new_h).
fn jvp_compiled(
    jacobian: &OpInstance,
    backend: Backend,
    concat: &[f64],
    c: &[f64],
    dx: &[f64],
) -> Vec<f64> {
    let (d_concat, d_c) = dx.split_at(concat.len());
    let inputs = [tensors(concat, c), tensors(d_concat, d_c)].concat();
    let outputs = match backend {
        Backend::Cpu => jacobian.evaluate_c_with(&inputs),
        Backend::Cuda => jacobian.evaluate_cuda_with(&inputs),
    }
    .unwrap();
    outputs.iter().flat_map(|t| t.to_f64_vec()).collect()
}

/// `J dx` by central differences.
fn jvp(
    instance: &OpInstance,
    backend: Backend,
    concat: &[f64],
    c: &[f64],
    dx: &[f64],
    eps: f64,
) -> Vec<f64> {
    let shifted = |sign: f64| {
        let moved: Vec<f64> = concat
            .iter()
            .chain(c)
            .zip(dx)
            .map(|(x, d)| x + sign * eps * d)
            .collect();
        let (a, b) = moved.split_at(concat.len());
        forward(instance, backend, a, b)
    };
    let plus = shifted(1.0);
    let minus = shifted(-1.0);
    plus.iter()
        .zip(minus)
        .map(|(p, m)| (p - m) / (2.0 * eps))
        .collect()
}

type Fixture = (tempfile::TempDir, Session, OpInstance, Vec<f64>, Vec<f64>);

fn setup(backend: Backend) -> Option<Fixture> {
    let (dir, session) = session();
    if !available(&session, backend) {
        return None;
    }
    let mut rng = StdRng::seed_from_u64(2024);
    let concat = random([BATCH, 4 * UNITS], &mut rng);
    let c = random([BATCH, UNITS], &mut rng);
    let instance = session
        .instantiate(LstmCell { forget_bias: 1.0 }, &tensors(&concat, &c))
        .unwrap();
    Some((dir, session, instance, concat, c))
}

fn check_forward(backend: Backend) {
    let Some((_dir, _session, instance, concat, c)) = setup(backend) else {
        return;
    };
    let out = evaluate(&instance, backend).unwrap();
    let sig = |x: f64| 1.0 / (1.0 + (-x).exp());
    for b in 0..BATCH {
        for u in 0..UNITS {
            let gate = |k: usize| concat[b * 4 * UNITS + k * UNITS + u];
            let new_c = c[b * UNITS + u] * sig(gate(2) + 1.0) + sig(gate(0)) * gate(1).tanh();
            let new_h = new_c.tanh() * sig(gate(3));
            let got_c = out[0].to_vec::<f64>().unwrap()[b * UNITS + u];
            let got_h = out[1].to_vec::<f64>().unwrap()[b * UNITS + u];
            assert!((got_c - new_c).abs() < 1e-12, "{got_c} vs {new_c}");
            assert!((got_h - new_h).abs() < 1e-12, "{got_h} vs {new_h}");
        }
    }
}

fn check_jacobian(backend: Backend) {
    let Some((_dir, _session, instance, concat, c)) = setup(backend) else {
        return;
    };
    let n_in = concat.len() + c.len();
    let n_out = 2 * BATCH * UNITS;

    // Column k of the numerical Jacobian and row m of the declared one.
    let mut numerical = vec![0.0; n_in * n_out];
    for k in 0..n_in {
        let mut dx = vec![0.0; n_in];
        dx[k] = 1.0;
        for (m, v) in jvp(&instance, backend, &concat, &c, &dx, 1e-6).into_iter().enumerate() {
            numerical[m * n_in + k] = v;
        }
    }
    let mut declared = vec![0.0; n_in * n_out];
    for m in 0..n_out {
        let mut y = vec![0.0; n_out];
        y[m] = 1.0;
        for (k, v) in vjp(&instance, backend, &y).into_iter().enumerate() {
            declared[m * n_in + k] = v;
        }
    }

    let agree = numerical
        .iter()
        .zip(&declared)
        .filter(|(n, d)| (*n - *d).abs() <= 1e-6 + 1e-2 * d.abs())
        .count();
    let fraction = agree as f64 / numerical.len() as f64;
    assert!(fraction >= 0.999, "only {fraction} of the Jacobian agrees");
}

fn check_adjoint(backend: Backend) {
    let Some((_dir, session, instance, concat, c)) = setup(backend) else {
        return;
    };
    let at_point = [tensors(&concat, &c), tensors(&concat, &c)].concat();
    let jacobian = session
        .instantiate(LstmJacobian { forget_bias: 1.0 }, &at_point)
        .unwrap();
    let mut rng = StdRng::seed_from_u64(99);
    for trial in 0..10 {
        let dx = random([1, concat.len() + c.len()], &mut rng);
        let y = random([1, 2 * BATCH * UNITS], &mut rng);
        let jdx = jvp_compiled(&jacobian, backend, &concat, &c, &dx);
        let jty = vjp(&instance, backend, &y);
        let lhs: f64 = jdx.iter().zip(&y).map(|(a, b)| a * b).sum();
        let rhs: f64 = dx.iter().zip(&jty).map(|(a, b)| a * b).sum();
        assert!(
            (lhs - rhs).abs() <= 1e-10 * (1.0 + rhs.abs()),
            "trial {trial}: <J dx, y> = {lhs}, <dx, J^T y> = {rhs}"
        );
    }
}

fn check_forward_mode(backend: Backend) {
    let Some((_dir, session, instance, concat, c)) = setup(backend) else {
        return;
    };
    let at_point = [tensors(&concat, &c), tensors(&concat, &c)].concat();
    let jacobian = session
        .instantiate(LstmJacobian { forget_bias: 1.0 }, &at_point)
        .unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let dx = random([1, concat.len() + c.len()], &mut rng);
    let compiled = jvp_compiled(&jacobian, backend, &concat, &c, &dx);
    let numerical = jvp(&instance, backend, &concat, &c, &dx, 1e-5);
    assert_close(&compiled, &numerical, 1e-4, 1e-6);
}

macro_rules! test_for_device {
    ($backend:expr, $name:ident) => {
        mod $name {
            use super::*;

            #[test]
            fn forward_matches_reference() {
                check_forward($backend);
            }

            #[test]
            fn jacobian_matches_finite_differences() {
                check_jacobian($backend);
            }

            #[test]
            fn gradient_is_the_adjoint() {
                check_adjoint($backend);
            }

            #[test]
            fn forward_mode_matches_finite_differences() {
                check_forward_mode($backend);
            }
        }
    };
}

test_for_device!(Backend::Cpu, cpu_tests);
#[cfg(feature = "cuda")]
test_for_device!(Backend::Cuda, cuda_tests);
