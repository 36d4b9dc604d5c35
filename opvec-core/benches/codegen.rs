use criterion::{criterion_group, criterion_main, Criterion};
use opvec_core::{
    Backend, Config, Expr, InputTensor, OpBuilder, Operator, OutputTensor, Result, ScalarType,
    Session, Tensor,
};

/// A softplus-and-clamp stack deep enough to give the emitter some work.
struct Stack {
    layers: usize,
}

impl Operator for Stack {
    fn op(&self, b: &OpBuilder, inputs: &[InputTensor]) -> Result<Vec<OutputTensor>> {
        let out = b.output_like(&inputs[0]);
        let pos = b.position_in(inputs[0].shape().clone())?;
        let mut x: Expr = inputs[0].at(&pos);
        for k in 0..self.layers {
            x = (x.exp() + 1.0).log() * (1.0 + k as f64 * 0.01);
        }
        b.if_(&x.gt(6.0), |_| {
            out.set(&pos, 6.0);
            Ok(())
        })?
        .else_(|_| {
            out.set(&pos, &x);
            Ok(())
        })?;
        Ok(vec![out])
    }
}

fn session() -> (tempfile::TempDir, Session) {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::new(Config::new(dir.path())).unwrap();
    (dir, session)
}

fn bench_capture(c: &mut Criterion) {
    let (_dir, session) = session();
    let x = Tensor::zeros([64, 64], ScalarType::F32).unwrap();
    c.bench_function("capture_stack_64", |bencher| {
        bencher.iter(|| session.instantiate(Stack { layers: 64 }, &[x.clone()]).unwrap());
    });
}

fn bench_generate(c: &mut Criterion) {
    let (_dir, session) = session();
    let x = Tensor::zeros([64, 64], ScalarType::F32).unwrap();
    let instance = session
        .instantiate(Stack { layers: 64 }, &[x])
        .unwrap();
    c.bench_function("generate_cpu_stack_64", |bencher| {
        bencher.iter(|| instance.source(Backend::Cpu));
    });
    c.bench_function("generate_cuda_stack_64", |bencher| {
        bencher.iter(|| instance.source(Backend::Cuda));
    });
}

criterion_group!(benches, bench_capture, bench_generate);
criterion_main!(benches);
