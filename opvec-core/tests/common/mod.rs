#![allow(dead_code)]

use opvec_core::{Backend, Config, OpInstance, Result, Session, Tensor};
use tempfile::TempDir;

/// A session whose cache lives in a fresh temporary directory.
pub fn session() -> (TempDir, Session) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let dir = tempfile::tempdir().unwrap();
    let config = Config::from_env().unwrap().with_cache_base(dir.path());
    let session = Session::new(config).unwrap();
    (dir, session)
}

/// CUDA tests are skipped on machines without a GPU toolchain.
pub fn available(session: &Session, backend: Backend) -> bool {
    match backend {
        Backend::Cpu => true,
        Backend::Cuda => {
            if !session.cuda_enabled() {
                eprintln!("CUDA unavailable, skipping");
            }
            session.cuda_enabled()
        }
    }
}

pub fn evaluate(instance: &OpInstance, backend: Backend) -> Result<Vec<Tensor>> {
    match backend {
        Backend::Cpu => instance.evaluate_c(),
        Backend::Cuda => instance.evaluate_cuda(),
    }
}

pub fn evaluate_grad(
    instance: &OpInstance,
    backend: Backend,
    output_grads: &[Tensor],
) -> Result<Vec<Tensor>> {
    match backend {
        Backend::Cpu => instance.evaluate_grad_c(output_grads),
        Backend::Cuda => instance.evaluate_grad_cuda(output_grads),
    }
}

pub fn assert_close(actual: &[f64], expected: &[f64], rtol: f64, atol: f64) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= atol + rtol * e.abs(),
            "element {i}: got {a}, expected {e}"
        );
    }
}
