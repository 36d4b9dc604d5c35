use opvec_core::{
    Backend, HostGraph, InputTensor, OpBuilder, Operator, OutputTensor, Result, Session, Tensor,
};
use tracing_subscriber::EnvFilter;

/// `y = x * scale`, clamped to `[-limit, limit]`.
struct ScaledClip {
    scale: f64,
    limit: f64,
}

impl Operator for ScaledClip {
    fn op(&self, b: &OpBuilder, inputs: &[InputTensor]) -> Result<Vec<OutputTensor>> {
        let out = b.output_like(&inputs[0]);
        let pos = b.position_in(inputs[0].shape().clone())?;
        let y = inputs[0].at(&pos) * self.scale;
        b.if_(&y.gt(self.limit), |_| {
            out.set(&pos, self.limit);
            Ok(())
        })?
        .elif_(&y.lt(-self.limit), |_| {
            out.set(&pos, -self.limit);
            Ok(())
        })?
        .else_(|_| {
            out.set(&pos, &y);
            Ok(())
        })?;
        Ok(vec![out])
    }

    fn grad(
        &self,
        b: &OpBuilder,
        inputs: &[InputTensor],
        output_grads: &[InputTensor],
    ) -> Result<Vec<OutputTensor>> {
        let dx = b.output_like(&inputs[0]);
        let pos = b.position_in(inputs[0].shape().clone())?;
        let y = inputs[0].at(&pos) * self.scale;
        b.if_(&y.abs().le(self.limit), |_| {
            dx.set(&pos, output_grads[0].at(&pos) * self.scale);
            Ok(())
        })?;
        Ok(vec![dx])
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let session = Session::from_env()?;
    let x = Tensor::new([2, 4], vec![-3.0f32, -1.0, -0.5, 0.0, 0.25, 0.5, 1.0, 3.0])?;
    let op = session.instantiate(
        ScaledClip {
            scale: 2.0,
            limit: 1.5,
        },
        &[x.clone()],
    )?;

    println!("{}", op.source(Backend::Cpu).text);
    let y = op.evaluate_c()?;
    println!("y = {:?}", y[0].to_vec::<f32>()?);

    let mut graph = HostGraph::new(&session);
    let x = graph.variable(x);
    let y = op.as_host(&mut graph, &[x], Backend::Cpu)?[0];
    let loss = graph.square(y)?;
    let grads = graph.gradients(loss, &[x])?;
    println!("d(y^2)/dx = {:?}", grads[0].to_vec::<f32>()?);
    Ok(())
}
