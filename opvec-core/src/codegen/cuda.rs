//! CUDA back end: one thread per position, plus a host launcher with the C calling convention.

use super::{banner, buffer_params, c_identifier, GeneratedSource, Lowering};
use crate::{device::Backend, expr::Graph};

pub fn generate(graph: &Graph) -> GeneratedSource {
    let name = c_identifier(graph.name());
    let entry = format!("{name}_cuda");
    let kernel = format!("{name}_kernel");
    let params = buffer_params(graph);
    let dims = graph.domain().dims();

    let mut text = banner(graph, Backend::Cuda);
    text.push_str("#include <cuda_runtime.h>\n\n");

    let mut signature: Vec<String> = params.iter().map(|(ty, p)| format!("{ty} {p}")).collect();
    signature.push("int64_t total".to_string());
    text.push_str(&format!(
        "__global__ void {kernel}({}) {{\n",
        signature.join(", ")
    ));
    let mut body = Lowering::new(graph, 1);
    body.line("const int64_t index = static_cast<int64_t>(blockIdx.x) * blockDim.x + threadIdx.x;");
    body.line("if (index >= total) return;");
    if !dims.is_empty() {
        body.line("int64_t rem = index;");
        for (axis, dim) in dims.iter().enumerate().skip(1).rev() {
            body.line(format!("const int64_t p{axis} = rem % {dim}LL;"));
            body.line(format!("rem /= {dim}LL;"));
        }
        body.line("const int64_t p0 = rem;");
        for axis in 0..dims.len() {
            body.line(format!("(void)p{axis};"));
        }
    }
    for (_, param) in &params {
        body.line(format!("(void){param};"));
    }
    body.stmts(graph.body());
    text.push_str(&body.finish());
    text.push_str("}\n\n");

    text.push_str(&format!(
        "extern \"C\" OPVEC_EXPORT int32_t {entry}(const void* const* inputs, void* const* outputs,\n        const int64_t* shape, int32_t rank, void* stream, int32_t threads_per_block) {{\n"
    ));
    let mut launcher = Lowering::new(graph, 1);
    launcher.check_domain();
    launcher.line("if (threads_per_block <= 0) return 3;");
    launcher.line(format!("const int64_t total = {}LL;", graph.domain().elem_count()));
    launcher.line("if (total == 0) return 0;");
    launcher.line("const int64_t blocks = (total + threads_per_block - 1) / threads_per_block;");

    let n_inputs = graph.inputs().len();
    let mut args: Vec<String> = params
        .iter()
        .enumerate()
        .map(|(i, (ty, _))| {
            if i < n_inputs {
                format!("static_cast<{ty}>(inputs[{i}])")
            } else {
                format!("static_cast<{ty}>(outputs[{}])", i - n_inputs)
            }
        })
        .collect();
    args.push("total".to_string());
    if n_inputs == 0 {
        launcher.line("(void)inputs;");
    }
    launcher.line(format!(
        "{kernel}<<<static_cast<unsigned int>(blocks), static_cast<unsigned int>(threads_per_block), 0, static_cast<cudaStream_t>(stream)>>>("
    ));
    launcher.line(format!("    {});", args.join(",\n            ")));
    launcher.line("const cudaError_t err = cudaGetLastError();");
    launcher.line("return err == cudaSuccess ? 0 : 1000 + static_cast<int32_t>(err);");
    text.push_str(&launcher.finish());
    text.push_str("}\n");

    GeneratedSource {
        backend: Backend::Cuda,
        name,
        entry,
        text,
    }
}

#[cfg(test)]
mod tests {
    use crate::{expr::OpBuilder, ScalarType::F64, TensorType};

    #[test]
    fn positions_come_from_the_thread_index() {
        let (b, x) = OpBuilder::new(&[TensorType::new([4, 6], F64)]);
        let out = b.output_like(&x[0]);
        let pos = b.position_in([4, 6]).unwrap();
        out.set(&pos, x[0].at(&pos).tanh());
        let graph = b.finish("tanh_op", &[out]).unwrap();
        let src = super::generate(&graph);

        assert_eq!(src.entry, "tanh_op_cuda");
        let text = src.text;
        assert!(text.contains("__global__ void tanh_op_kernel(const double* in0, double* out0, int64_t total)"), "{text}");
        assert!(text.contains("const int64_t p1 = rem % 6LL;"), "{text}");
        assert!(text.contains("const int64_t p0 = rem;"), "{text}");
        assert!(text.contains("const int64_t total = 24LL;"), "{text}");
        assert!(text.contains("cudaGetLastError()"), "{text}");
        assert!(text.contains("tanh("), "{text}");
    }
}
