//! Sequential CPU back end: one nested loop per dimension of the iteration space, row-major.

use super::{banner, buffer_params, c_identifier, GeneratedSource, Lowering};
use crate::{device::Backend, expr::Graph};

pub fn generate(graph: &Graph) -> GeneratedSource {
    let name = c_identifier(graph.name());
    let entry = format!("{name}_cpu");

    let mut text = banner(graph, Backend::Cpu);
    text.push_str(&format!(
        "\nextern \"C\" OPVEC_EXPORT int32_t {entry}(const void* const* inputs, void* const* outputs,\n        const int64_t* shape, int32_t rank) {{\n"
    ));

    let mut body = Lowering::new(graph, 1);
    body.check_domain();
    let n_inputs = graph.inputs().len();
    for (i, (ty, param)) in buffer_params(graph).into_iter().enumerate() {
        let slot = if i < n_inputs {
            format!("inputs[{i}]")
        } else {
            format!("outputs[{}]", i - n_inputs)
        };
        body.line(format!("{ty} {param} = static_cast<{ty}>({slot});"));
        body.line(format!("(void){param};"));
    }
    if n_inputs == 0 {
        body.line("(void)inputs;");
    }

    let dims = graph.domain().dims();
    for (axis, dim) in dims.iter().enumerate() {
        body.open(format!(
            "for (int64_t p{axis} = 0; p{axis} < {dim}LL; ++p{axis}) {{"
        ));
    }
    body.stmts(graph.body());
    for _ in dims {
        body.close();
    }
    body.line("return 0;");

    text.push_str(&body.finish());
    text.push_str("}\n");

    GeneratedSource {
        backend: Backend::Cpu,
        name,
        entry,
        text,
    }
}
