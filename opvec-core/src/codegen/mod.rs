//! Lowering of captured graphs to C++ (CPU) and CUDA source.
//!
//! Both back ends share [`Lowering`], which turns the statement tree into the body executed
//! for one position. They only differ in how positions are enumerated and how the entry
//! point receives its buffers.

pub mod cpu;
pub mod cuda;

use std::fmt::Write;

use crate::{
    device::Backend,
    expr::{BinaryOpType, Graph, Node, NodeId, Op, Stmt, UnaryOpType},
    ScalarType, TensorType,
};

pub(crate) const SUPPORT_HEADER_NAME: &str = "opvec.h";
pub(crate) const SUPPORT_HEADER: &str = include_str!("opvec.h");

/// Source text for one entry point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedSource {
    pub backend: Backend,
    /// Kernel base name, also used for the artifact file name.
    pub name: String,
    /// Exported symbol: `<name>_cpu` or `<name>_cuda`.
    pub entry: String,
    pub text: String,
}

pub fn generate(graph: &Graph, backend: Backend) -> GeneratedSource {
    match backend {
        Backend::Cpu => cpu::generate(graph),
        Backend::Cuda => cuda::generate(graph),
    }
}

/// Turn an arbitrary operator name into a C identifier.
pub(crate) fn c_identifier(name: &str) -> String {
    let mut ident: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if ident.is_empty() || ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    ident
}

fn banner(graph: &Graph, backend: Backend) -> String {
    let mut text = String::new();
    let _ = writeln!(
        text,
        "// {} ({backend}): generated by opvec {}",
        graph.name(),
        env!("CARGO_PKG_VERSION")
    );
    for (i, ty) in graph.inputs().iter().enumerate() {
        let _ = writeln!(text, "//   in{i}: {ty}");
    }
    for (i, ty) in graph.outputs().iter().enumerate() {
        let _ = writeln!(text, "//   out{i}: {ty}");
    }
    let _ = writeln!(text, "//   positions: {}", graph.domain());
    text.push_str("#include \"opvec.h\"\n");
    text
}

/// Indented statement emitter shared by both back ends.
pub(crate) struct Lowering<'a> {
    graph: &'a Graph,
    live: Vec<bool>,
    out: String,
    depth: usize,
}

impl<'a> Lowering<'a> {
    pub(crate) fn new(graph: &'a Graph, depth: usize) -> Self {
        Self {
            graph,
            live: graph.live_nodes(),
            out: String::new(),
            depth,
        }
    }

    pub(crate) fn finish(self) -> String {
        self.out
    }

    pub(crate) fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.depth {
            self.out.push_str("    ");
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    pub(crate) fn open(&mut self, text: impl AsRef<str>) {
        self.line(text);
        self.depth += 1;
    }

    pub(crate) fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.line("}");
    }

    /// Return a nonzero code when the caller's iteration space is not the captured one.
    pub(crate) fn check_domain(&mut self) {
        let dims = self.graph.domain().dims().to_vec();
        self.line(format!("if (rank != {}) return 1;", dims.len()));
        for (axis, dim) in dims.iter().enumerate() {
            self.line(format!("if (shape[{axis}] != {dim}LL) return 2;"));
        }
        if dims.is_empty() {
            self.line("(void)shape;");
        }
    }

    pub(crate) fn stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        let graph = self.graph;
        match stmt {
            Stmt::Let(id) => {
                let node = graph.node(*id);
                if self.live[id.0] && !node.op.is_inline() {
                    let expr = self.expr(node);
                    self.line(format!(
                        "const {} e{} = {expr};",
                        node.dtype.c_name(),
                        id.0
                    ));
                }
            }
            Stmt::Declare { var, init } => {
                let dtype = graph.variables()[var.0];
                let init = self.value_as(*init, dtype);
                self.line(format!("{} v{} = {init};", dtype.c_name(), var.0));
            }
            Stmt::Assign { var, value } => {
                let dtype = graph.variables()[var.0];
                let value = self.value_as(*value, dtype);
                self.line(format!("v{} = {value};", var.0));
            }
            Stmt::Store {
                output,
                indices,
                value,
            } => {
                let ty = &graph.outputs()[*output];
                let offset = self.offset(ty, indices);
                let value = self.value_as(*value, ty.dtype);
                self.line(format!("out{output}[{offset}] = {value};"));
            }
            Stmt::Cond(branches) => {
                for (i, branch) in branches.iter().enumerate() {
                    let guard = branch.guard.map(|g| self.value_as(g, ScalarType::Bool));
                    let header = match (i, guard) {
                        (0, Some(guard)) => format!("if ({guard}) {{"),
                        (0, None) => "if (true) {".to_string(),
                        (_, Some(guard)) => format!("}} else if ({guard}) {{"),
                        (_, None) => "} else {".to_string(),
                    };
                    if i > 0 {
                        self.depth -= 1;
                    }
                    self.open(header);
                    self.stmts(&branch.body);
                }
                if !branches.is_empty() {
                    self.close();
                }
            }
        }
    }

    /// How a node's value is referenced. Constants and positions are spelled inline.
    fn value(&self, id: NodeId) -> String {
        let node = self.graph.node(id);
        match &node.op {
            Op::Constant { value } => value.c_literal(node.dtype),
            Op::Position { axis } => format!("p{axis}"),
            _ => format!("e{}", id.0),
        }
    }

    fn value_as(&self, id: NodeId, dtype: ScalarType) -> String {
        let node = self.graph.node(id);
        match &node.op {
            Op::Constant { value } => value.c_literal(dtype),
            _ if node.dtype == dtype => self.value(id),
            _ => format!("static_cast<{}>({})", dtype.c_name(), self.value(id)),
        }
    }

    /// Row-major element offset with the strides of the captured shape baked in.
    fn offset(&self, ty: &TensorType, indices: &[NodeId]) -> String {
        let terms: Vec<String> = indices
            .iter()
            .zip(ty.shape.strides())
            .map(|(index, stride)| {
                let index = self.value_as(*index, ScalarType::I64);
                if stride == 1 {
                    index
                } else {
                    format!("{index} * {stride}LL")
                }
            })
            .collect();
        if terms.is_empty() {
            "0".to_string()
        } else {
            terms.join(" + ")
        }
    }

    fn expr(&self, node: &Node) -> String {
        let dtype = node.dtype;
        match &node.op {
            Op::Input { input, indices } => {
                let offset = self.offset(&self.graph.inputs()[*input], indices);
                format!("in{input}[{offset}]")
            }
            Op::Constant { value } => value.c_literal(dtype),
            Op::Position { axis } => format!("p{axis}"),
            Op::Cast { arg } => format!("static_cast<{}>({})", dtype.c_name(), self.value(*arg)),
            Op::Variable { var } => format!("v{}", var.0),
            Op::UnaryOp { arg, operator } => self.unary(*operator, *arg, dtype),
            Op::BinaryOp { lhs, rhs, operator } => self.binary(*operator, *lhs, *rhs, dtype),
        }
    }

    fn unary(&self, operator: UnaryOpType, arg: NodeId, dtype: ScalarType) -> String {
        let arg_type = self.graph.node(arg).dtype;
        let c = dtype.c_name();
        let suffix = float_suffix(dtype);
        match operator {
            UnaryOpType::Neg if dtype.is_float() => format!("-({})", self.value(arg)),
            UnaryOpType::Neg => {
                let carrier = dtype.wrapping_carrier().c_name();
                format!(
                    "static_cast<{c}>(static_cast<{carrier}>(0) - static_cast<{carrier}>({}))",
                    self.value(arg)
                )
            }
            UnaryOpType::Not => format!("!({})", self.value_as(arg, ScalarType::Bool)),
            UnaryOpType::Abs if dtype.is_float() => format!("fabs{suffix}({})", self.value(arg)),
            UnaryOpType::Abs if dtype.is_signed() => format!("opvec_abs({})", self.value(arg)),
            UnaryOpType::Floor | UnaryOpType::Ceil if dtype.is_float() => {
                format!("{}{suffix}({})", operator.name(), self.value(arg))
            }
            UnaryOpType::Abs | UnaryOpType::Floor | UnaryOpType::Ceil => self.value(arg),
            UnaryOpType::IsInf | UnaryOpType::IsNan | UnaryOpType::IsFinite => {
                if arg_type.is_float() {
                    format!("opvec_{}({})", operator.name(), self.value(arg))
                } else if operator == UnaryOpType::IsFinite {
                    "true".to_string()
                } else {
                    "false".to_string()
                }
            }
            _ => format!(
                "{}{suffix}({})",
                operator.name(),
                self.value_as(arg, dtype)
            ),
        }
    }

    fn binary(&self, operator: BinaryOpType, lhs: NodeId, rhs: NodeId, dtype: ScalarType) -> String {
        let operand = operator.operand_type(self.graph.node(lhs).dtype, self.graph.node(rhs).dtype);
        let a = self.value_as(lhs, operand);
        let b = self.value_as(rhs, operand);
        let c = dtype.c_name();
        let suffix = float_suffix(operand);
        match (operator, operator.as_c_op()) {
            // Integer add/sub/mul wrap: carry them out in an unsigned type of at least 32 bits.
            (BinaryOpType::Add | BinaryOpType::Sub | BinaryOpType::Mul, Some(sym))
                if operand.is_integral() =>
            {
                let carrier = operand.wrapping_carrier().c_name();
                format!(
                    "static_cast<{c}>(static_cast<{carrier}>({a}) {sym} static_cast<{carrier}>({b}))"
                )
            }
            (BinaryOpType::Mod, _) if operand.is_float() => format!("fmod{suffix}({a}, {b})"),
            (BinaryOpType::Div | BinaryOpType::Mod, Some(sym)) if operand.is_integral() => {
                format!("static_cast<{c}>({a} {sym} {b})")
            }
            (BinaryOpType::Min, _) => format!("opvec_min<{}>({a}, {b})", operand.c_name()),
            (BinaryOpType::Max, _) => format!("opvec_max<{}>({a}, {b})", operand.c_name()),
            (BinaryOpType::Pow, _) => format!("pow{suffix}({a}, {b})"),
            (BinaryOpType::Atan2, _) => format!("atan2{suffix}({a}, {b})"),
            (_, Some(sym)) => format!("({a} {sym} {b})"),
            (_, None) => unreachable!("every operator without an infix form is handled above"),
        }
    }
}

fn float_suffix(dtype: ScalarType) -> &'static str {
    if dtype == ScalarType::F32 {
        "f"
    } else {
        ""
    }
}

/// Input and output buffer parameters, in declaration order.
pub(crate) fn buffer_params(graph: &Graph) -> Vec<(String, String)> {
    let inputs = graph
        .inputs()
        .iter()
        .enumerate()
        .map(|(i, ty)| (format!("const {}*", ty.dtype.c_name()), format!("in{i}")));
    let outputs = graph
        .outputs()
        .iter()
        .enumerate()
        .map(|(i, ty)| (format!("{}*", ty.dtype.c_name()), format!("out{i}")));
    inputs.chain(outputs).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        expr::{InputTensor, OpBuilder},
        ScalarType::*,
    };

    fn capture<F>(inputs: &[TensorType], f: F) -> Graph
    where
        F: FnOnce(&OpBuilder, &[InputTensor]) -> Vec<crate::expr::OutputTensor>,
    {
        let (b, handles) = OpBuilder::new(inputs);
        let outputs = f(&b, &handles);
        b.finish("test_op", &outputs).unwrap()
    }

    #[test]
    fn identifiers_are_sanitized() {
        assert_eq!(c_identifier("my-op.v2"), "my_op_v2");
        assert_eq!(c_identifier("2x"), "_2x");
    }

    #[test]
    fn float_math_uses_single_precision_functions() {
        let graph = capture(&[TensorType::new([8], F32)], |b, x| {
            let out = b.output_like(&x[0]);
            let pos = b.position_in([8]).unwrap();
            let v = x[0].at(&pos);
            out.set(&pos, v.exp() + v.power(2.0) + (&v % 3.0));
            vec![out]
        });
        let src = cpu::generate(&graph).text;
        assert!(src.contains("expf("), "{src}");
        assert!(src.contains("powf("), "{src}");
        assert!(src.contains("fmodf("), "{src}");
        assert!(src.contains("2.0f"), "{src}");
    }

    #[test]
    fn integer_arithmetic_wraps_through_unsigned() {
        let graph = capture(&[TensorType::new([4], I16)], |b, x| {
            let out = b.output_like(&x[0]);
            let pos = b.position_in([4]).unwrap();
            let v = x[0].at(&pos);
            out.set(&pos, &v * &v);
            vec![out]
        });
        let src = cpu::generate(&graph).text;
        assert!(
            src.contains("static_cast<int16_t>(static_cast<uint32_t>(e"),
            "{src}"
        );
    }

    #[test]
    fn dead_nodes_are_not_emitted() {
        let graph = capture(&[TensorType::new([4], F64)], |b, x| {
            let out = b.output_like(&x[0]);
            let pos = b.position_in([4]).unwrap();
            let v = x[0].at(&pos);
            let _unused = v.sin();
            out.set(&pos, &v);
            vec![out]
        });
        let src = cpu::generate(&graph).text;
        assert!(!src.contains("sin("), "{src}");
    }

    #[test]
    fn strides_are_baked() {
        let graph = capture(&[TensorType::new([3, 5], F64)], |b, x| {
            let out = b.output_like(&x[0]);
            let pos = b.position_in([3, 5]).unwrap();
            out.set(&pos, x[0].at(&pos));
            vec![out]
        });
        let src = cpu::generate(&graph).text;
        assert!(src.contains("in0[p0 * 5LL + p1]"), "{src}");
        assert!(src.contains("if (shape[1] != 5LL) return 2;"), "{src}");
    }
}
