//! The expression language operators are written in.
//!
//! Nothing here computes anything: every operation appends a node to the [`OpBuilder`] that
//! owns its operands, and the resulting [`Graph`] is later lowered to native code.

mod builder;
mod graph;
mod node;

use std::fmt;

pub use builder::{
    IfChain, InputTensor, IntoIndices, OpBuilder, OutputTensor, Position, Variable,
};
pub use graph::Graph;
pub use node::{BinaryOpType, Branch, Node, NodeId, Op, Stmt, UnaryOpType, VarId};

use crate::{dtype::Scalar, ScalarType};

/// A typed scalar expression, evaluated once per position.
#[derive(Clone)]
pub struct Expr {
    id: NodeId,
    dtype: ScalarType,
    builder: OpBuilder,
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr(e{}: {})", self.id.0, self.dtype)
    }
}

/// Either side of a binary operation: an expression or a Rust literal.
#[derive(Clone, Debug)]
pub enum Operand {
    Expr(Expr),
    Scalar(Scalar),
}

impl From<Expr> for Operand {
    fn from(expr: Expr) -> Self {
        Operand::Expr(expr)
    }
}

impl From<&Expr> for Operand {
    fn from(expr: &Expr) -> Self {
        Operand::Expr(expr.clone())
    }
}

impl From<Scalar> for Operand {
    fn from(value: Scalar) -> Self {
        Operand::Scalar(value)
    }
}

macro_rules! operand_from_literal {
    ($($t:ty),+) => {
        $(
            impl From<$t> for Operand {
                fn from(value: $t) -> Self {
                    Operand::Scalar(value.into())
                }
            }
        )+
    };
}

operand_from_literal!(bool, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl Expr {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn dtype(&self) -> ScalarType {
        self.dtype
    }

    pub(crate) fn binary(&self, operator: BinaryOpType, rhs: impl Into<Operand>) -> Expr {
        let rhs = self.builder.operand(rhs.into(), self.dtype);
        self.builder.binary(operator, self, &rhs)
    }

    fn binary_rev(lhs: Scalar, operator: BinaryOpType, rhs: &Expr) -> Expr {
        let lhs = rhs.builder.operand(Operand::Scalar(lhs), rhs.dtype);
        rhs.builder.binary(operator, &lhs, rhs)
    }

    fn unary(&self, operator: UnaryOpType) -> Expr {
        let dtype = match operator.result_type(self.dtype) {
            Ok(dtype) => dtype,
            Err(msg) => {
                self.builder.record(msg);
                self.dtype
            }
        };
        self.builder.push_node(
            Op::UnaryOp {
                arg: self.id,
                operator,
            },
            dtype,
            &[self],
        )
    }

    /// Convert to `dtype` with C cast semantics (float to int truncates).
    pub fn cast(&self, dtype: ScalarType) -> Expr {
        if dtype == self.dtype {
            return self.clone();
        }
        self.builder
            .push_node(Op::Cast { arg: self.id }, dtype, &[self])
    }

    pub fn eq(&self, rhs: impl Into<Operand>) -> Expr {
        self.binary(BinaryOpType::Eq, rhs)
    }

    pub fn ne(&self, rhs: impl Into<Operand>) -> Expr {
        self.binary(BinaryOpType::Ne, rhs)
    }

    pub fn lt(&self, rhs: impl Into<Operand>) -> Expr {
        self.binary(BinaryOpType::Lt, rhs)
    }

    pub fn le(&self, rhs: impl Into<Operand>) -> Expr {
        self.binary(BinaryOpType::Le, rhs)
    }

    pub fn gt(&self, rhs: impl Into<Operand>) -> Expr {
        self.binary(BinaryOpType::Gt, rhs)
    }

    pub fn ge(&self, rhs: impl Into<Operand>) -> Expr {
        self.binary(BinaryOpType::Ge, rhs)
    }

    pub fn logical_and(&self, rhs: impl Into<Operand>) -> Expr {
        self.binary(BinaryOpType::And, rhs)
    }

    pub fn logical_or(&self, rhs: impl Into<Operand>) -> Expr {
        self.binary(BinaryOpType::Or, rhs)
    }

    pub fn logical_not(&self) -> Expr {
        self.unary(UnaryOpType::Not)
    }

    pub fn minimum(&self, rhs: impl Into<Operand>) -> Expr {
        self.binary(BinaryOpType::Min, rhs)
    }

    pub fn maximum(&self, rhs: impl Into<Operand>) -> Expr {
        self.binary(BinaryOpType::Max, rhs)
    }

    pub fn power(&self, rhs: impl Into<Operand>) -> Expr {
        self.binary(BinaryOpType::Pow, rhs)
    }

    /// Four-quadrant arctangent of `self / rhs`.
    pub fn arctan2(&self, rhs: impl Into<Operand>) -> Expr {
        self.binary(BinaryOpType::Atan2, rhs)
    }
}

macro_rules! unary_fn {
    ($($fn_name:ident => $variant:ident),+ $(,)?) => {
        impl Expr {
            $(
                pub fn $fn_name(&self) -> Expr {
                    self.unary(UnaryOpType::$variant)
                }
            )+
        }
    };
}

unary_fn!(
    abs => Abs,
    exp => Exp,
    log => Log,
    sqrt => Sqrt,
    sin => Sin,
    cos => Cos,
    tan => Tan,
    asin => Asin,
    acos => Acos,
    atan => Atan,
    sinh => Sinh,
    cosh => Cosh,
    tanh => Tanh,
    floor => Floor,
    ceil => Ceil,
    isinf => IsInf,
    isnan => IsNan,
    isfinite => IsFinite,
);

macro_rules! binary_trait {
    ($trait:ident, $fn_name:ident, $variant:ident) => {
        impl<R: Into<Operand>> std::ops::$trait<R> for Expr {
            type Output = Expr;

            fn $fn_name(self, rhs: R) -> Expr {
                self.binary(BinaryOpType::$variant, rhs)
            }
        }

        impl<R: Into<Operand>> std::ops::$trait<R> for &Expr {
            type Output = Expr;

            fn $fn_name(self, rhs: R) -> Expr {
                self.binary(BinaryOpType::$variant, rhs)
            }
        }
    };
}

binary_trait!(Add, add, Add);
binary_trait!(Sub, sub, Sub);
binary_trait!(Mul, mul, Mul);
binary_trait!(Div, div, Div);
binary_trait!(Rem, rem, Mod);

macro_rules! literal_lhs {
    ($($t:ty),+) => {
        $(
            literal_lhs!(@impl $t, Add, add, Add);
            literal_lhs!(@impl $t, Sub, sub, Sub);
            literal_lhs!(@impl $t, Mul, mul, Mul);
            literal_lhs!(@impl $t, Div, div, Div);
            literal_lhs!(@impl $t, Rem, rem, Mod);
        )+
    };
    (@impl $t:ty, $trait:ident, $fn_name:ident, $variant:ident) => {
        impl std::ops::$trait<Expr> for $t {
            type Output = Expr;

            fn $fn_name(self, rhs: Expr) -> Expr {
                Expr::binary_rev(self.into(), BinaryOpType::$variant, &rhs)
            }
        }

        impl std::ops::$trait<&Expr> for $t {
            type Output = Expr;

            fn $fn_name(self, rhs: &Expr) -> Expr {
                Expr::binary_rev(self.into(), BinaryOpType::$variant, rhs)
            }
        }
    };
}

literal_lhs!(i32, i64, u32, u64, usize, f32, f64);

impl std::ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        self.unary(UnaryOpType::Neg)
    }
}

impl std::ops::Neg for &Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        self.unary(UnaryOpType::Neg)
    }
}

impl std::ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        self.unary(UnaryOpType::Not)
    }
}

impl std::ops::Not for &Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        self.unary(UnaryOpType::Not)
    }
}

pub fn logical_and(lhs: &Expr, rhs: impl Into<Operand>) -> Expr {
    lhs.logical_and(rhs)
}

pub fn logical_or(lhs: &Expr, rhs: impl Into<Operand>) -> Expr {
    lhs.logical_or(rhs)
}

pub fn logical_not(arg: &Expr) -> Expr {
    arg.logical_not()
}

pub fn minimum(lhs: &Expr, rhs: impl Into<Operand>) -> Expr {
    lhs.minimum(rhs)
}

pub fn maximum(lhs: &Expr, rhs: impl Into<Operand>) -> Expr {
    lhs.maximum(rhs)
}

pub fn power(lhs: &Expr, rhs: impl Into<Operand>) -> Expr {
    lhs.power(rhs)
}

pub fn arctan2(lhs: &Expr, rhs: impl Into<Operand>) -> Expr {
    lhs.arctan2(rhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, ScalarType::*, TensorType};

    fn builder(inputs: &[TensorType]) -> (OpBuilder, Vec<InputTensor>) {
        OpBuilder::new(inputs)
    }

    fn capture_error(err: Error) -> String {
        match err.inner() {
            Error::Capture(msg) => msg.clone(),
            other => panic!("expected a capture error, got {other:?}"),
        }
    }

    #[test]
    fn literals_are_weak() {
        let (b, inputs) = builder(&[TensorType::new([4], U8)]);
        let pos = b.position_in([4]).unwrap();
        let x = inputs[0].at(&pos);
        assert_eq!((&x + 1).dtype(), U8);
        assert_eq!((&x * 0.5).dtype(), F64);
        assert_eq!((2i32 - &x).dtype(), U8);
        assert_eq!(x.lt(3).dtype(), Bool);
        assert_eq!(x.exp().dtype(), F64);
        assert_eq!(x.cast(F32).power(2).dtype(), F32);
    }

    #[test]
    fn capture_single_output() {
        let (b, inputs) = builder(&[TensorType::new([2, 3], F32)]);
        let out = b.output_like(&inputs[0]);
        let pos = b.position_in(inputs[0].shape().clone()).unwrap();
        out.set(&pos, inputs[0].at(&pos) * 2.0);
        let graph = b.finish("double", &[out]).unwrap();
        assert_eq!(graph.outputs(), &[TensorType::new([2, 3], F32)]);
        assert_eq!(graph.domain().dims(), &[2, 3]);
        assert!(graph.to_dot().contains("mul"));
    }

    #[test]
    fn missing_position_is_an_error() {
        let (b, inputs) = builder(&[TensorType::new([2], F32)]);
        let out = b.output_like(&inputs[0]);
        let err = b.finish("nopos", &[out]).unwrap_err();
        assert!(capture_error(err).contains("position_in"));
    }

    #[test]
    fn rank_mismatch_is_deferred() {
        let (b, inputs) = builder(&[TensorType::new([2, 2], F32)]);
        let out = b.output_like(&inputs[0]);
        let pos = b.position_in([2, 2]).unwrap();
        let v = inputs[0].at([pos[0].clone()]);
        out.set(&pos, v);
        let err = b.finish("rank", &[out]).unwrap_err();
        assert!(capture_error(err).contains("rank 2"));
    }

    #[test]
    fn block_values_do_not_escape() {
        let (b, inputs) = builder(&[TensorType::new([3], F64)]);
        let out = b.output_like(&inputs[0]);
        let pos = b.position_in([3]).unwrap();
        let x = inputs[0].at(&pos);
        let mut leaked = None;
        b.if_(&x.gt(0.0), |b| {
            leaked = Some(b.constant(1, F64) + &x);
            Ok(())
        })
        .unwrap();
        out.set(&pos, leaked.unwrap());
        let err = b.finish("leak", &[out]).unwrap_err();
        assert!(capture_error(err).contains("outside of the block"));
    }

    #[test]
    fn elif_after_else_is_rejected() {
        let (b, inputs) = builder(&[TensorType::new([3], F64)]);
        let out = b.output_like(&inputs[0]);
        let pos = b.position_in([3]).unwrap();
        let x = inputs[0].at(&pos);
        let mut chain = b
            .if_(&x.lt(0.0), |_| {
                out.set(&pos, 0.0);
                Ok(())
            })
            .unwrap();
        chain
            .else_(|_| {
                out.set(&pos, &x);
                Ok(())
            })
            .unwrap();
        let err = chain.elif_(&x.gt(1.0), |_| Ok(())).unwrap_err();
        assert!(capture_error(err).contains("else_"));
    }

    #[test]
    fn elif_guards_move_before_the_chain() {
        let (b, inputs) = builder(&[TensorType::new([3], F64)]);
        let out = b.output_like(&inputs[0]);
        let pos = b.position_in([3]).unwrap();
        let x = inputs[0].at(&pos);
        b.if_(&x.lt(0.0), |_| {
            out.set(&pos, 0.0);
            Ok(())
        })
        .unwrap()
        .elif_(&x.gt(1.0), |_| {
            out.set(&pos, 1.0);
            Ok(())
        })
        .unwrap();
        let graph = b.finish("chain", &[out]).unwrap();
        let last = graph.body().last().unwrap();
        match last {
            Stmt::Cond(branches) => assert_eq!(branches.len(), 2),
            other => panic!("expected the chain last, got {other:?}"),
        }
    }

    #[test]
    fn elif_guard_reads_variable_before_the_chain() {
        let (b, inputs) = builder(&[TensorType::new([3], F64)]);
        let out = b.output_like(&inputs[0]);
        let pos = b.position_in([3]).unwrap();
        let x = inputs[0].at(&pos);
        let v = b.variable(0.0, F64);
        b.if_(&x.gt(0.0), |_| {
            v.set(1.0);
            Ok(())
        })
        .unwrap()
        .elif_(&v.get().lt(0.5), |_| {
            v.set(-1.0);
            Ok(())
        })
        .unwrap();
        out.set(&pos, v.get());
        let graph = b.finish("guard", &[out]).unwrap();
        let body = graph.body();
        let chain = body
            .iter()
            .position(|s| matches!(s, Stmt::Cond(_)))
            .unwrap();
        let reads: Vec<usize> = body
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                matches!(s, Stmt::Let(id) if matches!(graph.nodes()[id.get()].op, Op::Variable { .. }))
            })
            .map(|(i, _)| i)
            .collect();
        // The guard's read precedes the chain, the output's read follows it.
        assert_eq!(reads.len(), 2);
        assert!(reads[0] < chain && chain < reads[1]);
    }

    #[test]
    fn output_like_accepts_outputs_and_types() {
        let (b, inputs) = builder(&[TensorType::new([2, 3], F32)]);
        let first = b.output_like(&inputs[0]);
        let second = b.output_like(&first);
        let third = b.output_like(TensorType::new([2, 3], I64));
        let pos = b.position_in([2, 3]).unwrap();
        let x = inputs[0].at(&pos);
        first.set(&pos, &x);
        second.set(&pos, &x + 1.0);
        third.set(&pos, x.cast(I64));
        let graph = b.finish("like", &[first, second, third]).unwrap();
        assert_eq!(
            graph.outputs(),
            &[
                TensorType::new([2, 3], F32),
                TensorType::new([2, 3], F32),
                TensorType::new([2, 3], I64),
            ]
        );
    }

    #[test]
    fn outputs_must_all_be_returned() {
        let (b, inputs) = builder(&[TensorType::new([3], F64)]);
        let a = b.output_like(&inputs[0]);
        let _unused = b.output([3], I32).unwrap();
        b.position_in([3]).unwrap();
        let err = b.finish("partial", &[a]).unwrap_err();
        assert!(capture_error(err).contains("not returned"));
    }

    #[test]
    fn bool_arithmetic_is_rejected() {
        let (b, inputs) = builder(&[TensorType::new([3], I32)]);
        let out = b.output_like(&inputs[0]);
        let pos = b.position_in([3]).unwrap();
        let x = inputs[0].at(&pos);
        out.set(&pos, x.gt(1) + x.lt(2));
        assert!(b.finish("boolsum", &[out]).is_err());
    }
}
