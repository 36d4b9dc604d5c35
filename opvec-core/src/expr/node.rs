use crate::{dtype::Scalar, ScalarType};

/// Index of a node in a graph's node arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn get(&self) -> usize {
        self.0
    }
}

/// Index of a local mutable variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VarId(pub(crate) usize);

impl VarId {
    pub fn get(&self) -> usize {
        self.0
    }
}

/// A block of statements: the operator body or one branch of a conditional chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeId(pub(crate) usize);

impl ScopeId {
    pub(crate) const ROOT: ScopeId = ScopeId(0);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOpType {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Min,
    Max,
    Pow,
    Atan2,
}

impl BinaryOpType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Mod => "mod",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::And => "logical_and",
            Self::Or => "logical_or",
            Self::Min => "minimum",
            Self::Max => "maximum",
            Self::Pow => "power",
            Self::Atan2 => "arctan2",
        }
    }

    /// Infix spelling, for the operators C++ has one for.
    pub fn as_c_op(&self) -> Option<&'static str> {
        match self {
            Self::Add => Some("+"),
            Self::Sub => Some("-"),
            Self::Mul => Some("*"),
            Self::Div => Some("/"),
            Self::Mod => Some("%"),
            Self::Eq => Some("=="),
            Self::Ne => Some("!="),
            Self::Lt => Some("<"),
            Self::Le => Some("<="),
            Self::Gt => Some(">"),
            Self::Ge => Some(">="),
            Self::And => Some("&&"),
            Self::Or => Some("||"),
            Self::Min | Self::Max | Self::Pow | Self::Atan2 => None,
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, Self::And | Self::Or)
    }

    /// Type both operands are converted to before the operation is applied.
    pub fn operand_type(&self, lhs: ScalarType, rhs: ScalarType) -> ScalarType {
        let promoted = lhs.promote(rhs);
        match self {
            Self::And | Self::Or => ScalarType::Bool,
            Self::Pow | Self::Atan2 => promoted.float_of(),
            _ => promoted,
        }
    }

    pub fn result_type(&self, lhs: ScalarType, rhs: ScalarType) -> Result<ScalarType, String> {
        if self.is_comparison() || self.is_logical() {
            return Ok(ScalarType::Bool);
        }
        let operand = self.operand_type(lhs, rhs);
        if operand.is_bool() {
            return Err(format!("`{}` is not defined for bool operands", self.name()));
        }
        Ok(operand)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOpType {
    Neg,
    Not,
    Abs,
    Exp,
    Log,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Floor,
    Ceil,
    IsInf,
    IsNan,
    IsFinite,
}

impl UnaryOpType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Not => "logical_not",
            Self::Abs => "abs",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sqrt => "sqrt",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tan => "tan",
            Self::Asin => "asin",
            Self::Acos => "acos",
            Self::Atan => "atan",
            Self::Sinh => "sinh",
            Self::Cosh => "cosh",
            Self::Tanh => "tanh",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
            Self::IsInf => "isinf",
            Self::IsNan => "isnan",
            Self::IsFinite => "isfinite",
        }
    }

    /// Functions only defined on floats. Integer arguments are evaluated in `f64`.
    pub fn is_transcendental(&self) -> bool {
        matches!(
            self,
            Self::Exp
                | Self::Log
                | Self::Sqrt
                | Self::Sin
                | Self::Cos
                | Self::Tan
                | Self::Asin
                | Self::Acos
                | Self::Atan
                | Self::Sinh
                | Self::Cosh
                | Self::Tanh
        )
    }

    pub fn result_type(&self, arg: ScalarType) -> Result<ScalarType, String> {
        match self {
            Self::Not | Self::IsInf | Self::IsNan | Self::IsFinite => Ok(ScalarType::Bool),
            op if op.is_transcendental() => Ok(arg.float_of()),
            _ if arg.is_bool() => Err(format!("`{}` is not defined for bool", self.name())),
            _ => Ok(arg),
        }
    }
}

/// Expression node kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Read one element of an input tensor.
    Input { input: usize, indices: Vec<NodeId> },
    Constant { value: Scalar },
    /// One coordinate of the current position.
    Position { axis: usize },
    UnaryOp { arg: NodeId, operator: UnaryOpType },
    BinaryOp {
        lhs: NodeId,
        rhs: NodeId,
        operator: BinaryOpType,
    },
    Cast { arg: NodeId },
    /// Snapshot of a local variable at the point of the read.
    Variable { var: VarId },
}

impl Op {
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            Self::Input { indices, .. } => indices.clone(),
            Self::Constant { .. } | Self::Position { .. } | Self::Variable { .. } => vec![],
            Self::UnaryOp { arg, .. } | Self::Cast { arg } => vec![*arg],
            Self::BinaryOp { lhs, rhs, .. } => vec![*lhs, *rhs],
        }
    }

    /// Inlined at every use instead of being bound to a name.
    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Constant { .. } | Self::Position { .. })
    }

    pub fn label(&self) -> String {
        match self {
            Self::Input { input, .. } => format!("in{input}[..]"),
            Self::Constant { value } => format!("{value:?}"),
            Self::Position { axis } => format!("p{axis}"),
            Self::UnaryOp { operator, .. } => operator.name().to_string(),
            Self::BinaryOp { operator, .. } => operator.name().to_string(),
            Self::Cast { .. } => "cast".to_string(),
            Self::Variable { var } => format!("v{}", var.0),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub op: Op,
    pub dtype: ScalarType,
    pub(crate) scope: ScopeId,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    /// Bind a node's value at this point of the block.
    Let(NodeId),
    Declare { var: VarId, init: NodeId },
    Assign { var: VarId, value: NodeId },
    Store {
        output: usize,
        indices: Vec<NodeId>,
        value: NodeId,
    },
    /// `if / else if / else`: the first branch whose guard holds runs.
    Cond(Vec<Branch>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Branch {
    /// `None` for a trailing `else`.
    pub guard: Option<NodeId>,
    pub body: Vec<Stmt>,
}

impl Stmt {
    /// Nodes whose values this statement consumes directly.
    pub fn uses(&self) -> Vec<NodeId> {
        match self {
            Self::Let(_) => vec![],
            Self::Declare { init, .. } => vec![*init],
            Self::Assign { value, .. } => vec![*value],
            Self::Store { indices, value, .. } => {
                let mut uses = indices.clone();
                uses.push(*value);
                uses
            }
            Self::Cond(branches) => branches.iter().filter_map(|b| b.guard).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScalarType::*;

    #[test]
    fn binary_result_types() {
        assert_eq!(BinaryOpType::Add.result_type(I8, U8), Ok(U8));
        assert_eq!(BinaryOpType::Lt.result_type(F32, I64), Ok(Bool));
        assert_eq!(BinaryOpType::Pow.result_type(I32, I32), Ok(F64));
        assert_eq!(BinaryOpType::Atan2.result_type(F32, F32), Ok(F32));
        assert!(BinaryOpType::Add.result_type(Bool, Bool).is_err());
        assert_eq!(BinaryOpType::And.operand_type(F32, I8), Bool);
    }

    #[test]
    fn unary_result_types() {
        assert_eq!(UnaryOpType::Exp.result_type(U16), Ok(F64));
        assert_eq!(UnaryOpType::Abs.result_type(I8), Ok(I8));
        assert_eq!(UnaryOpType::IsNan.result_type(F32), Ok(Bool));
        assert!(UnaryOpType::Neg.result_type(Bool).is_err());
    }
}
