use std::{cell::RefCell, collections::HashSet, fmt, ops::Index, rc::Rc};

use super::{
    graph::Graph,
    node::{Branch, Node, NodeId, Op, ScopeId, Stmt, VarId},
    BinaryOpType, Expr, Operand,
};
use crate::{dtype::Scalar, Error, Result, ScalarType, Shape, TensorType};

struct Var {
    dtype: ScalarType,
    scope: ScopeId,
}

struct BuilderState {
    nodes: Vec<Node>,
    scope_parents: Vec<Option<ScopeId>>,
    /// Open statement lists, innermost last. The first one is the operator body.
    blocks: Vec<(ScopeId, Vec<Stmt>)>,
    inputs: Vec<TensorType>,
    outputs: Vec<TensorType>,
    variables: Vec<Var>,
    domain: Option<Shape>,
    error: Option<Error>,
}

impl BuilderState {
    fn current_scope(&self) -> ScopeId {
        self.blocks
            .last()
            .map(|(scope, _)| *scope)
            .unwrap_or(ScopeId::ROOT)
    }

    fn is_visible(&self, scope: ScopeId) -> bool {
        let mut current = Some(self.current_scope());
        while let Some(s) = current {
            if s == scope {
                return true;
            }
            current = self.scope_parents[s.0];
        }
        false
    }

    /// Keep the first error; later ones are usually consequences of it.
    fn record(&mut self, msg: String) {
        if self.error.is_none() {
            self.error = Some(Error::Capture(msg));
        }
    }

    fn push_stmt(&mut self, stmt: Stmt) {
        if let Some((_, block)) = self.blocks.last_mut() {
            block.push(stmt);
        }
    }
}

/// Records the expression graph of one symbolic run of an operator.
///
/// Every [`Expr`], tensor handle and [`Variable`] keeps a handle to the builder that created
/// it. Operator overloads cannot fail, so misuse inside them is recorded on the builder and
/// reported when capture finishes.
#[derive(Clone)]
pub struct OpBuilder {
    state: Rc<RefCell<BuilderState>>,
}

impl fmt::Debug for OpBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("OpBuilder")
            .field("nodes", &state.nodes.len())
            .field("inputs", &state.inputs)
            .field("outputs", &state.outputs)
            .finish()
    }
}

impl OpBuilder {
    pub(crate) fn new(inputs: &[TensorType]) -> (Self, Vec<InputTensor>) {
        let builder = Self {
            state: Rc::new(RefCell::new(BuilderState {
                nodes: Vec::new(),
                scope_parents: vec![None],
                blocks: vec![(ScopeId::ROOT, Vec::new())],
                inputs: inputs.to_vec(),
                outputs: Vec::new(),
                variables: Vec::new(),
                domain: None,
                error: None,
            })),
        };
        let handles = inputs
            .iter()
            .enumerate()
            .map(|(index, ty)| InputTensor {
                index,
                ty: ty.clone(),
                builder: builder.clone(),
            })
            .collect();
        (builder, handles)
    }

    fn same(&self, other: &OpBuilder) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    pub(crate) fn record(&self, msg: impl Into<String>) {
        self.state.borrow_mut().record(msg.into());
    }

    /// Record an error if `expr` cannot be used at the current point of the graph.
    fn check_operand(&self, expr: &Expr) -> bool {
        if !self.same(&expr.builder) {
            self.record("expression belongs to a different operator builder");
            return false;
        }
        let mut state = self.state.borrow_mut();
        let scope = state.nodes[expr.id.0].scope;
        if !state.is_visible(scope) {
            state.record(format!(
                "e{} is used outside of the block it was defined in",
                expr.id.0
            ));
            return false;
        }
        true
    }

    pub(crate) fn push_node(&self, op: Op, dtype: ScalarType, operands: &[&Expr]) -> Expr {
        for operand in operands {
            self.check_operand(operand);
        }
        let mut state = self.state.borrow_mut();
        let inline = op.is_inline();
        let scope = if inline {
            ScopeId::ROOT
        } else {
            state.current_scope()
        };
        let id = NodeId(state.nodes.len());
        state.nodes.push(Node { op, dtype, scope });
        if !inline {
            state.push_stmt(Stmt::Let(id));
        }
        drop(state);
        Expr {
            id,
            dtype,
            builder: self.clone(),
        }
    }

    pub(crate) fn binary(&self, operator: BinaryOpType, lhs: &Expr, rhs: &Expr) -> Expr {
        let dtype = match operator.result_type(lhs.dtype(), rhs.dtype()) {
            Ok(dtype) => dtype,
            Err(msg) => {
                self.record(msg);
                lhs.dtype()
            }
        };
        self.push_node(
            Op::BinaryOp {
                lhs: lhs.id,
                rhs: rhs.id,
                operator,
            },
            dtype,
            &[lhs, rhs],
        )
    }

    /// Turn an operand into an expression, giving literals the type they take next to `like`.
    pub(crate) fn operand(&self, operand: Operand, like: ScalarType) -> Expr {
        match operand {
            Operand::Expr(expr) => expr,
            Operand::Scalar(value) => self.constant(value, value.weak_type(like)),
        }
    }

    fn indices(&self, indices: impl IntoIndices, tensor: &str, rank: usize) -> Vec<Expr> {
        let indices: Vec<Expr> = indices
            .into_indices()
            .into_iter()
            .map(|i| self.operand(i, ScalarType::I64))
            .collect();
        if indices.len() != rank {
            self.record(format!(
                "{tensor} has rank {rank} but was indexed with {} indices",
                indices.len()
            ));
        }
        for index in &indices {
            if !index.dtype().is_integral() {
                self.record(format!(
                    "{tensor} was indexed with a {} expression",
                    index.dtype()
                ));
            }
        }
        indices
    }

    /// A literal of the given type.
    pub fn constant(&self, value: impl Into<Scalar>, dtype: ScalarType) -> Expr {
        let value = value.into().cast(dtype);
        self.push_node(Op::Constant { value }, dtype, &[])
    }

    /// Declare a new output.
    pub fn output(&self, shape: impl Into<Shape>, dtype: ScalarType) -> Result<OutputTensor> {
        if dtype.is_bool() {
            return Err(Error::capture("outputs cannot have bool elements"));
        }
        let ty = TensorType::new(shape, dtype);
        let mut state = self.state.borrow_mut();
        let index = state.outputs.len();
        state.outputs.push(ty.clone());
        Ok(OutputTensor {
            index,
            ty,
            builder: self.clone(),
        })
    }

    /// Declare an output with the shape and element type of `like`: an input, another output
    /// or a [`TensorType`].
    pub fn output_like(&self, like: impl Into<TensorType>) -> OutputTensor {
        let ty = like.into();
        let mut state = self.state.borrow_mut();
        let index = state.outputs.len();
        state.outputs.push(ty.clone());
        OutputTensor {
            index,
            ty,
            builder: self.clone(),
        }
    }

    /// Declare the iteration space. The body of the operator runs once per position.
    ///
    /// Can only be called once, outside of any conditional block.
    pub fn position_in(&self, shape: impl Into<Shape>) -> Result<Position> {
        let shape = shape.into();
        {
            let mut state = self.state.borrow_mut();
            if state.domain.is_some() {
                return Err(Error::capture("position_in can only be called once"));
            }
            if state.blocks.len() != 1 {
                return Err(Error::capture(
                    "position_in must be called outside of conditional blocks",
                ));
            }
            state.domain = Some(shape.clone());
        }
        let indices = (0..shape.rank())
            .map(|axis| self.push_node(Op::Position { axis }, ScalarType::I64, &[]))
            .collect();
        Ok(Position { indices, shape })
    }

    /// Declare a local mutable variable, private to the evaluation of one position.
    pub fn variable(&self, initial: impl Into<Operand>, dtype: ScalarType) -> Variable {
        let init = self.operand(initial.into(), dtype);
        self.check_operand(&init);
        let mut state = self.state.borrow_mut();
        let id = VarId(state.variables.len());
        let scope = state.current_scope();
        state.variables.push(Var { dtype, scope });
        state.push_stmt(Stmt::Declare {
            var: id,
            init: init.id,
        });
        drop(state);
        Variable {
            id,
            dtype,
            builder: self.clone(),
        }
    }

    /// Start a conditional chain. `body` runs when `cond` is nonzero.
    pub fn if_<F>(&self, cond: &Expr, body: F) -> Result<IfChain>
    where
        F: FnOnce(&OpBuilder) -> Result<()>,
    {
        self.check_operand(cond);
        let body = self.block(body)?;
        let mut state = self.state.borrow_mut();
        let depth = state.blocks.len() - 1;
        let block = &mut state.blocks[depth].1;
        block.push(Stmt::Cond(vec![Branch {
            guard: Some(cond.id),
            body,
        }]));
        let index = block.len() - 1;
        Ok(IfChain {
            builder: self.clone(),
            depth,
            index,
            closed: false,
        })
    }

    /// Abort capture with `msg` unless `cond` holds.
    pub fn ensure(&self, cond: bool, msg: impl fmt::Display) -> Result<()> {
        if cond {
            Ok(())
        } else {
            Err(Error::capture(format!("assertion failed: {msg}")))
        }
    }

    fn block<F>(&self, body: F) -> Result<Vec<Stmt>>
    where
        F: FnOnce(&OpBuilder) -> Result<()>,
    {
        {
            let mut state = self.state.borrow_mut();
            let parent = state.current_scope();
            let scope = ScopeId(state.scope_parents.len());
            state.scope_parents.push(Some(parent));
            state.blocks.push((scope, Vec::new()));
        }
        let result = body(self);
        let stmts = self
            .state
            .borrow_mut()
            .blocks
            .pop()
            .map(|(_, stmts)| stmts)
            .unwrap_or_default();
        result.map(|()| stmts)
    }

    /// Make the chain at `index` the last statement of its block again.
    ///
    /// Values built between two branches move in front of the whole chain. That is only
    /// sound for values that do not read a variable, since a branch may have assigned it.
    /// Variable reads are accepted when `guard` needs them: a guard is evaluated only when
    /// every earlier branch was skipped, so the variables still hold their values from
    /// before the chain. Such reads are sealed into a scope of their own so only the guard
    /// can use them.
    fn reopen(&self, depth: usize, index: usize, guard: Option<NodeId>) -> Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.blocks.len() != depth + 1 {
            return Err(Error::capture(
                "elif_/else_ must be called in the block of their if_",
            ));
        }
        let trailing = state.blocks[depth].1.split_off(index + 1);
        let lets: Vec<NodeId> = trailing
            .iter()
            .filter_map(|stmt| match stmt {
                Stmt::Let(id) => Some(*id),
                _ => None,
            })
            .collect();
        if lets.len() != trailing.len() {
            state.blocks[depth].1.extend(trailing);
            return Err(Error::capture(
                "elif_/else_ must directly follow the previous branch of their chain",
            ));
        }

        let mut stateful = HashSet::new();
        for id in &lets {
            let op = &state.nodes[id.0].op;
            if matches!(op, Op::Variable { .. })
                || op.operands().iter().any(|o| stateful.contains(o))
            {
                stateful.insert(*id);
            }
        }
        let mut needed = HashSet::new();
        let mut stack: Vec<NodeId> = guard.into_iter().collect();
        while let Some(id) = stack.pop() {
            if stateful.contains(&id) && needed.insert(id) {
                stack.extend(state.nodes[id.0].op.operands());
            }
        }
        if let Some(id) = lets
            .iter()
            .find(|id| stateful.contains(id) && !needed.contains(id))
        {
            let id = id.0;
            state.blocks[depth].1.extend(trailing);
            return Err(Error::capture(format!(
                "e{id} reads a variable between two branches of a conditional chain; \
                 read it before the if_ or inside a branch"
            )));
        }
        if !needed.is_empty() {
            let parent = state.blocks[depth].0;
            let sealed = ScopeId(state.scope_parents.len());
            state.scope_parents.push(Some(parent));
            for id in &needed {
                state.nodes[id.0].scope = sealed;
            }
        }

        let block = &mut state.blocks[depth].1;
        let Some(chain) = block.pop() else {
            return Err(Error::capture("conditional chain is missing"));
        };
        block.extend(trailing);
        block.push(chain);
        Ok(block.len() - 1)
    }

    fn add_branch(&self, depth: usize, index: usize, guard: Option<NodeId>, body: Vec<Stmt>) {
        let mut state = self.state.borrow_mut();
        if let Some(Stmt::Cond(branches)) = state.blocks[depth].1.get_mut(index) {
            branches.push(Branch { guard, body });
        }
    }

    fn read_var(&self, var: &Variable) -> Expr {
        self.check_var(var);
        self.push_node(Op::Variable { var: var.id }, var.dtype, &[])
    }

    fn assign(&self, var: &Variable, value: &Expr) {
        self.check_var(var);
        if self.check_operand(value) {
            self.state.borrow_mut().push_stmt(Stmt::Assign {
                var: var.id,
                value: value.id,
            });
        }
    }

    fn check_var(&self, var: &Variable) {
        if !self.same(&var.builder) {
            self.record("variable belongs to a different operator builder");
            return;
        }
        let mut state = self.state.borrow_mut();
        let scope = state.variables[var.id.0].scope;
        if !state.is_visible(scope) {
            state.record(format!(
                "variable v{} is used outside of the block it was declared in",
                var.id.0
            ));
        }
    }

    fn store(&self, output: &OutputTensor, indices: &[Expr], value: &Expr) {
        if !self.same(&output.builder) {
            self.record("output belongs to a different operator builder");
            return;
        }
        let mut ok = self.check_operand(value);
        for index in indices {
            ok &= self.check_operand(index);
        }
        if ok {
            self.state.borrow_mut().push_stmt(Stmt::Store {
                output: output.index,
                indices: indices.iter().map(|i| i.id).collect(),
                value: value.id,
            });
        }
    }

    /// Close the capture and produce the graph. Outputs are ordered as returned.
    pub(crate) fn finish(&self, name: &str, outputs: &[OutputTensor]) -> Result<Graph> {
        let mut state = self.state.borrow_mut();
        if let Some(err) = state.error.take() {
            return Err(err);
        }
        if state.blocks.len() != 1 {
            return Err(Error::capture("capture finished inside a conditional block"));
        }
        let Some(domain) = state.domain.clone() else {
            return Err(Error::capture("position_in was never called"));
        };
        if outputs.is_empty() {
            return Err(Error::capture("operators must return at least one output"));
        }

        // Declared output index -> returned position.
        let mut order = vec![None; state.outputs.len()];
        for (position, output) in outputs.iter().enumerate() {
            if !self.same(&output.builder) {
                return Err(Error::capture(
                    "returned output belongs to a different operator builder",
                ));
            }
            if order[output.index].replace(position).is_some() {
                return Err(Error::capture(format!(
                    "output {} was returned more than once",
                    output.index
                )));
            }
        }
        let mut map = Vec::with_capacity(order.len());
        for (index, position) in order.into_iter().enumerate() {
            match position {
                Some(position) => map.push(position),
                None => {
                    return Err(Error::capture(format!(
                        "output {index} was declared but not returned"
                    )))
                }
            }
        }

        let mut body = std::mem::take(&mut state.blocks[0].1);
        remap_outputs(&mut body, &map);
        let graph = Graph {
            name: name.to_string(),
            nodes: std::mem::take(&mut state.nodes),
            body,
            inputs: state.inputs.clone(),
            outputs: outputs.iter().map(|o| o.ty.clone()).collect(),
            variables: state.variables.iter().map(|v| v.dtype).collect(),
            domain,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }
}

fn remap_outputs(stmts: &mut [Stmt], map: &[usize]) {
    for stmt in stmts {
        match stmt {
            Stmt::Store { output, .. } => *output = map[*output],
            Stmt::Cond(branches) => {
                for branch in branches {
                    remap_outputs(&mut branch.body, map);
                }
            }
            _ => {}
        }
    }
}

/// Anything that can subscript a tensor: a [`Position`] or one index per dimension.
pub trait IntoIndices {
    fn into_indices(self) -> Vec<Operand>;
}

impl IntoIndices for &Position {
    fn into_indices(self) -> Vec<Operand> {
        self.indices.iter().cloned().map(Operand::Expr).collect()
    }
}

impl<T: Into<Operand>, const N: usize> IntoIndices for [T; N] {
    fn into_indices(self) -> Vec<Operand> {
        self.into_iter().map(Into::into).collect()
    }
}

impl<T: Into<Operand>> IntoIndices for Vec<T> {
    fn into_indices(self) -> Vec<Operand> {
        self.into_iter().map(Into::into).collect()
    }
}

impl<T: Into<Operand> + Clone> IntoIndices for &[T] {
    fn into_indices(self) -> Vec<Operand> {
        self.iter().cloned().map(Into::into).collect()
    }
}

/// The coordinates of the element being computed.
#[derive(Clone, Debug)]
pub struct Position {
    indices: Vec<Expr>,
    shape: Shape,
}

impl Position {
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.indices.len()
    }

    pub fn indices(&self) -> &[Expr] {
        &self.indices
    }

    pub fn iter(&self) -> impl Iterator<Item = &Expr> {
        self.indices.iter()
    }
}

impl Index<usize> for Position {
    type Output = Expr;

    fn index(&self, axis: usize) -> &Expr {
        &self.indices[axis]
    }
}

/// Symbolic handle to one input of the operator being captured.
#[derive(Clone)]
pub struct InputTensor {
    index: usize,
    ty: TensorType,
    builder: OpBuilder,
}

impl fmt::Debug for InputTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InputTensor({}: {})", self.index, self.ty)
    }
}

impl InputTensor {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn tensor_type(&self) -> &TensorType {
        &self.ty
    }

    pub fn shape(&self) -> &Shape {
        &self.ty.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.ty.shape.dims()
    }

    pub fn dtype(&self) -> ScalarType {
        self.ty.dtype
    }

    /// Read one element. Out of bounds indices are not checked.
    pub fn at(&self, indices: impl IntoIndices) -> Expr {
        let name = format!("input {}", self.index);
        let indices = self.builder.indices(indices, &name, self.ty.shape.rank());
        let refs: Vec<&Expr> = indices.iter().collect();
        self.builder.push_node(
            Op::Input {
                input: self.index,
                indices: indices.iter().map(|i| i.id).collect(),
            },
            self.ty.dtype,
            &refs,
        )
    }
}

impl From<&InputTensor> for TensorType {
    fn from(tensor: &InputTensor) -> Self {
        tensor.ty.clone()
    }
}

/// Symbolic handle to one declared output.
#[derive(Clone)]
pub struct OutputTensor {
    index: usize,
    ty: TensorType,
    builder: OpBuilder,
}

impl fmt::Debug for OutputTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputTensor({}: {})", self.index, self.ty)
    }
}

impl OutputTensor {
    pub fn tensor_type(&self) -> &TensorType {
        &self.ty
    }

    pub fn shape(&self) -> &Shape {
        &self.ty.shape
    }

    pub fn dtype(&self) -> ScalarType {
        self.ty.dtype
    }

    /// Write one element, converting `value` to the output's element type.
    ///
    /// Elements that are never written are zero.
    pub fn set(&self, indices: impl IntoIndices, value: impl Into<Operand>) {
        let name = format!("output {}", self.index);
        let indices = self.builder.indices(indices, &name, self.ty.shape.rank());
        let value = self.builder.operand(value.into(), self.ty.dtype);
        self.builder.store(self, &indices, &value);
    }
}

impl From<&OutputTensor> for TensorType {
    fn from(tensor: &OutputTensor) -> Self {
        tensor.ty.clone()
    }
}

/// A local mutable value, declared with [`OpBuilder::variable`].
#[derive(Clone)]
pub struct Variable {
    id: VarId,
    dtype: ScalarType,
    builder: OpBuilder,
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Variable(v{}: {})", self.id.0, self.dtype)
    }
}

impl Variable {
    pub fn dtype(&self) -> ScalarType {
        self.dtype
    }

    /// The value held at this point of the graph.
    pub fn get(&self) -> Expr {
        self.builder.read_var(self)
    }

    pub fn set(&self, value: impl Into<Operand>) {
        let value = self.builder.operand(value.into(), self.dtype);
        self.builder.assign(self, &value);
    }

    /// `v = v <operator> value`.
    pub fn update(&self, operator: BinaryOpType, value: impl Into<Operand>) {
        let current = self.get();
        let next = current.binary(operator, value);
        self.set(next);
    }
}

/// An open `if_` chain. Further branches are added with [`IfChain::elif_`] and
/// [`IfChain::else_`].
#[derive(Debug)]
pub struct IfChain {
    builder: OpBuilder,
    depth: usize,
    index: usize,
    closed: bool,
}

impl IfChain {
    pub fn elif_<F>(&mut self, cond: &Expr, body: F) -> Result<&mut Self>
    where
        F: FnOnce(&OpBuilder) -> Result<()>,
    {
        if self.closed {
            return Err(Error::capture("elif_ cannot follow else_"));
        }
        self.builder.check_operand(cond);
        self.index = self.builder.reopen(self.depth, self.index, Some(cond.id))?;
        let body = self.builder.block(body)?;
        self.builder
            .add_branch(self.depth, self.index, Some(cond.id), body);
        Ok(self)
    }

    pub fn else_<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(&OpBuilder) -> Result<()>,
    {
        if self.closed {
            return Err(Error::capture("else_ cannot follow else_"));
        }
        self.index = self.builder.reopen(self.depth, self.index, None)?;
        let body = self.builder.block(body)?;
        self.builder.add_branch(self.depth, self.index, None, body);
        self.closed = true;
        Ok(())
    }
}
