use petgraph::{
    algo::toposort,
    dot::{Config as DotConfig, Dot},
    graph::{DiGraph, NodeIndex},
};

use super::node::{Node, NodeId, Stmt};
use crate::{Error, Result, ScalarType, Shape, TensorType};

/// A captured operator body: the node arena plus the statement tree that orders side effects.
#[derive(Clone, Debug)]
pub struct Graph {
    pub(crate) name: String,
    pub(crate) nodes: Vec<Node>,
    pub(crate) body: Vec<Stmt>,
    pub(crate) inputs: Vec<TensorType>,
    pub(crate) outputs: Vec<TensorType>,
    pub(crate) variables: Vec<ScalarType>,
    pub(crate) domain: Shape,
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn body(&self) -> &[Stmt] {
        &self.body
    }

    pub fn inputs(&self) -> &[TensorType] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorType] {
        &self.outputs
    }

    pub fn variables(&self) -> &[ScalarType] {
        &self.variables
    }

    /// The iteration space declared with `position_in`.
    pub fn domain(&self) -> &Shape {
        &self.domain
    }

    /// Nodes whose value reaches a statement. Operands always precede their users in the
    /// arena, so one backwards sweep is enough.
    pub fn live_nodes(&self) -> Vec<bool> {
        fn mark(stmts: &[Stmt], live: &mut [bool]) {
            for stmt in stmts {
                for id in stmt.uses() {
                    live[id.0] = true;
                }
                if let Stmt::Cond(branches) = stmt {
                    for branch in branches {
                        mark(&branch.body, live);
                    }
                }
            }
        }

        let mut live = vec![false; self.nodes.len()];
        mark(&self.body, &mut live);
        for id in (0..self.nodes.len()).rev() {
            if live[id] {
                for operand in self.nodes[id].op.operands() {
                    live[operand.0] = true;
                }
            }
        }
        live
    }

    /// Dataflow view of the graph: one vertex per node and per output, edges from operands
    /// to their users.
    pub fn to_petgraph(&self) -> DiGraph<String, ()> {
        let mut graph = DiGraph::new();
        let vertices: Vec<NodeIndex> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| graph.add_node(format!("e{i}: {} {}", node.op.label(), node.dtype)))
            .collect();
        for (i, node) in self.nodes.iter().enumerate() {
            for operand in node.op.operands() {
                graph.add_edge(vertices[operand.0], vertices[i], ());
            }
        }

        let sinks: Vec<NodeIndex> = self
            .outputs
            .iter()
            .enumerate()
            .map(|(j, ty)| graph.add_node(format!("out{j}: {ty}")))
            .collect();
        fn stores(stmts: &[Stmt], found: &mut Vec<(usize, NodeId)>) {
            for stmt in stmts {
                match stmt {
                    Stmt::Store { output, value, .. } => found.push((*output, *value)),
                    Stmt::Cond(branches) => {
                        for branch in branches {
                            stores(&branch.body, found);
                        }
                    }
                    _ => {}
                }
            }
        }
        let mut found = Vec::new();
        stores(&self.body, &mut found);
        for (output, value) in found {
            graph.add_edge(vertices[value.0], sinks[output], ());
        }
        graph
    }

    /// Graphviz rendering of [`Graph::to_petgraph`].
    pub fn to_dot(&self) -> String {
        let graph = self.to_petgraph();
        format!("{:?}", Dot::with_config(&graph, &[DotConfig::EdgeNoLabel]))
    }

    pub(crate) fn check_acyclic(&self) -> Result<()> {
        toposort(&self.to_petgraph(), None).map_err(|cycle| {
            Error::capture(format!(
                "expression graph has a cycle through vertex {}",
                cycle.node_id().index()
            ))
        })?;
        Ok(())
    }
}
