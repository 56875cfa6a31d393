use std::{collections::BTreeSet, fmt};

use crate::{
    psp::Request,
    value::{Env, Value},
};

/// Stable index of a node in the trace arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The operator and operand nodes of an application, and the environment
/// the application was evaluated in.
#[derive(Debug, Clone)]
pub struct Application {
    pub operator: NodeId,
    pub operands: Vec<NodeId>,
    pub env: Env,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Constant,
    Lookup {
        source: NodeId,
    },
    /// First half of an application: produces the requests of the procedure.
    Request {
        app: Application,
        output: NodeId,
    },
    /// Second half of an application: produces its value. ESR parents are
    /// the roots of the families requested by the request node.
    Output {
        app: Application,
        request: NodeId,
        esr_parents: Vec<NodeId>,
    },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    /// `None` while the node is detached.
    pub value: Option<Value>,
    /// Cached request of a request node.
    pub request: Option<Request>,
    pub children: BTreeSet<NodeId>,
    /// Scope/block pairs this node belongs to if it is a random choice.
    pub tags: Vec<(Value, Value)>,
    pub observed: Option<Value>,
    /// Number of requests that currently reference this node as a family root.
    pub num_requests: usize,
}

impl Node {
    pub fn new(kind: NodeKind, tags: Vec<(Value, Value)>) -> Node {
        Node {
            kind,
            value: None,
            request: None,
            children: BTreeSet::new(),
            tags,
            observed: None,
            num_requests: 0,
        }
    }

    pub fn constant(value: Value) -> Node {
        let mut node = Node::new(NodeKind::Constant, Vec::new());
        node.value = Some(value);
        node
    }

    pub fn parents(&self) -> Vec<NodeId> {
        match &self.kind {
            NodeKind::Constant => Vec::new(),
            NodeKind::Lookup { source } => vec![*source],
            NodeKind::Request { app, .. } => {
                let mut parents = Vec::with_capacity(app.operands.len() + 1);
                parents.push(app.operator);
                parents.extend_from_slice(&app.operands);
                parents
            }
            NodeKind::Output {
                app,
                request,
                esr_parents,
            } => {
                let mut parents = Vec::with_capacity(app.operands.len() + esr_parents.len() + 2);
                parents.push(app.operator);
                parents.extend_from_slice(&app.operands);
                parents.push(*request);
                parents.extend_from_slice(esr_parents);
                parents
            }
        }
    }

    pub fn application(&self) -> Option<&Application> {
        match &self.kind {
            NodeKind::Request { app, .. } | NodeKind::Output { app, .. } => Some(app),
            _ => None,
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self.kind, NodeKind::Output { .. })
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, NodeKind::Request { .. })
    }

    pub fn is_lookup(&self) -> bool {
        matches!(self.kind, NodeKind::Lookup { .. })
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, NodeKind::Constant)
    }

    pub fn esr_parents(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Output { esr_parents, .. } => esr_parents,
            _ => &[],
        }
    }
}
