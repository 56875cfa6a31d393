use std::collections::BTreeMap;

use crate::{node::NodeId, value::Value};

/// What detaching a scaffold removed from the trace: enough to put it back
/// exactly, and the gradients computed on the way.
#[derive(Debug, Clone, Default)]
pub struct OmegaDb {
    values: BTreeMap<NodeId, Value>,
    /// Roots of destroyed families, by the procedure that requested them.
    families: BTreeMap<(NodeId, Value), NodeId>,
    /// Nodes of destroyed families, in the order they were unevaluated.
    brush: Vec<NodeId>,
    /// Partial derivatives of the detached log density with respect to
    /// node values.
    partials: BTreeMap<NodeId, Value>,
}

impl OmegaDb {
    pub fn value(&self, node: NodeId) -> Option<&Value> {
        self.values.get(&node)
    }

    pub(crate) fn record_value(&mut self, node: NodeId, value: Value) {
        self.values.insert(node, value);
    }

    pub fn family(&self, maker: NodeId, id: &Value) -> Option<NodeId> {
        self.families.get(&(maker, id.clone())).copied()
    }

    pub(crate) fn record_family(&mut self, maker: NodeId, id: Value, root: NodeId) {
        self.families.insert((maker, id), root);
    }

    pub fn brush(&self) -> &[NodeId] {
        &self.brush
    }

    pub(crate) fn record_brush(&mut self, node: NodeId) {
        self.brush.push(node);
    }

    pub fn partial(&self, node: NodeId) -> Option<&Value> {
        self.partials.get(&node)
    }

    pub(crate) fn partials(&self) -> &BTreeMap<NodeId, Value> {
        &self.partials
    }

    pub(crate) fn partials_mut(&mut self) -> &mut BTreeMap<NodeId, Value> {
        &mut self.partials
    }
}
