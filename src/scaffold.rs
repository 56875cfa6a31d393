//! Scaffolds: the part of a trace one transition tears down and rebuilds.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use tracing::trace;

use crate::{
    error::Result,
    kernel::ProposalKernel,
    node::{NodeId, NodeKind},
    trace::Trace,
};

/// How principal nodes get their new values during regeneration.
#[derive(Debug, Clone, Default)]
pub enum PrincipalProposal {
    /// Simulate from the procedure, as every other resampled node.
    #[default]
    Prior,
    Kernel(Arc<dyn ProposalKernel>),
    /// Use the given values. Used by the Hamiltonian kernel and to move
    /// observed choices to their observed value.
    Fixed(BTreeMap<NodeId, crate::value::Value>),
}

impl PrincipalProposal {
    pub fn is_prior(&self) -> bool {
        matches!(self, PrincipalProposal::Prior)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scaffold {
    /// Nodes the transition proposes new values for.
    pub principal: BTreeSet<NodeId>,
    /// Nodes downstream of the principal nodes that are simulated again.
    pub resampled: BTreeSet<NodeId>,
    /// Nodes whose value is kept and whose density is re-evaluated.
    pub absorbing: BTreeSet<NodeId>,
    /// Nodes of families that only resampled requests asked for. They are
    /// destroyed on detach and evaluated from scratch on regeneration.
    pub brush: BTreeSet<NodeId>,
    /// Resampling and absorbing nodes, parents before children.
    pub order: Vec<NodeId>,
    pub proposal: PrincipalProposal,
}

impl Scaffold {
    /// Build the scaffold of the given principal nodes.
    pub fn construct(
        trace: &Trace,
        principal: BTreeSet<NodeId>,
        proposal: PrincipalProposal,
    ) -> Result<Scaffold> {
        let (mut drg, mut absorbing) = candidate_scaffold(trace, &principal)?;
        let brush = find_brush(trace, &drg);
        drg.retain(|node| !brush.contains(node));
        absorbing.retain(|node| !brush.contains(node));
        let principal: BTreeSet<_> = principal
            .into_iter()
            .filter(|node| !brush.contains(node))
            .collect();
        let resampled: BTreeSet<_> = drg.difference(&principal).copied().collect();

        let members: BTreeSet<_> = drg.union(&absorbing).copied().collect();
        let order = regeneration_order(trace, &members);

        trace!(
            principal = principal.len(),
            resampled = resampled.len(),
            absorbing = absorbing.len(),
            brush = brush.len(),
            "Constructed scaffold"
        );
        Ok(Scaffold {
            principal,
            resampled,
            absorbing,
            brush,
            order,
            proposal,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn is_principal(&self, node: NodeId) -> bool {
        self.principal.contains(&node)
    }

    /// Whether the node is detached and simulated again.
    pub fn is_resampling(&self, node: NodeId) -> bool {
        self.principal.contains(&node) || self.resampled.contains(&node)
    }

    pub fn is_absorbing(&self, node: NodeId) -> bool {
        self.absorbing.contains(&node)
    }

    pub fn is_brush(&self, node: NodeId) -> bool {
        self.brush.contains(&node)
    }
}

/// Walk downstream of the principal nodes, deciding for every node reached
/// whether it must be resampled or can absorb the change.
fn candidate_scaffold(
    trace: &Trace,
    principal: &BTreeSet<NodeId>,
) -> Result<(BTreeSet<NodeId>, BTreeSet<NodeId>)> {
    let mut drg = BTreeSet::new();
    let mut absorbing = BTreeSet::new();
    let mut queue: Vec<(NodeId, Option<NodeId>)> =
        principal.iter().map(|&node| (node, None)).collect();

    while let Some((node, parent)) = queue.pop() {
        if drg.contains(&node) {
            continue;
        }
        let this = trace.node(node);
        let resample = match parent {
            // Principal nodes.
            None => true,
            Some(_) if this.is_lookup() => true,
            Some(_) if this.observed.is_some() => false,
            Some(_) if this.application().is_some_and(|app| drg.contains(&app.operator)) => true,
            Some(parent) => !trace.can_absorb_at(node, parent)?,
        };
        if resample {
            absorbing.remove(&node);
            drg.insert(node);
            queue.extend(this.children.iter().map(|&child| (child, Some(node))));
        } else {
            absorbing.insert(node);
        }
    }
    Ok((drg, absorbing))
}

/// Families whose every request is resampled are destroyed by detach.
fn find_brush(trace: &Trace, drg: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
    let mut counts = BTreeMap::new();
    let mut disabled = BTreeSet::new();
    let mut brush = BTreeSet::new();
    for &node in drg {
        if trace.node(node).is_request() {
            disable_requests(trace, node, &mut counts, &mut disabled, &mut brush);
        }
    }
    brush
}

fn disable_requests(
    trace: &Trace,
    node: NodeId,
    counts: &mut BTreeMap<NodeId, usize>,
    disabled: &mut BTreeSet<NodeId>,
    brush: &mut BTreeSet<NodeId>,
) {
    if !disabled.insert(node) {
        return;
    }
    let NodeKind::Request { output, .. } = trace.node(node).kind else {
        return;
    };
    for &root in trace.node(output).esr_parents() {
        let count = counts.entry(root).or_insert(0);
        *count += 1;
        if *count == trace.node(root).num_requests {
            disable_family(trace, root, counts, disabled, brush);
        }
    }
}

fn disable_family(
    trace: &Trace,
    node: NodeId,
    counts: &mut BTreeMap<NodeId, usize>,
    disabled: &mut BTreeSet<NodeId>,
    brush: &mut BTreeSet<NodeId>,
) {
    if !brush.insert(node) {
        return;
    }
    if let NodeKind::Output { app, request, .. } = &trace.node(node).kind {
        brush.insert(*request);
        disable_requests(trace, *request, counts, disabled, brush);
        disable_family(trace, app.operator, counts, disabled, brush);
        for &operand in app.operands.iter() {
            disable_family(trace, operand, counts, disabled, brush);
        }
    }
}

/// Depth-first postorder over parent edges restricted to `members`.
fn regeneration_order(trace: &Trace, members: &BTreeSet<NodeId>) -> Vec<NodeId> {
    let mut order = Vec::with_capacity(members.len());
    let mut visited = BTreeSet::new();
    for &start in members {
        if !visited.insert(start) {
            continue;
        }
        let mut stack = vec![(start, trace.node(start).parents().into_iter())];
        loop {
            let Some((node, parents)) = stack.last_mut() else {
                break;
            };
            let node = *node;
            match parents.next() {
                Some(parent) => {
                    if members.contains(&parent) && visited.insert(parent) {
                        stack.push((parent, trace.node(parent).parents().into_iter()));
                    }
                }
                None => {
                    order.push(node);
                    stack.pop();
                }
            }
        }
    }
    order
}
