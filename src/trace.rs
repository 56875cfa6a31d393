//! The trace: a graph of constant, lookup, request and output nodes with
//! cached values, the sufficient statistics of every procedure, the scope
//! index of random choices and the directives that root the graph.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. Parent
//! edges are implied by the node kind, child edges are stored explicitly.
//!
//! Mutations made inside a transaction are journaled so that a failing
//! transition can be undone exactly, see [`Trace::rollback_transaction`].

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use rand::RngCore;
use tracing::debug;

use crate::{
    detach,
    error::{Result, Site, TraceError},
    node::{Application, Node, NodeId, NodeKind},
    omegadb::OmegaDb,
    psp::{Args, Psp, Request, Sp, SufficientStats},
    regen::{self, RegenMode},
    scaffold::{PrincipalProposal, Scaffold},
    sps,
    value::{Env, SpRef, Value},
};

pub const DEFAULT_SCOPE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DirectiveId(pub u64);

impl fmt::Display for DirectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum DirectiveKind {
    Assume(Arc<str>),
    Predict,
    Observe(Value),
}

#[derive(Debug, Clone)]
pub struct Directive {
    pub kind: DirectiveKind,
    pub exp: Value,
    pub root: NodeId,
}

/// Per-procedure state kept in the trace, keyed by the node that made the
/// procedure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpRecord {
    pub stats: Option<SufficientStats>,
    pub families: BTreeMap<Value, NodeId>,
}

#[derive(Debug, Clone)]
enum Undo {
    Alloc { node: NodeId, from_free: bool },
    Value(NodeId, Option<Value>),
    Request(NodeId, Option<Request>),
    AddChild(NodeId, NodeId),
    RemoveChild(NodeId, NodeId),
    PushEsrParent(NodeId),
    PopEsrParent(NodeId, NodeId),
    NumRequests(NodeId, usize),
    Observed(NodeId, Option<Value>),
    Stats(NodeId, Option<SufficientStats>),
    InstallRecord(NodeId, Option<SpRecord>),
    RemoveRecord(NodeId, SpRecord),
    RegisterFamily(NodeId, Value),
    UnregisterFamily(NodeId, Value, NodeId),
    RegisterChoice(NodeId),
    UnregisterChoice(NodeId),
    Retire,
}

pub struct Trace {
    pub(crate) nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    retired: Vec<NodeId>,
    pub(crate) sp_records: BTreeMap<NodeId, SpRecord>,
    pub(crate) random_choices: BTreeSet<NodeId>,
    pub(crate) scopes: BTreeMap<Value, BTreeMap<Value, BTreeSet<NodeId>>>,
    global_env: Env,
    pub(crate) directives: BTreeMap<DirectiveId, Directive>,
    /// Observed values keyed by the root of their observe directive.
    pub(crate) observations: BTreeMap<NodeId, Value>,
    next_directive: u64,
    journal: Option<Vec<Undo>>,
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace")
            .field("nodes", &self.num_nodes())
            .field("random_choices", &self.random_choices.len())
            .field("directives", &self.directives.len())
            .finish()
    }
}

impl Default for Trace {
    fn default() -> Self {
        Trace::new()
    }
}

impl Trace {
    /// A trace whose global environment holds the built-in procedures.
    pub fn new() -> Trace {
        let mut trace = Trace::empty();
        for (name, sp) in sps::builtins() {
            trace.bind_procedure(name, sp);
        }
        trace
    }

    pub fn empty() -> Trace {
        Trace {
            nodes: Vec::new(),
            free: Vec::new(),
            retired: Vec::new(),
            sp_records: BTreeMap::new(),
            random_choices: BTreeSet::new(),
            scopes: BTreeMap::new(),
            global_env: Env::new(),
            directives: BTreeMap::new(),
            observations: BTreeMap::new(),
            next_directive: 1,
            journal: None,
        }
    }

    pub fn global_env(&self) -> &Env {
        &self.global_env
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_some()).count()
    }

    /// # Panics
    ///
    /// If the node was freed. Node ids held by the trace itself are always
    /// live.
    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.0].as_ref().expect("Node is not live")
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0].as_mut().expect("Node is not live")
    }

    pub fn value(&self, id: NodeId) -> Option<&Value> {
        self.node(id).value.as_ref()
    }

    pub fn value_at(&self, id: NodeId) -> Result<&Value> {
        self.value(id)
            .ok_or_else(|| TraceError::Inconsistent(format!("node {} has no value", id)))
    }

    pub fn is_constrained(&self, id: NodeId) -> bool {
        self.node(id).observed.is_some()
    }

    fn log(&mut self, undo: Undo) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(undo);
        }
    }

    // Transactions

    pub(crate) fn begin_transaction(&mut self) {
        debug_assert!(self.journal.is_none(), "Nested trace transaction");
        self.journal = Some(Vec::new());
    }

    /// Forget the journal and free the nodes retired during the transaction.
    pub(crate) fn commit_transaction(&mut self) {
        self.journal = None;
        for id in std::mem::take(&mut self.retired) {
            self.nodes[id.0] = None;
            self.free.push(id);
        }
    }

    /// Undo every mutation since `begin_transaction`, newest first.
    pub(crate) fn rollback_transaction(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        debug!(mutations = journal.len(), "Rolling back trace transaction");
        for undo in journal.into_iter().rev() {
            self.undo(undo);
        }
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.journal.is_some()
    }

    fn undo(&mut self, undo: Undo) {
        match undo {
            Undo::Alloc { node, from_free } => {
                self.nodes[node.0] = None;
                if from_free {
                    self.free.push(node);
                } else {
                    debug_assert_eq!(node.0 + 1, self.nodes.len());
                    self.nodes.pop();
                }
            }
            Undo::Value(node, old) => self.node_mut(node).value = old,
            Undo::Request(node, old) => self.node_mut(node).request = old,
            Undo::AddChild(parent, child) => {
                self.node_mut(parent).children.remove(&child);
            }
            Undo::RemoveChild(parent, child) => {
                self.node_mut(parent).children.insert(child);
            }
            Undo::PushEsrParent(output) => {
                if let NodeKind::Output { esr_parents, .. } = &mut self.node_mut(output).kind {
                    esr_parents.pop();
                }
            }
            Undo::PopEsrParent(output, root) => {
                if let NodeKind::Output { esr_parents, .. } = &mut self.node_mut(output).kind {
                    esr_parents.push(root);
                }
            }
            Undo::NumRequests(node, old) => self.node_mut(node).num_requests = old,
            Undo::Observed(node, old) => self.node_mut(node).observed = old,
            Undo::Stats(maker, old) => {
                if let Some(record) = self.sp_records.get_mut(&maker) {
                    record.stats = old;
                }
            }
            Undo::InstallRecord(maker, previous) => match previous {
                Some(record) => {
                    self.sp_records.insert(maker, record);
                }
                None => {
                    self.sp_records.remove(&maker);
                }
            },
            Undo::RemoveRecord(maker, record) => {
                self.sp_records.insert(maker, record);
            }
            Undo::RegisterFamily(maker, id) => {
                if let Some(record) = self.sp_records.get_mut(&maker) {
                    record.families.remove(&id);
                }
            }
            Undo::UnregisterFamily(maker, id, root) => {
                if let Some(record) = self.sp_records.get_mut(&maker) {
                    record.families.insert(id, root);
                }
            }
            Undo::RegisterChoice(node) => {
                self.random_choices.remove(&node);
                self.unindex(node);
            }
            Undo::UnregisterChoice(node) => {
                self.random_choices.insert(node);
                self.index(node);
            }
            Undo::Retire => {
                self.retired.pop();
            }
        }
    }

    /// Run `f` in a transaction, rolling back if it fails.
    pub(crate) fn transact<T>(&mut self, f: impl FnOnce(&mut Trace) -> Result<T>) -> Result<T> {
        self.begin_transaction();
        match f(self) {
            Ok(value) => {
                self.commit_transaction();
                Ok(value)
            }
            Err(err) => {
                self.rollback_transaction();
                Err(err)
            }
        }
    }

    // Graph construction

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id.0] = Some(node);
                self.log(Undo::Alloc {
                    node: id,
                    from_free: true,
                });
                id
            }
            None => {
                let id = NodeId(self.nodes.len());
                self.nodes.push(Some(node));
                self.log(Undo::Alloc {
                    node: id,
                    from_free: false,
                });
                id
            }
        }
    }

    /// Mark a node that is no longer connected to the graph for freeing
    /// when the current transaction commits.
    pub(crate) fn retire(&mut self, id: NodeId) {
        if self.in_transaction() {
            self.retired.push(id);
            self.log(Undo::Retire);
        } else {
            self.nodes[id.0] = None;
            self.free.push(id);
        }
    }

    pub(crate) fn create_constant(&mut self, value: Value) -> NodeId {
        self.alloc(Node::constant(value))
    }

    pub(crate) fn create_lookup(&mut self, source: NodeId) -> NodeId {
        let mut node = Node::new(NodeKind::Lookup { source }, Vec::new());
        node.value = self.value(source).cloned();
        let id = self.alloc(node);
        self.add_child(source, id);
        id
    }

    /// Create the request and output node of an application. Neither is
    /// evaluated.
    pub(crate) fn create_application_nodes(
        &mut self,
        operator: NodeId,
        operands: Vec<NodeId>,
        env: Env,
        tags: Vec<(Value, Value)>,
    ) -> (NodeId, NodeId) {
        let app = Application {
            operator,
            operands,
            env,
        };
        let request = self.alloc(Node::new(
            NodeKind::Request {
                app: app.clone(),
                output: NodeId(usize::MAX),
            },
            tags.clone(),
        ));
        let output = self.alloc(Node::new(
            NodeKind::Output {
                app: app.clone(),
                request,
                esr_parents: Vec::new(),
            },
            tags,
        ));
        if let NodeKind::Request { output: slot, .. } = &mut self.node_mut(request).kind {
            *slot = output;
        }
        for parent in std::iter::once(operator).chain(app.operands.iter().copied()) {
            self.add_child(parent, request);
            self.add_child(parent, output);
        }
        self.add_child(request, output);
        (request, output)
    }

    pub(crate) fn add_child(&mut self, parent: NodeId, child: NodeId) {
        if self.node_mut(parent).children.insert(child) {
            self.log(Undo::AddChild(parent, child));
        }
    }

    pub(crate) fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        if self.node_mut(parent).children.remove(&child) {
            self.log(Undo::RemoveChild(parent, child));
        }
    }

    pub(crate) fn disconnect_lookup(&mut self, node: NodeId) {
        if let NodeKind::Lookup { source } = self.node(node).kind {
            self.remove_child(source, node);
        }
    }

    pub(crate) fn reconnect_lookup(&mut self, node: NodeId) {
        if let NodeKind::Lookup { source } = self.node(node).kind {
            self.add_child(source, node);
        }
    }

    /// Record that the family rooted at `root` was requested for `output`.
    pub(crate) fn add_esr_edge(&mut self, root: NodeId, output: NodeId) {
        if let NodeKind::Output { esr_parents, .. } = &mut self.node_mut(output).kind {
            esr_parents.push(root);
            self.log(Undo::PushEsrParent(output));
        }
        self.add_child(root, output);
        let count = self.node(root).num_requests;
        self.set_num_requests(root, count + 1);
    }

    /// Remove the most recently added family edge of `output` and return
    /// its root.
    pub(crate) fn pop_esr_parent(&mut self, output: NodeId) -> Result<NodeId> {
        let root = match &mut self.node_mut(output).kind {
            NodeKind::Output { esr_parents, .. } => esr_parents.pop(),
            _ => None,
        }
        .ok_or_else(|| {
            TraceError::Inconsistent(format!("node {} has no requested families", output))
        })?;
        self.log(Undo::PopEsrParent(output, root));
        if !self.node(output).esr_parents().contains(&root) {
            self.remove_child(root, output);
        }
        let count = self.node(root).num_requests;
        self.set_num_requests(root, count.saturating_sub(1));
        Ok(root)
    }

    fn set_num_requests(&mut self, node: NodeId, count: usize) {
        let old = std::mem::replace(&mut self.node_mut(node).num_requests, count);
        self.log(Undo::NumRequests(node, old));
    }

    pub(crate) fn set_value(&mut self, node: NodeId, value: Value) {
        let old = self.node_mut(node).value.replace(value);
        self.log(Undo::Value(node, old));
    }

    /// Detach the cached value and return it.
    pub(crate) fn clear_value(&mut self, node: NodeId) -> Option<Value> {
        let old = self.node_mut(node).value.take();
        self.log(Undo::Value(node, old.clone()));
        old
    }

    pub(crate) fn set_request(&mut self, node: NodeId, request: Option<Request>) {
        let old = std::mem::replace(&mut self.node_mut(node).request, request);
        self.log(Undo::Request(node, old));
    }

    pub(crate) fn set_observed(&mut self, node: NodeId, value: Option<Value>) {
        let old = std::mem::replace(&mut self.node_mut(node).observed, value);
        self.log(Undo::Observed(node, old));
    }

    // Procedures

    /// The procedure applied at a request or output node.
    pub fn operator_sp(&self, node: NodeId) -> Result<SpRef> {
        let app = self.node(node).application().ok_or_else(|| {
            TraceError::Inconsistent(format!("node {} is not an application", node))
        })?;
        match self.value_at(app.operator)? {
            Value::Procedure(sp) => Ok(sp.clone()),
            other => Err(TraceError::NotAProcedure {
                site: Site::node(node),
                got: other.type_name().to_string(),
            }),
        }
    }

    pub fn output_psp(&self, node: NodeId) -> Result<Arc<dyn Psp>> {
        Ok(self.operator_sp(node)?.sp.output.clone())
    }

    pub fn args_at(&self, node: NodeId) -> Result<Args> {
        let sp = self.operator_sp(node)?;
        let this = self.node(node);
        let app = this.application().ok_or_else(|| {
            TraceError::Inconsistent(format!("node {} is not an application", node))
        })?;
        let operand_values = app
            .operands
            .iter()
            .map(|&operand| self.value_at(operand).cloned())
            .collect::<Result<Vec<_>>>()?;
        let esr_nodes = this.esr_parents().to_vec();
        let esr_values = esr_nodes
            .iter()
            .map(|&root| self.value_at(root).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(Args {
            node,
            operand_values,
            operand_nodes: app.operands.clone(),
            esr_values,
            esr_nodes,
            env: app.env.clone(),
            stats: self
                .sp_records
                .get(&sp.maker)
                .and_then(|record| record.stats.clone()),
        })
    }

    /// Whether a change of `parent` can be absorbed at `node`.
    pub fn can_absorb_at(&self, node: NodeId, parent: NodeId) -> Result<bool> {
        let sp = self.operator_sp(node)?;
        if self.node(node).is_request() {
            return Ok(match &sp.sp.request {
                None => true,
                Some(psp) => psp.can_absorb(self, node, parent),
            });
        }
        Ok(sp.sp.output.can_absorb(self, node, parent))
    }

    /// Log density of `value` at an output node under its current
    /// arguments. Request nodes have no density of their own and give zero.
    pub fn log_density_at(&self, node: NodeId, value: &Value) -> Result<f64> {
        if self.node(node).is_request() {
            return Ok(0.);
        }
        let sp = self.operator_sp(node)?;
        let name = sp.sp.name();
        let density = sp
            .sp
            .output
            .density()
            .ok_or(TraceError::DensityUnavailable {
                site: Site::default(),
            })
            .map_err(|err| err.at(node, Some(name)))?;
        let args = self.args_at(node)?;
        let log_density = density
            .log_density(value, &args)
            .map_err(|err| err.at(node, Some(name)))?;
        if log_density.is_nan() || log_density == f64::INFINITY {
            return Err(TraceError::numerical("log density", log_density).at(node, Some(name)));
        }
        Ok(log_density)
    }

    pub(crate) fn incorporate_at(&mut self, node: NodeId) -> Result<()> {
        self.update_stats(node, true)
    }

    pub(crate) fn unincorporate_at(&mut self, node: NodeId) -> Result<()> {
        self.update_stats(node, false)
    }

    fn update_stats(&mut self, node: NodeId, incorporate: bool) -> Result<()> {
        if !self.node(node).is_output() {
            return Ok(());
        }
        let sp = self.operator_sp(node)?;
        let Some(mut stats) = self
            .sp_records
            .get(&sp.maker)
            .and_then(|record| record.stats.clone())
        else {
            return Ok(());
        };
        let value = self.value_at(node)?.clone();
        let args = self.args_at(node)?;
        let psp = &sp.sp.output;
        if incorporate {
            psp.incorporate(&value, &args, &mut stats)
        } else {
            psp.remove(&value, &args, &mut stats)
        }
        .map_err(|err| err.at(node, Some(psp.name())))?;
        if let Some(record) = self.sp_records.get_mut(&sp.maker) {
            let old = record.stats.replace(stats);
            self.log(Undo::Stats(sp.maker, old));
        }
        Ok(())
    }

    pub fn sp_record(&self, maker: NodeId) -> Option<&SpRecord> {
        self.sp_records.get(&maker)
    }

    pub(crate) fn install_sp_record(&mut self, maker: NodeId, stats: Option<SufficientStats>) {
        let previous = self.sp_records.insert(
            maker,
            SpRecord {
                stats,
                families: BTreeMap::new(),
            },
        );
        self.log(Undo::InstallRecord(maker, previous));
    }

    pub(crate) fn remove_sp_record(&mut self, maker: NodeId) -> Option<SpRecord> {
        let record = self.sp_records.remove(&maker)?;
        self.log(Undo::RemoveRecord(maker, record.clone()));
        Some(record)
    }

    pub fn family(&self, maker: NodeId, id: &Value) -> Option<NodeId> {
        self.sp_records
            .get(&maker)
            .and_then(|record| record.families.get(id))
            .copied()
    }

    pub(crate) fn register_family(&mut self, maker: NodeId, id: Value, root: NodeId) -> Result<()> {
        let record = self.sp_records.get_mut(&maker).ok_or_else(|| {
            TraceError::Inconsistent(format!("procedure made at node {} has no record", maker))
        })?;
        record.families.insert(id.clone(), root);
        self.log(Undo::RegisterFamily(maker, id));
        Ok(())
    }

    pub(crate) fn unregister_family(&mut self, maker: NodeId, id: &Value) -> Result<NodeId> {
        let root = self
            .sp_records
            .get_mut(&maker)
            .and_then(|record| record.families.remove(id))
            .ok_or_else(|| {
                TraceError::Inconsistent(format!(
                    "procedure made at node {} has no family {}",
                    maker, id
                ))
            })?;
        self.log(Undo::UnregisterFamily(maker, id.clone(), root));
        Ok(root)
    }

    /// Bind an externally provided procedure in the global environment.
    pub fn bind_procedure(&mut self, name: &str, sp: Sp) -> NodeId {
        let node = self.alloc(Node::new(NodeKind::Constant, Vec::new()));
        let sp = SpRef::new(node, sp);
        self.install_sp_record(node, sp.sp.initial_stats.clone());
        self.node_mut(node).value = Some(Value::Procedure(sp));
        self.global_env.bind(name, node);
        node
    }

    // Random choices and the scope index

    fn tags_of(&self, node: NodeId) -> Vec<(Value, Value)> {
        let mut tags = vec![(Value::symbol(DEFAULT_SCOPE), Value::Atom(node.0))];
        tags.extend(self.node(node).tags.iter().cloned());
        tags
    }

    fn index(&mut self, node: NodeId) {
        for (scope, block) in self.tags_of(node) {
            self.scopes
                .entry(scope)
                .or_default()
                .entry(block)
                .or_default()
                .insert(node);
        }
    }

    fn unindex(&mut self, node: NodeId) {
        for (scope, block) in self.tags_of(node) {
            let Some(blocks) = self.scopes.get_mut(&scope) else {
                continue;
            };
            if let Some(nodes) = blocks.get_mut(&block) {
                nodes.remove(&node);
                if nodes.is_empty() {
                    blocks.remove(&block);
                }
            }
            if blocks.is_empty() {
                self.scopes.remove(&scope);
            }
        }
    }

    pub(crate) fn register_random_choice(&mut self, node: NodeId) {
        if self.random_choices.insert(node) {
            self.index(node);
            self.log(Undo::RegisterChoice(node));
        }
    }

    pub(crate) fn unregister_random_choice(&mut self, node: NodeId) {
        if self.random_choices.remove(&node) {
            self.unindex(node);
            self.log(Undo::UnregisterChoice(node));
        }
    }

    pub fn is_random_choice(&self, node: NodeId) -> bool {
        self.random_choices.contains(&node)
    }

    pub fn random_choices(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.random_choices.iter().copied()
    }

    pub fn num_random_choices(&self) -> usize {
        self.random_choices.len()
    }

    pub fn blocks(&self, scope: &Value) -> Vec<Value> {
        self.scopes
            .get(scope)
            .map(|blocks| blocks.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn num_blocks(&self, scope: &Value) -> usize {
        self.scopes.get(scope).map_or(0, |blocks| blocks.len())
    }

    pub fn block_nodes(&self, scope: &Value, block: &Value) -> BTreeSet<NodeId> {
        self.scopes
            .get(scope)
            .and_then(|blocks| blocks.get(block))
            .cloned()
            .unwrap_or_default()
    }

    pub fn scope_nodes(&self, scope: &Value) -> BTreeSet<NodeId> {
        self.scopes
            .get(scope)
            .map(|blocks| blocks.values().flatten().copied().collect())
            .unwrap_or_default()
    }

    // Directives

    fn add_directive(&mut self, kind: DirectiveKind, exp: &Value, root: NodeId) -> DirectiveId {
        let id = DirectiveId(self.next_directive);
        self.next_directive += 1;
        self.directives.insert(
            id,
            Directive {
                kind,
                exp: exp.clone(),
                root,
            },
        );
        id
    }

    pub fn directive(&self, id: DirectiveId) -> Result<&Directive> {
        self.directives
            .get(&id)
            .ok_or(TraceError::UnknownDirective(id.0))
    }

    pub fn directives(&self) -> impl Iterator<Item = (DirectiveId, &Directive)> + '_ {
        self.directives.iter().map(|(&id, directive)| (id, directive))
    }

    /// Evaluate `exp` and bind the result to `symbol` in the global
    /// environment.
    pub fn assume(
        &mut self,
        symbol: &str,
        exp: &Value,
        rng: &mut dyn RngCore,
    ) -> Result<(DirectiveId, Value)> {
        let env = self.global_env.clone();
        let root = self.transact(|trace| regen::eval_expression(trace, exp, &env, rng))?;
        self.global_env.bind(symbol, root);
        let id = self.add_directive(DirectiveKind::Assume(symbol.into()), exp, root);
        debug!(directive = id.0, symbol, root = root.0, "Assumed");
        Ok((id, self.value_at(root)?.clone()))
    }

    pub fn predict(&mut self, exp: &Value, rng: &mut dyn RngCore) -> Result<(DirectiveId, Value)> {
        let env = self.global_env.clone();
        let root = self.transact(|trace| regen::eval_expression(trace, exp, &env, rng))?;
        let id = self.add_directive(DirectiveKind::Predict, exp, root);
        debug!(directive = id.0, root = root.0, "Predicted");
        Ok((id, self.value_at(root)?.clone()))
    }

    /// Evaluate `exp` and constrain the random choice that produced it to
    /// `value`. Returns the log density of the observation.
    pub fn observe(
        &mut self,
        exp: &Value,
        value: Value,
        rng: &mut dyn RngCore,
    ) -> Result<(DirectiveId, f64)> {
        let env = self.global_env.clone();
        let (root, weight) = self.transact(|trace| {
            let root = regen::eval_expression(trace, exp, &env, rng)?;
            let weight = trace.constrain(root, &value, rng)?;
            Ok((root, weight))
        })?;
        self.observations.insert(root, value.clone());
        let id = self.add_directive(DirectiveKind::Observe(value), exp, root);
        debug!(directive = id.0, root = root.0, weight, "Observed");
        Ok((id, weight))
    }

    /// Remove a directive and every node that only it kept alive.
    pub fn forget(&mut self, id: DirectiveId) -> Result<()> {
        let directive = self.directive(id)?.clone();
        let root = directive.root;
        let node = self.node(root);
        if !node.children.is_empty() || node.num_requests > 0 {
            return Err(TraceError::DirectiveInUse(id.0));
        }
        self.transact(|trace| {
            if let DirectiveKind::Observe(_) = directive.kind {
                trace.unconstrain(root)?;
            }
            detach::discard_family(trace, root)
        })?;
        self.observations.remove(&root);
        if let DirectiveKind::Assume(symbol) = &directive.kind {
            if self.global_env.find(symbol) == Some(root) {
                self.global_env.unbind(symbol);
            }
        }
        self.directives.remove(&id);
        debug!(directive = id.0, "Forgot");
        Ok(())
    }

    pub fn report(&self, id: DirectiveId) -> Result<Value> {
        let root = self.directive(id)?.root;
        Ok(self.value_at(root)?.clone())
    }

    /// Follow lookups and family references down to the random choice
    /// whose value a node reports.
    pub(crate) fn constrainable_node(&self, mut node: NodeId) -> Result<NodeId> {
        loop {
            match &self.node(node).kind {
                NodeKind::Lookup { source } => node = *source,
                NodeKind::Output { esr_parents, .. } => {
                    let psp = self.output_psp(node)?;
                    if !psp.is_esr_reference() {
                        return Ok(node);
                    }
                    node = *esr_parents.first().ok_or_else(|| {
                        TraceError::Inconsistent(format!("node {} has no family", node))
                    })?;
                }
                _ => {
                    return Err(TraceError::CannotConstrain {
                        site: Site::node(node),
                        message: "expression does not produce a random choice".into(),
                    })
                }
            }
        }
    }

    /// The observed value of the observation rooted at `root`, if any.
    pub(crate) fn observation(&self, root: NodeId) -> Option<&Value> {
        self.observations.get(&root)
    }

    /// Whether `target` is a free random choice with a density.
    pub(crate) fn check_constrainable(&self, target: NodeId) -> Result<()> {
        let psp = self.output_psp(target)?;
        let site = Site {
            node: Some(target),
            procedure: Some(psp.name().into()),
        };
        if self.is_constrained(target) {
            return Err(TraceError::CannotConstrain {
                site,
                message: "random choice is already observed".into(),
            });
        }
        if !psp.is_random() || psp.density().is_none() {
            return Err(TraceError::CannotConstrain {
                site,
                message: "procedure has no density".into(),
            });
        }
        Ok(())
    }

    /// Log density of the value at an output node, with the value taken out
    /// of its procedure's statistics while it is measured.
    pub(crate) fn log_density_excluding(&mut self, node: NodeId) -> Result<f64> {
        self.unincorporate_at(node)?;
        let value = self.value_at(node)?.clone();
        let log_density = self.log_density_at(node, &value);
        self.incorporate_at(node)?;
        log_density
    }

    fn constrain(&mut self, root: NodeId, value: &Value, rng: &mut dyn RngCore) -> Result<f64> {
        let target = self.constrainable_node(root)?;
        self.check_constrainable(target)?;

        // Move the choice to the observed value and bring its dependents
        // up to date.
        let fixed = BTreeMap::from([(target, value.clone())]);
        let scaffold = Scaffold::construct(
            self,
            BTreeSet::from([target]),
            PrincipalProposal::Fixed(fixed),
        )?;
        let (_, db) = detach::detach_and_extract(self, &scaffold, false)?;
        regen::regen_and_attach(self, &scaffold, RegenMode::Fresh, &db, rng)?;
        self.retire_brush(&db);

        self.unregister_random_choice(target);
        self.set_observed(target, Some(value.clone()));
        self.log_density_excluding(target)
    }

    fn unconstrain(&mut self, root: NodeId) -> Result<()> {
        let target = self.constrainable_node(root)?;
        self.set_observed(target, None);
        if self.output_psp(target)?.is_random() {
            self.register_random_choice(target);
        }
        Ok(())
    }

    /// Free the brush nodes recorded in `db` once the transaction commits.
    pub(crate) fn retire_brush(&mut self, db: &OmegaDb) {
        for &node in db.brush() {
            self.retire(node);
        }
    }
}
