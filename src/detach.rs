//! Detaching a scaffold: uninstalling the values of resampled nodes in
//! reverse regeneration order, destroying the families only they
//! requested, and optionally pulling the gradient of the detached log
//! density back to the principal nodes.

use tracing::trace;

use crate::{
    error::{Result, Site, TraceError},
    gradient,
    node::{NodeId, NodeKind},
    omegadb::OmegaDb,
    scaffold::Scaffold,
    trace::Trace,
    value::Value,
};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DetachWeights {
    /// Log density of absorbing nodes, and of principal nodes unless the
    /// proposal draws them from the prior.
    pub old_log_density: f64,
}

pub(crate) fn detach_and_extract(
    trace: &mut Trace,
    scaffold: &Scaffold,
    with_gradient: bool,
) -> Result<(DetachWeights, OmegaDb)> {
    let mut detach = Detach {
        trace,
        scaffold,
        db: OmegaDb::default(),
        with_gradient,
        weight: 0.,
        made: Vec::new(),
    };
    for &node in scaffold.order.iter().rev() {
        if scaffold.is_absorbing(node) {
            detach.detach_absorbing(node)?;
        } else {
            detach.extract(node)?;
        }
    }
    detach.teardown_records();
    trace!(
        old_log_density = detach.weight,
        brush = detach.db.brush().len(),
        "Detached scaffold"
    );
    Ok((
        DetachWeights {
            old_log_density: detach.weight,
        },
        detach.db,
    ))
}

/// Remove a whole family from the trace and free its nodes.
pub(crate) fn discard_family(trace: &mut Trace, root: NodeId) -> Result<()> {
    let scaffold = Scaffold::default();
    let mut detach = Detach {
        trace,
        scaffold: &scaffold,
        db: OmegaDb::default(),
        with_gradient: false,
        weight: 0.,
        made: Vec::new(),
    };
    detach.uneval_family(root)?;
    detach.teardown_records();
    let db = detach.db;
    trace.retire_brush(&db);
    Ok(())
}

struct Detach<'a> {
    trace: &'a mut Trace,
    scaffold: &'a Scaffold,
    db: OmegaDb,
    with_gradient: bool,
    weight: f64,
    /// Nodes whose detached value was a procedure made there. Their records
    /// go once every application of the procedure is detached.
    made: Vec<NodeId>,
}

fn missing_gradient(node: NodeId, procedure: &str, capability: &'static str) -> TraceError {
    TraceError::GradientUnavailable {
        site: Site {
            node: Some(node),
            procedure: Some(procedure.into()),
        },
        capability,
    }
}

impl Detach<'_> {
    fn detach_absorbing(&mut self, node: NodeId) -> Result<()> {
        if !self.trace.node(node).is_output() {
            return Ok(());
        }
        let value = self.trace.value_at(node)?.clone();
        self.trace.unincorporate_at(node)?;
        self.weight += self.trace.log_density_at(node, &value)?;
        if self.with_gradient {
            self.pull_density_gradient(node, &value)?;
        }
        Ok(())
    }

    /// Send the gradient of an absorbing node's log density to those of
    /// its operands that are being resampled.
    fn pull_density_gradient(&mut self, node: NodeId, value: &Value) -> Result<()> {
        let args = self.trace.args_at(node)?;
        if !args
            .operand_nodes
            .iter()
            .any(|&operand| self.scaffold.is_resampling(operand))
        {
            return Ok(());
        }
        let psp = self.trace.output_psp(node)?;
        let gradient = psp
            .density_gradient()
            .ok_or_else(|| missing_gradient(node, psp.name(), "a log density gradient"))?;
        let (_, partials) = gradient
            .gradient_of_log_density(value, &args)
            .map_err(|err| err.at(node, Some(psp.name())))?;
        for (&operand, partial) in args.operand_nodes.iter().zip(partials) {
            if self.scaffold.is_resampling(operand) && !gradient::is_zero(&partial) {
                gradient::accumulate(self.db.partials_mut(), operand, partial)
                    .map_err(|err| err.at(node, Some(psp.name())))?;
            }
        }
        Ok(())
    }

    fn extract(&mut self, node: NodeId) -> Result<()> {
        if self.trace.observation(node).is_some() {
            self.release_observation(node)?;
        }
        let this = self.trace.node(node);
        let source = match &this.kind {
            NodeKind::Lookup { source } => Some(*source),
            _ => None,
        };
        let (is_request, is_output) = (this.is_request(), this.is_output());

        if let Some(source) = source {
            if self.with_gradient && self.scaffold.is_resampling(source) {
                if let Some(partial) = self.db.partial(node).cloned() {
                    gradient::accumulate(self.db.partials_mut(), source, partial)?;
                }
            }
            if let Some(value) = self.trace.clear_value(node) {
                self.db.record_value(node, value);
            }
        } else if is_request {
            self.uneval_requests(node)?;
        } else if is_output {
            self.extract_output(node)?;
        }
        Ok(())
    }

    /// The root of an observation is about to lose its value. Count the
    /// density of the choice it constrains and leave that choice free until
    /// regeneration constrains whatever the root then refers to.
    fn release_observation(&mut self, root: NodeId) -> Result<()> {
        let target = self.trace.constrainable_node(root)?;
        if !self.trace.is_constrained(target) {
            return Err(TraceError::Inconsistent(format!(
                "observation at node {} does not constrain node {}",
                root, target
            )));
        }
        // Absorbing choices are counted when they are detached.
        if !self.scaffold.is_absorbing(target) {
            self.weight += self.trace.log_density_excluding(target)?;
        }
        self.trace.set_observed(target, None);
        if !self.scaffold.is_brush(target) {
            self.trace.register_random_choice(target);
        }
        trace!(root = root.0, target = target.0, "Released observation");
        Ok(())
    }

    fn extract_output(&mut self, node: NodeId) -> Result<()> {
        let value = self.trace.value_at(node)?.clone();
        let principal = self.scaffold.is_principal(node);
        self.trace.unregister_random_choice(node);
        self.trace.unincorporate_at(node)?;
        if principal && !self.scaffold.proposal.is_prior() {
            self.weight += self.trace.log_density_at(node, &value)?;
        }
        if self.with_gradient {
            self.pull_simulation_gradient(node, &value, principal)?;
        }
        self.uninstall(node, value);
        Ok(())
    }

    fn pull_simulation_gradient(&mut self, node: NodeId, value: &Value, principal: bool) -> Result<()> {
        let psp = self.trace.output_psp(node)?;
        let args = self.trace.args_at(node)?;
        if principal {
            // The partial of a principal node is complete once its own
            // density is added: every dependent was detached before it.
            let gradient = psp
                .density_gradient()
                .ok_or_else(|| missing_gradient(node, psp.name(), "a log density gradient"))?;
            let (partial, _) = gradient
                .gradient_of_log_density(value, &args)
                .map_err(|err| err.at(node, Some(psp.name())))?;
            return gradient::accumulate(self.db.partials_mut(), node, partial)
                .map_err(|err| err.at(node, Some(psp.name())));
        }
        let Some(direction) = self.db.partial(node).cloned() else {
            return Ok(());
        };
        let gradient = psp
            .simulate_gradient()
            .ok_or_else(|| missing_gradient(node, psp.name(), "a simulation gradient"))?;
        let partials = gradient
            .gradient_of_simulate(&args, value, &direction)
            .map_err(|err| err.at(node, Some(psp.name())))?;
        let parents = args.operand_nodes.iter().chain(args.esr_nodes.iter());
        for (&parent, partial) in parents.zip(partials) {
            if self.scaffold.is_resampling(parent) && !gradient::is_zero(&partial) {
                gradient::accumulate(self.db.partials_mut(), parent, partial)
                    .map_err(|err| err.at(node, Some(psp.name())))?;
            }
        }
        Ok(())
    }

    fn uninstall(&mut self, node: NodeId, value: Value) {
        if let Value::Procedure(made) = &value {
            if made.maker == node {
                self.made.push(node);
            }
        }
        self.trace.clear_value(node);
        self.db.record_value(node, value);
    }

    /// Drop the family edges of a request node, destroying families that
    /// nothing else requests.
    fn uneval_requests(&mut self, node: NodeId) -> Result<()> {
        let NodeKind::Request { output, .. } = self.trace.node(node).kind else {
            return Err(TraceError::Inconsistent(format!(
                "node {} is not a request node",
                node
            )));
        };
        let request = self.trace.node(node).request.clone().unwrap_or_default();
        if !request.is_empty() {
            let maker = self.trace.operator_sp(node)?.maker;
            for esr in request.esrs.iter().rev() {
                let root = self.trace.pop_esr_parent(output)?;
                if self.trace.node(root).num_requests == 0 {
                    self.trace.unregister_family(maker, &esr.id)?;
                    self.db.record_family(maker, esr.id.clone(), root);
                    self.uneval_family(root)?;
                }
            }
        }
        self.trace.set_request(node, None);
        Ok(())
    }

    fn uneval_family(&mut self, node: NodeId) -> Result<()> {
        match self.trace.node(node).kind.clone() {
            NodeKind::Constant => {}
            NodeKind::Lookup { .. } => {
                self.trace.disconnect_lookup(node);
                if let Some(value) = self.trace.clear_value(node) {
                    self.db.record_value(node, value);
                }
            }
            NodeKind::Output { app, request, .. } => {
                let value = self.trace.value_at(node)?.clone();
                self.trace.unregister_random_choice(node);
                self.trace.unincorporate_at(node)?;
                self.uninstall(node, value);
                self.uneval_requests(request)?;
                self.db.record_brush(request);
                for &operand in app.operands.iter().rev() {
                    self.uneval_family(operand)?;
                }
                self.uneval_family(app.operator)?;
            }
            NodeKind::Request { .. } => {
                return Err(TraceError::Inconsistent(format!(
                    "family root {} is a request node",
                    node
                )))
            }
        }
        self.db.record_brush(node);
        Ok(())
    }

    fn teardown_records(&mut self) {
        for maker in std::mem::take(&mut self.made) {
            self.trace.remove_sp_record(maker);
        }
    }
}
