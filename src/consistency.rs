//! Structural checks over a whole trace, used by tests and available to
//! callers that extend the trace with their own procedures.

use std::collections::{BTreeMap, BTreeSet};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{
    error::{Result, TraceError},
    node::{Node, NodeId, NodeKind},
    trace::{Trace, DEFAULT_SCOPE},
    value::Value,
};

fn inconsistent(message: String) -> TraceError {
    TraceError::Inconsistent(message)
}

impl Trace {
    /// Verify the invariants that hold between transitions:
    ///
    /// * every live node has its value (request nodes their request),
    /// * parent and child edges mirror each other,
    /// * no value is stale: lookups hold their source's value, observed
    ///   choices their observation, and deterministic outputs what their
    ///   procedure computes from the current operands,
    /// * request counts match the family edges pointing at each root,
    /// * the random choices are exactly the unobserved random outputs and
    ///   the scope index covers nothing else,
    /// * every observation constrains the choice its root refers to,
    /// * every procedure made in the trace has its record and no record
    ///   outlives its procedure,
    /// * every node is kept alive by a child or a directive.
    pub fn check_consistency(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(inconsistent("trace is inside a transaction".into()));
        }
        let roots: BTreeSet<NodeId> = self.directives.values().map(|d| d.root).collect();
        let mut requests: BTreeMap<NodeId, usize> = BTreeMap::new();
        let mut expected_choices = BTreeSet::new();

        for (index, slot) in self.nodes.iter().enumerate() {
            let Some(node) = slot else { continue };
            let id = NodeId(index);

            match &node.kind {
                NodeKind::Request { .. } => {
                    if node.request.is_none() {
                        return Err(inconsistent(format!("request node {} has no request", id)));
                    }
                }
                _ => {
                    if node.value.is_none() {
                        return Err(inconsistent(format!("node {} has no value", id)));
                    }
                }
            }

            for parent in node.parents() {
                let parent_node = self
                    .get(parent)
                    .ok_or_else(|| inconsistent(format!("node {} has dead parent {}", id, parent)))?;
                if !parent_node.children.contains(&id) {
                    return Err(inconsistent(format!(
                        "node {} is missing from the children of {}",
                        id, parent
                    )));
                }
            }
            for &child in node.children.iter() {
                let child_node = self
                    .get(child)
                    .ok_or_else(|| inconsistent(format!("node {} has dead child {}", id, child)))?;
                if !child_node.parents().contains(&id) {
                    return Err(inconsistent(format!(
                        "node {} lists {} as a child but is not its parent",
                        id, child
                    )));
                }
            }

            self.check_fresh(id, node)?;

            if !node.is_constant() && node.children.is_empty() && !roots.contains(&id) {
                return Err(inconsistent(format!("node {} is unreachable", id)));
            }

            if let NodeKind::Output { esr_parents, .. } = &node.kind {
                for &root in esr_parents {
                    *requests.entry(root).or_default() += 1;
                }
                let psp = self.output_psp(id)?;
                if psp.is_random() && node.observed.is_none() {
                    expected_choices.insert(id);
                }
                if let Some(Value::Procedure(made)) = &node.value {
                    if made.maker == id && self.sp_record(id).is_none() {
                        return Err(inconsistent(format!(
                            "procedure made at node {} has no record",
                            id
                        )));
                    }
                }
            }
        }

        for (index, slot) in self.nodes.iter().enumerate() {
            let Some(node) = slot else { continue };
            let id = NodeId(index);
            let counted = requests.get(&id).copied().unwrap_or(0);
            if node.num_requests != counted {
                return Err(inconsistent(format!(
                    "node {} counts {} requests but {} families point at it",
                    id, node.num_requests, counted
                )));
            }
        }

        if self.random_choices != expected_choices {
            return Err(inconsistent(format!(
                "random choices {:?} differ from unobserved random outputs {:?}",
                self.random_choices, expected_choices
            )));
        }
        let default_scope = Value::symbol(DEFAULT_SCOPE);
        for (scope, blocks) in self.scopes.iter() {
            for (block, nodes) in blocks.iter() {
                if nodes.is_empty() {
                    return Err(inconsistent(format!("empty block {} in scope {}", block, scope)));
                }
                if let Some(&stray) = nodes.iter().find(|n| !self.random_choices.contains(n)) {
                    return Err(inconsistent(format!(
                        "node {} is indexed in scope {} but is not a random choice",
                        stray, scope
                    )));
                }
            }
        }
        for &choice in self.random_choices.iter() {
            let block = Value::Atom(choice.index());
            if !self.block_nodes(&default_scope, &block).contains(&choice) {
                return Err(inconsistent(format!(
                    "random choice {} is missing from the default scope",
                    choice
                )));
            }
        }

        for (&root, observed) in self.observations.iter() {
            let target = self.constrainable_node(root)?;
            if self.node(target).observed.as_ref() != Some(observed) {
                return Err(inconsistent(format!(
                    "observation at node {} does not constrain node {} to {}",
                    root, target, observed
                )));
            }
            if self.value(root) != Some(observed) {
                return Err(inconsistent(format!(
                    "observation at node {} reports {:?} instead of {}",
                    root,
                    self.value(root),
                    observed
                )));
            }
        }

        for (&maker, record) in self.sp_records.iter() {
            let made_here = matches!(
                self.get(maker).and_then(|node| node.value.as_ref()),
                Some(Value::Procedure(sp)) if sp.maker == maker
            );
            if !made_here {
                return Err(inconsistent(format!(
                    "record for node {} outlives its procedure",
                    maker
                )));
            }
            for (id, &root) in record.families.iter() {
                if self.get(root).is_none() {
                    return Err(inconsistent(format!(
                        "family {} of node {} has dead root {}",
                        id, maker, root
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Trace {
    fn check_fresh(&self, id: NodeId, node: &Node) -> Result<()> {
        let Some(value) = &node.value else {
            return Ok(());
        };
        match &node.kind {
            NodeKind::Lookup { source } => {
                if self.value(*source) != Some(value) {
                    return Err(inconsistent(format!(
                        "lookup {} is stale with respect to {}",
                        id, source
                    )));
                }
            }
            NodeKind::Output { .. } => {
                if let Some(observed) = &node.observed {
                    if observed != value {
                        return Err(inconsistent(format!(
                            "observed node {} holds {} instead of {}",
                            id, value, observed
                        )));
                    }
                }
                let psp = self.output_psp(id)?;
                // Made procedures are fresh objects every time they are
                // simulated, so only their record is checked.
                if psp.is_random() || matches!(value, Value::Procedure(_)) {
                    return Ok(());
                }
                // Deterministic procedures never draw from the generator.
                let mut rng = ChaCha8Rng::seed_from_u64(0);
                let expected = psp.simulate(&self.args_at(id)?, &mut rng)?;
                if &expected != value {
                    return Err(inconsistent(format!(
                        "node {} holds {} but `{}` computes {}",
                        id,
                        value,
                        psp.name(),
                        expected
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sexp::read;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn detects_a_broken_edge() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut trace = Trace::new();
        trace.assume("x", &read("(normal 0 1)")?, &mut rng)?;
        trace.predict(&read("(+ x 1)")?, &mut rng)?;
        trace.check_consistency()?;

        let x = trace.global_env().find("x").ok_or(TraceError::UnboundSymbol {
            symbol: "x".into(),
        })?;
        let child = *trace.node(x).children.iter().next().ok_or_else(|| {
            TraceError::Inconsistent("x has no children".into())
        })?;
        trace.remove_child(x, child);
        assert!(trace.check_consistency().is_err());
        Ok(())
    }

    #[test]
    fn detects_a_stale_lookup() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut trace = Trace::new();
        trace.assume("x", &read("(normal 0 1)")?, &mut rng)?;
        let (y, _) = trace.assume("y", &read("x")?, &mut rng)?;
        trace.check_consistency()?;

        let lookup = trace.directive(y)?.root;
        assert!(matches!(trace.node(lookup).kind, NodeKind::Lookup { .. }));
        let stale = Value::Number(trace.value_at(lookup)?.as_number()? + 1.);
        trace.set_value(lookup, stale);
        assert!(matches!(
            trace.check_consistency(),
            Err(TraceError::Inconsistent(message)) if message.contains("stale")
        ));
        Ok(())
    }

    #[test]
    fn detects_a_stale_deterministic_output() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut trace = Trace::new();
        trace.assume("x", &read("(normal 0 1)")?, &mut rng)?;
        let (y, _) = trace.predict(&read("(* x 3)")?, &mut rng)?;
        trace.assume("f", &read("(lambda (a) (+ a 1))")?, &mut rng)?;
        trace.predict(&read("(f x)")?, &mut rng)?;
        trace.check_consistency()?;

        let output = trace.directive(y)?.root;
        trace.set_value(output, Value::Number(0.25));
        assert!(matches!(
            trace.check_consistency(),
            Err(TraceError::Inconsistent(message)) if message.contains("computes")
        ));
        Ok(())
    }

    #[test]
    fn detects_a_drifted_observation() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut trace = Trace::new();
        let (obs, _) = trace.observe(&read("(normal 0 1)")?, Value::Number(0.5), &mut rng)?;
        trace.check_consistency()?;

        let root = trace.directive(obs)?.root;
        trace.set_value(root, Value::Number(0.75));
        assert!(trace.check_consistency().is_err());
        Ok(())
    }

    #[test]
    fn detects_a_stray_random_choice() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut trace = Trace::new();
        trace.assume("x", &read("(normal 0 1)")?, &mut rng)?;
        let x = trace.global_env().find("x").ok_or(TraceError::UnboundSymbol {
            symbol: "x".into(),
        })?;
        trace.unregister_random_choice(x);
        assert!(trace.check_consistency().is_err());
        Ok(())
    }
}
