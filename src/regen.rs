//! Regeneration: evaluating new families and re-simulating the resampled
//! part of a scaffold, parents first.

use std::collections::BTreeSet;

use rand::RngCore;
use tracing::trace;

use crate::{
    error::{Result, Site, TraceError},
    node::{NodeId, NodeKind},
    omegadb::OmegaDb,
    psp::Request,
    scaffold::{PrincipalProposal, Scaffold},
    trace::Trace,
    value::{Env, SpRef, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegenMode {
    /// Simulate or propose new values.
    Fresh,
    /// Put back the values and families recorded by detach.
    Restore,
}

/// Terms of the acceptance ratio collected while regenerating.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RegenWeights {
    /// Log density of absorbing nodes, and of principal nodes unless they
    /// were drawn from the prior.
    pub new_log_density: f64,
    pub forward_proposal: f64,
    pub reverse_proposal: f64,
}

pub(crate) fn regen_and_attach(
    trace: &mut Trace,
    scaffold: &Scaffold,
    mode: RegenMode,
    db: &OmegaDb,
    rng: &mut dyn RngCore,
) -> Result<RegenWeights> {
    let mut regen = Regen {
        trace,
        scaffold,
        db,
        mode,
        rng,
        done: BTreeSet::new(),
        weights: RegenWeights::default(),
    };
    for &node in scaffold.order.iter() {
        if scaffold.is_absorbing(node) {
            regen.attach(node)?;
        } else {
            regen.regen_node(node)?;
        }
    }
    trace!(
        new_log_density = regen.weights.new_log_density,
        forward_proposal = regen.weights.forward_proposal,
        ?mode,
        "Regenerated scaffold"
    );
    Ok(regen.weights)
}

/// Evaluate a top level expression into a new family.
pub(crate) fn eval_expression(
    trace: &mut Trace,
    exp: &Value,
    env: &Env,
    rng: &mut dyn RngCore,
) -> Result<NodeId> {
    let scaffold = Scaffold::default();
    let db = OmegaDb::default();
    let mut regen = Regen {
        trace,
        scaffold: &scaffold,
        db: &db,
        mode: RegenMode::Fresh,
        rng,
        done: BTreeSet::new(),
        weights: RegenWeights::default(),
    };
    regen.eval_family(exp, env, &[])
}

struct Regen<'a> {
    trace: &'a mut Trace,
    scaffold: &'a Scaffold,
    db: &'a OmegaDb,
    mode: RegenMode,
    rng: &'a mut dyn RngCore,
    done: BTreeSet<NodeId>,
    weights: RegenWeights,
}

impl Regen<'_> {
    fn attach(&mut self, node: NodeId) -> Result<()> {
        self.done.insert(node);
        for parent in self.trace.node(node).parents() {
            self.regen_node(parent)?;
        }
        if !self.trace.node(node).is_output() {
            return Ok(());
        }
        let value = self.trace.value_at(node)?.clone();
        self.weights.new_log_density += self.trace.log_density_at(node, &value)?;
        self.trace.incorporate_at(node)
    }

    /// Bring a node up to date if it belongs to the resampled part of the
    /// scaffold and has not been regenerated yet in this pass.
    fn regen_node(&mut self, node: NodeId) -> Result<()> {
        if !self.scaffold.is_resampling(node) || !self.done.insert(node) {
            return Ok(());
        }
        for parent in self.trace.node(node).parents() {
            self.regen_node(parent)?;
        }
        let restore = self.mode == RegenMode::Restore;
        let this = self.trace.node(node);
        let (source, is_request, is_output) = match &this.kind {
            NodeKind::Lookup { source } => (Some(*source), false, false),
            _ => (None, this.is_request(), this.is_output()),
        };
        if let Some(source) = source {
            let value = self.trace.value_at(source)?.clone();
            self.trace.set_value(node, value);
        } else if is_request {
            self.apply_request(node, restore)?;
        } else if is_output {
            self.apply_output(node, restore)?;
        }
        if let Some(observed) = self.trace.observation(node).cloned() {
            self.constrain_observation(node, observed)?;
        }
        Ok(())
    }

    /// Constrain the choice a regenerated observation root now refers to,
    /// moving it to the observed value when it holds another one.
    fn constrain_observation(&mut self, root: NodeId, observed: Value) -> Result<()> {
        let target = self.trace.constrainable_node(root)?;
        self.trace.check_constrainable(target)?;
        let cannot_constrain = |message: &str| TraceError::CannotConstrain {
            site: Site::node(target),
            message: message.into(),
        };
        if self.scaffold.is_resampling(target) {
            return Err(cannot_constrain("observed choice is resampled by the same proposal"));
        }
        let moved = self.trace.value_at(target)? != &observed;
        if self.scaffold.is_absorbing(target) {
            // Attaching counted its density already.
            if moved {
                return Err(cannot_constrain("observed choice absorbed another value"));
            }
        } else {
            self.trace.unincorporate_at(target)?;
            self.trace.set_value(target, observed.clone());
            self.weights.new_log_density += self.trace.log_density_at(target, &observed)?;
            self.trace.incorporate_at(target)?;
        }
        if moved {
            self.propagate_value(target)?;
        }
        self.trace.unregister_random_choice(target);
        self.trace.set_observed(target, Some(observed));
        trace!(root = root.0, target = target.0, moved, "Constrained observation");
        Ok(())
    }

    /// Bring the deterministic dependents of a node whose value was just
    /// replaced up to date. Dependents the scaffold has yet to reach are
    /// left to it.
    fn propagate_value(&mut self, node: NodeId) -> Result<()> {
        let children: Vec<NodeId> = self.trace.node(node).children.iter().copied().collect();
        for child in children {
            let in_scaffold = self.scaffold.is_resampling(child) || self.scaffold.is_absorbing(child);
            if in_scaffold && !self.done.contains(&child) {
                continue;
            }
            let downstream = |message: &str| TraceError::CannotConstrain {
                site: Site::node(child),
                message: message.into(),
            };
            let this = self.trace.node(child);
            let (is_lookup, is_request, is_output) =
                (this.is_lookup(), this.is_request(), this.is_output());
            if is_lookup {
                let value = self.trace.value_at(node)?.clone();
                self.trace.set_value(child, value);
            } else if is_output {
                let psp = self.trace.output_psp(child)?;
                if psp.is_random() {
                    return Err(downstream(
                        "random choice depends on an observed choice that moved",
                    ));
                }
                let args = self.trace.args_at(child)?;
                let value = psp
                    .simulate(&args, self.rng)
                    .map_err(|err| err.at(child, Some(psp.name())))?;
                self.trace.set_value(child, value);
            } else {
                if is_request && self.trace.operator_sp(child)?.sp.request.is_some() {
                    return Err(downstream("requests depend on an observed choice that moved"));
                }
                continue;
            }
            self.propagate_value(child)?;
        }
        Ok(())
    }

    fn apply_request(&mut self, node: NodeId, restore: bool) -> Result<()> {
        let sp = self.trace.operator_sp(node)?;
        let request = match &sp.sp.request {
            None => Request::default(),
            Some(psp) => {
                let args = self.trace.args_at(node)?;
                psp.simulate_request(&args)
                    .map_err(|err| err.at(node, Some(sp.sp.name())))?
            }
        };
        self.trace.set_request(node, Some(request.clone()));
        self.eval_requests(node, &sp, request, restore)
    }

    fn eval_requests(
        &mut self,
        node: NodeId,
        sp: &SpRef,
        request: Request,
        restore: bool,
    ) -> Result<()> {
        let NodeKind::Request { output, .. } = self.trace.node(node).kind else {
            return Err(TraceError::Inconsistent(format!(
                "node {} is not a request node",
                node
            )));
        };
        let tags = self.trace.node(node).tags.clone();
        for esr in request.esrs {
            let root = match self.trace.family(sp.maker, &esr.id) {
                Some(root) => {
                    self.regen_node(root)?;
                    root
                }
                None => {
                    let root = match self.db.family(sp.maker, &esr.id) {
                        Some(root) if restore => {
                            self.restore_family(root)?;
                            root
                        }
                        _ => self.eval_family(&esr.exp, &esr.env, &tags)?,
                    };
                    self.trace.register_family(sp.maker, esr.id, root)?;
                    root
                }
            };
            self.trace.add_esr_edge(root, output);
        }
        Ok(())
    }

    fn apply_output(&mut self, node: NodeId, restore: bool) -> Result<()> {
        let sp = self.trace.operator_sp(node)?;
        let psp = sp.sp.output.clone();
        let name = psp.name();
        let args = self.trace.args_at(node)?;
        let (scaffold, db) = (self.scaffold, self.db);
        let old = db.value(node);
        let proposed = !restore && scaffold.is_principal(node);

        let value = if restore {
            old.cloned().ok_or_else(|| {
                TraceError::Inconsistent(format!("no recorded value for node {}", node))
            })?
        } else if proposed {
            match &scaffold.proposal {
                PrincipalProposal::Prior => psp.simulate(&args, self.rng),
                PrincipalProposal::Kernel(kernel) => {
                    let old = old.ok_or_else(|| {
                        TraceError::Inconsistent(format!("no recorded value for node {}", node))
                    })?;
                    kernel.propose(old, &args, self.rng).and_then(|proposal| {
                        if !proposal.forward.is_finite() {
                            return Err(TraceError::numerical(
                                "forward proposal density",
                                proposal.forward,
                            ));
                        }
                        if !proposal.reverse.is_finite() {
                            return Err(TraceError::numerical(
                                "reverse proposal density",
                                proposal.reverse,
                            ));
                        }
                        self.weights.forward_proposal += proposal.forward;
                        self.weights.reverse_proposal += proposal.reverse;
                        Ok(proposal.value)
                    })
                }
                PrincipalProposal::Fixed(values) => values.get(&node).cloned().ok_or_else(|| {
                    TraceError::Inconsistent(format!("no fixed value for node {}", node))
                }),
            }
            .map_err(|err| err.at(node, Some(name)))?
        } else {
            psp.simulate(&args, self.rng)
                .map_err(|err| err.at(node, Some(name)))?
        };

        self.trace.set_value(node, value.clone());
        if proposed && !scaffold.proposal.is_prior() {
            self.weights.new_log_density += self.trace.log_density_at(node, &value)?;
        }
        self.trace.incorporate_at(node)?;
        if let Value::Procedure(made) = &value {
            if made.maker == node && self.trace.sp_record(node).is_none() {
                self.trace
                    .install_sp_record(node, made.sp.initial_stats.clone());
            }
        }
        if psp.is_random() && !self.trace.is_constrained(node) {
            self.trace.register_random_choice(node);
        }
        Ok(())
    }

    /// Reattach a family destroyed by detach, with its recorded values.
    fn restore_family(&mut self, node: NodeId) -> Result<()> {
        match self.trace.node(node).kind.clone() {
            NodeKind::Constant => Ok(()),
            NodeKind::Lookup { source } => {
                self.regen_node(source)?;
                let value = self.trace.value_at(source)?.clone();
                self.trace.set_value(node, value);
                self.trace.reconnect_lookup(node);
                Ok(())
            }
            NodeKind::Output { app, request, .. } => {
                self.restore_family(app.operator)?;
                for &operand in app.operands.iter() {
                    self.restore_family(operand)?;
                }
                self.apply_request(request, true)?;
                self.apply_output(node, true)
            }
            NodeKind::Request { .. } => Err(TraceError::Inconsistent(format!(
                "family root {} is a request node",
                node
            ))),
        }
    }

    fn eval_family(&mut self, exp: &Value, env: &Env, tags: &[(Value, Value)]) -> Result<NodeId> {
        match exp {
            Value::Symbol(name) => {
                let source = env.find(name).ok_or_else(|| TraceError::UnboundSymbol {
                    symbol: name.to_string(),
                })?;
                self.regen_node(source)?;
                Ok(self.trace.create_lookup(source))
            }
            Value::Nil => Err(TraceError::MalformedExpression {
                message: "empty application".into(),
            }),
            Value::Pair(..) => {
                let items = exp.to_vec().map_err(|_| TraceError::MalformedExpression {
                    message: format!("improper list {}", exp),
                })?;
                self.eval_compound(&items, env, tags)
            }
            literal => Ok(self.trace.create_constant(literal.clone())),
        }
    }

    fn eval_compound(
        &mut self,
        items: &[Value],
        env: &Env,
        tags: &[(Value, Value)],
    ) -> Result<NodeId> {
        let keyword = match &items[0] {
            Value::Symbol(name) if env.find(name).is_none() => Some(&**name),
            _ => None,
        };
        match keyword {
            Some("quote") => {
                check_form("quote", items, 2)?;
                Ok(self.trace.create_constant(items[1].clone()))
            }
            Some("lambda") => {
                check_form("lambda", items, 3)?;
                self.eval_family(&desugar_lambda(&items[1], &items[2]), env, tags)
            }
            Some("if") => {
                check_form("if", items, 4)?;
                let exp = Value::list(vec![Value::list(vec![
                    Value::symbol("biplex"),
                    items[1].clone(),
                    desugar_lambda(&Value::Nil, &items[2]),
                    desugar_lambda(&Value::Nil, &items[3]),
                ])]);
                self.eval_family(&exp, env, tags)
            }
            Some("let") => {
                check_form("let", items, 3)?;
                let mut params = Vec::new();
                let mut operands = Vec::new();
                for binding in items[1].to_vec()? {
                    match binding.to_vec()?.as_slice() {
                        [name @ Value::Symbol(_), exp] => {
                            params.push(name.clone());
                            operands.push(exp.clone());
                        }
                        _ => {
                            return Err(TraceError::MalformedExpression {
                                message: format!("bad let binding {}", binding),
                            })
                        }
                    }
                }
                let mut exp = vec![desugar_lambda(&Value::list(params), &items[2])];
                exp.extend(operands);
                self.eval_family(&Value::list(exp), env, tags)
            }
            Some("scope_include") => {
                check_form("scope_include", items, 4)?;
                let scope = self.static_value(&items[1], env)?;
                let block = self.static_value(&items[2], env)?;
                let mut tags = tags.to_vec();
                tags.push((scope, block));
                self.eval_family(&items[3], env, &tags)
            }
            _ => {
                let operator = self.eval_family(&items[0], env, tags)?;
                let operands = items[1..]
                    .iter()
                    .map(|operand| self.eval_family(operand, env, tags))
                    .collect::<Result<Vec<_>>>()?;
                let (request, output) = self.trace.create_application_nodes(
                    operator,
                    operands,
                    env.clone(),
                    tags.to_vec(),
                );
                self.apply_request(request, false)?;
                self.apply_output(output, false)?;
                Ok(output)
            }
        }
    }

    /// Scope and block names: literals, quotations or the current value of
    /// a variable.
    fn static_value(&mut self, exp: &Value, env: &Env) -> Result<Value> {
        match exp {
            Value::Symbol(name) => {
                let node = env.find(name).ok_or_else(|| TraceError::UnboundSymbol {
                    symbol: name.to_string(),
                })?;
                self.regen_node(node)?;
                Ok(self.trace.value_at(node)?.clone())
            }
            Value::Pair(..) => match exp.to_vec()?.as_slice() {
                [Value::Symbol(quote), quoted] if &**quote == "quote" => Ok(quoted.clone()),
                _ => Err(TraceError::MalformedExpression {
                    message: format!(
                        "scope or block must be a literal, quotation or variable, got {}",
                        exp
                    ),
                }),
            },
            literal => Ok(literal.clone()),
        }
    }
}

fn check_form(keyword: &str, items: &[Value], len: usize) -> Result<()> {
    if items.len() != len {
        return Err(TraceError::MalformedExpression {
            message: format!(
                "`{}` takes {} subexpressions, got {}",
                keyword,
                len - 1,
                items.len() - 1
            ),
        });
    }
    Ok(())
}

fn desugar_lambda(params: &Value, body: &Value) -> Value {
    let quote = |exp: &Value| Value::list(vec![Value::symbol("quote"), exp.clone()]);
    Value::list(vec![Value::symbol("make_csp"), quote(params), quote(body)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sexp::read;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn predict(trace: &mut Trace, text: &str) -> Result<Value> {
        let mut rng = StdRng::seed_from_u64(11);
        Ok(trace.predict(&read(text)?, &mut rng)?.1)
    }

    #[test]
    fn special_forms() -> Result<()> {
        let mut trace = Trace::new();
        assert_eq!(predict(&mut trace, "(quote (a b))")?, read("(a b)")?);
        assert_eq!(predict(&mut trace, "((lambda (x y) (- x y)) 5 3)")?, Value::Number(2.));
        assert_eq!(predict(&mut trace, "(if (< 1 2) 10 20)")?, Value::Number(10.));
        assert_eq!(predict(&mut trace, "(let ((a 2) (b 3)) (* a b))")?, Value::Number(6.));
        assert_eq!(predict(&mut trace, "(scope_include 's 0 (+ 1 1))")?, Value::Number(2.));
        trace.check_consistency()?;
        Ok(())
    }

    #[test]
    fn malformed_expressions_are_rejected() -> Result<()> {
        let mut trace = Trace::new();
        for text in ["()", "(if 1 2)", "(let ((1 2)) 3)", "(scope_include (+ 1 2) 0 1)"] {
            let err = predict(&mut trace, text).unwrap_err();
            assert!(
                matches!(err, TraceError::MalformedExpression { .. }),
                "{} gave {:?}",
                text,
                err
            );
        }
        assert!(matches!(
            predict(&mut trace, "(1 2)").unwrap_err(),
            TraceError::NotAProcedure { .. }
        ));
        Ok(())
    }

    #[test]
    fn recursion_through_the_global_environment() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let mut trace = Trace::new();
        trace.assume(
            "fact",
            &read("(lambda (n) (if (< n 1) 1 (* n (fact (- n 1)))))")?,
            &mut rng,
        )?;
        assert_eq!(predict(&mut trace, "(fact 5)")?, Value::Number(120.));
        trace.check_consistency()?;
        Ok(())
    }

    #[test]
    fn shadowed_keywords_are_applications() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let mut trace = Trace::new();
        trace.assume("quote", &read("(lambda (x) (+ x 1))")?, &mut rng)?;
        assert_eq!(predict(&mut trace, "(quote 1)")?, Value::Number(2.));
        Ok(())
    }

    #[test]
    fn mem_shares_families() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let mut trace = Trace::new();
        trace.assume("f", &read("(mem (lambda (i) (normal 0 1)))")?, &mut rng)?;
        let a = predict(&mut trace, "(f 1)")?;
        let b = predict(&mut trace, "(f 1)")?;
        let c = predict(&mut trace, "(f 2)")?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(trace.num_random_choices(), 2);
        trace.check_consistency()?;
        Ok(())
    }
}
