//! Procedures that make procedures: closures, memoization and a collapsed
//! beta-bernoulli coin.

use std::sync::Arc;

use rand::{Rng, RngCore};

use crate::{
    error::{Result, TraceError},
    node::{NodeId, NodeKind},
    psp::{
        Args, Esr, LogDensity, Psp, Request, RequestPsp, SimulateGradient, Sp, SufficientStats,
    },
    trace::Trace,
    value::{Env, SpRef, Value},
};

/// Output of an application whose value is the root of its first
/// requested family.
#[derive(Debug, Clone, Copy)]
pub struct EsrRefOutputPsp;

impl Psp for EsrRefOutputPsp {
    fn name(&self) -> &str {
        "compound"
    }

    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value> {
        args.esr_values.first().cloned().ok_or_else(|| {
            TraceError::Inconsistent(format!("application {} has no requested family", args.node))
        })
    }

    /// Operand changes reach the family through its own lookups. Only a
    /// new family root or a new request changes the value.
    fn can_absorb(&self, trace: &Trace, node: NodeId, parent: NodeId) -> bool {
        let this = trace.node(node);
        let from_request = matches!(this.kind, NodeKind::Output { request, .. } if request == parent);
        !from_request && this.esr_parents().first() != Some(&parent)
    }

    fn is_esr_reference(&self) -> bool {
        true
    }

    fn density(&self) -> Option<&dyn LogDensity> {
        Some(self)
    }

    fn simulate_gradient(&self) -> Option<&dyn SimulateGradient> {
        Some(self)
    }
}

impl LogDensity for EsrRefOutputPsp {
    fn log_density(&self, value: &Value, args: &Args) -> Result<f64> {
        Ok(match args.esr_values.first() {
            Some(root) if root == value => 0.,
            _ => f64::NEG_INFINITY,
        })
    }
}

impl SimulateGradient for EsrRefOutputPsp {
    fn gradient_of_simulate(
        &self,
        args: &Args,
        _value: &Value,
        direction: &Value,
    ) -> Result<Vec<Value>> {
        let mut partials = vec![Value::Nil; args.operand_nodes.len() + args.esr_nodes.len()];
        if let Some(root) = partials.get_mut(args.operand_nodes.len()) {
            *root = direction.clone();
        }
        Ok(partials)
    }
}

/// `(make_csp (quote params) (quote body))`, the procedure behind `lambda`.
#[derive(Debug, Clone, Copy)]
pub struct MakeCspPsp;

impl Psp for MakeCspPsp {
    fn name(&self) -> &str {
        "make_csp"
    }

    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value> {
        args.check_arity(2)?;
        let params = args
            .value(0)?
            .to_vec()?
            .iter()
            .map(|param| param.as_symbol().map(Arc::from))
            .collect::<Result<Vec<Arc<str>>>>()?;
        let request = CspRequestPsp {
            params,
            body: args.value(1)?.clone(),
            env: args.env.clone(),
        };
        Ok(Value::Procedure(SpRef::new(
            args.node,
            Sp::with_request(request, EsrRefOutputPsp),
        )))
    }
}

/// Requests one family per application: the body evaluated with the
/// parameters bound to the operand nodes.
#[derive(Debug, Clone)]
pub struct CspRequestPsp {
    params: Vec<Arc<str>>,
    body: Value,
    env: Env,
}

impl RequestPsp for CspRequestPsp {
    fn simulate_request(&self, args: &Args) -> Result<Request> {
        args.check_arity(self.params.len())?;
        let env = self.env.extend(
            self.params
                .iter()
                .cloned()
                .zip(args.operand_nodes.iter().copied()),
        );
        Ok(Request {
            esrs: vec![Esr {
                id: Value::Atom(args.node.index()),
                exp: self.body.clone(),
                env,
            }],
        })
    }

    fn can_absorb(&self, _trace: &Trace, _node: NodeId, _parent: NodeId) -> bool {
        true
    }
}

const MEMOIZED: &str = "memoized-sp";

/// `(mem f)` returns a procedure that shares one family between all
/// applications with equal arguments.
#[derive(Debug, Clone, Copy)]
pub struct MemPsp;

impl Psp for MemPsp {
    fn name(&self) -> &str {
        "mem"
    }

    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value> {
        args.check_arity(1)?;
        args.value(0)?.as_procedure()?;
        let request = MemRequestPsp {
            procedure: args.operand_nodes[0],
        };
        Ok(Value::Procedure(SpRef::new(
            args.node,
            Sp::with_request(request, EsrRefOutputPsp),
        )))
    }
}

#[derive(Debug, Clone)]
pub struct MemRequestPsp {
    /// The node holding the memoized procedure.
    procedure: NodeId,
}

impl RequestPsp for MemRequestPsp {
    fn simulate_request(&self, args: &Args) -> Result<Request> {
        let quote = |value: &Value| Value::list(vec![Value::symbol("quote"), value.clone()]);
        let mut exp = vec![Value::symbol(MEMOIZED)];
        exp.extend(args.operand_values.iter().map(quote));
        Ok(Request {
            esrs: vec![Esr {
                id: Value::list(args.operand_values.clone()),
                exp: Value::list(exp),
                env: Env::new().extend([(Arc::from(MEMOIZED), self.procedure)]),
            }],
        })
    }
}

/// `(make_beta_bernoulli a b)` makes a coin whose weight is integrated
/// out. Its applications are exchangeable and keep heads and tails counts.
#[derive(Debug, Clone, Copy)]
pub struct MakeBetaBernoulliPsp;

impl Psp for MakeBetaBernoulliPsp {
    fn name(&self) -> &str {
        "make_beta_bernoulli"
    }

    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value> {
        args.check_arity(2)?;
        let (alpha, beta) = (args.number(0)?, args.number(1)?);
        if !(alpha > 0. && beta > 0.) {
            return Err(TraceError::domain(format!(
                "beta-bernoulli pseudo-counts must be positive, got {} and {}",
                alpha, beta
            )));
        }
        let sp = Sp::new(BetaBernoulliPsp { alpha, beta }).with_stats(SufficientStats::zeros(2));
        Ok(Value::Procedure(SpRef::new(args.node, sp)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BetaBernoulliPsp {
    alpha: f64,
    beta: f64,
}

impl BetaBernoulliPsp {
    /// Predictive probability of heads given the incorporated flips.
    fn heads_probability(&self, args: &Args) -> Result<f64> {
        args.check_arity(0)?;
        let stats = args.stats()?;
        let (heads, tails) = (stats.0[0], stats.0[1]);
        Ok((self.alpha + heads) / (self.alpha + self.beta + heads + tails))
    }

    fn count(value: &Value, stats: &mut SufficientStats, delta: f64) -> Result<()> {
        let slot = if value.as_bool()? { 0 } else { 1 };
        stats.0[slot] += delta;
        if stats.0[slot] < 0. {
            return Err(TraceError::Inconsistent(
                "removed a flip that was never incorporated".into(),
            ));
        }
        Ok(())
    }
}

impl Psp for BetaBernoulliPsp {
    fn name(&self) -> &str {
        "beta_bernoulli"
    }

    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value> {
        Ok(Value::Bool(rng.random_bool(self.heads_probability(args)?)))
    }

    fn is_random(&self) -> bool {
        true
    }

    fn incorporate(&self, value: &Value, _args: &Args, stats: &mut SufficientStats) -> Result<()> {
        BetaBernoulliPsp::count(value, stats, 1.)
    }

    fn remove(&self, value: &Value, _args: &Args, stats: &mut SufficientStats) -> Result<()> {
        BetaBernoulliPsp::count(value, stats, -1.)
    }

    fn density(&self) -> Option<&dyn LogDensity> {
        Some(self)
    }
}

impl LogDensity for BetaBernoulliPsp {
    fn log_density(&self, value: &Value, args: &Args) -> Result<f64> {
        let p = self.heads_probability(args)?;
        Ok(if value.as_bool()? { p.ln() } else { (1. - p).ln() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sexp::read, sps::test_args};
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn closures_apply_their_body() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let mut trace = Trace::new();
        trace.assume("double", &read("(lambda (x) (* 2 x))")?, &mut rng)?;
        let (_, y) = trace.predict(&read("(double 21)")?, &mut rng)?;
        assert_eq!(y, Value::Number(42.));
        assert!(matches!(
            trace.predict(&read("(double 1 2)")?, &mut rng),
            Err(TraceError::Arity { .. })
        ));
        trace.check_consistency()?;
        Ok(())
    }

    #[test]
    fn closures_capture_their_environment() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let mut trace = Trace::new();
        trace.assume("adder", &read("(lambda (a) (lambda (b) (+ a b)))")?, &mut rng)?;
        trace.assume("add3", &read("(adder 3)")?, &mut rng)?;
        let (_, y) = trace.predict(&read("(add3 4)")?, &mut rng)?;
        assert_eq!(y, Value::Number(7.));
        Ok(())
    }

    #[test]
    fn esr_reference_gradient_goes_to_the_root() -> Result<()> {
        let mut args = test_args(vec![Value::Number(1.)]);
        args.esr_nodes = vec![NodeId(7)];
        args.esr_values = vec![Value::Number(3.)];
        let partials =
            EsrRefOutputPsp.gradient_of_simulate(&args, &Value::Number(3.), &Value::Number(0.5))?;
        assert_eq!(partials, vec![Value::Nil, Value::Number(0.5)]);
        assert_eq!(EsrRefOutputPsp.log_density(&Value::Number(3.), &args)?, 0.);
        Ok(())
    }

    #[test]
    fn mem_families_are_keyed_by_arguments() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let mut trace = Trace::new();
        trace.assume("f", &read("(mem (lambda (i) (normal 0 1)))")?, &mut rng)?;
        let (_, a) = trace.predict(&read("(f 1)")?, &mut rng)?;
        let (_, b) = trace.predict(&read("(f 1)")?, &mut rng)?;
        let (_, c) = trace.predict(&read("(f 2)")?, &mut rng)?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(trace.num_random_choices(), 2);
        trace.check_consistency()?;
        Ok(())
    }

    #[test]
    fn beta_bernoulli_counts_flips() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let mut trace = Trace::new();
        trace.assume("coin", &read("(make_beta_bernoulli 1 1)")?, &mut rng)?;
        for _ in 0..3 {
            trace.observe(&read("(coin)")?, Value::Bool(true), &mut rng)?;
        }
        let coin = trace.global_env().find("coin").ok_or(TraceError::UnboundSymbol {
            symbol: "coin".into(),
        })?;
        let stats = trace
            .sp_record(coin)
            .and_then(|record| record.stats.clone())
            .ok_or_else(|| TraceError::Inconsistent("coin has no statistics".into()))?;
        assert_eq!(stats, SufficientStats(vec![3., 0.]));

        // Laplace's rule of succession after three heads.
        let (_, weight) = trace.observe(&read("(coin)")?, Value::Bool(true), &mut rng)?;
        assert_abs_diff_eq!(weight, (4f64 / 5.).ln(), epsilon = 1e-12);
        trace.check_consistency()?;
        Ok(())
    }

    #[test]
    fn beta_bernoulli_removal_restores_counts() -> Result<()> {
        let psp = BetaBernoulliPsp {
            alpha: 1.,
            beta: 1.,
        };
        let args = test_args(Vec::new());
        let mut stats = SufficientStats::zeros(2);
        psp.incorporate(&Value::Bool(false), &args, &mut stats)?;
        psp.incorporate(&Value::Bool(true), &args, &mut stats)?;
        psp.remove(&Value::Bool(false), &args, &mut stats)?;
        assert_eq!(stats, SufficientStats(vec![1., 0.]));
        assert!(psp.remove(&Value::Bool(false), &args, &mut stats).is_err());
        Ok(())
    }
}
