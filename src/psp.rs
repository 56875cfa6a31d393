//! The stochastic procedure contract.
//!
//! A stochastic procedure ([`Sp`]) is a pair of primitive procedures: an
//! optional request PSP that asks the trace for families of sub-nodes and an
//! output PSP that produces the value of the application. Everything beyond
//! simulation is an optional capability, exposed through the accessor
//! methods of [`Psp`] returning trait objects.

use std::{fmt::Debug, sync::Arc};

use rand::RngCore;

use crate::{
    error::{Result, TraceError},
    node::NodeId,
    trace::Trace,
    value::{Env, Value},
};

/// Statistics a procedure accumulates over all of its applications.
///
/// `incorporate` followed by `remove` with the same value and arguments
/// must restore the statistics exactly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SufficientStats(pub Vec<f64>);

impl SufficientStats {
    pub fn zeros(len: usize) -> SufficientStats {
        SufficientStats(vec![0.; len])
    }
}

/// Everything a procedure may look at when it is applied.
#[derive(Debug, Clone)]
pub struct Args {
    /// The request or output node being evaluated.
    pub node: NodeId,
    pub operand_values: Vec<Value>,
    pub operand_nodes: Vec<NodeId>,
    /// Values of the family roots requested for this application, in
    /// request order. Empty for request nodes.
    pub esr_values: Vec<Value>,
    pub esr_nodes: Vec<NodeId>,
    pub env: Env,
    /// Statistics of the applied procedure, if it keeps any.
    pub stats: Option<SufficientStats>,
}

impl Args {
    pub fn len(&self) -> usize {
        self.operand_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operand_values.is_empty()
    }

    pub fn check_arity(&self, expected: usize) -> Result<()> {
        if self.len() != expected {
            return Err(TraceError::arity(expected.to_string(), self.len()));
        }
        Ok(())
    }

    pub fn check_arity_range(&self, min: usize, max: usize) -> Result<()> {
        if self.len() < min || self.len() > max {
            return Err(TraceError::arity(format!("{} to {}", min, max), self.len()));
        }
        Ok(())
    }

    pub fn value(&self, index: usize) -> Result<&Value> {
        self.operand_values
            .get(index)
            .ok_or_else(|| TraceError::arity(format!("at least {}", index + 1), self.len()))
    }

    pub fn number(&self, index: usize) -> Result<f64> {
        self.value(index)?.as_number()
    }

    pub fn numbers(&self) -> Result<Vec<f64>> {
        self.operand_values.iter().map(Value::as_number).collect()
    }

    pub fn stats(&self) -> Result<&SufficientStats> {
        self.stats.as_ref().ok_or_else(|| {
            TraceError::Inconsistent(format!(
                "procedure applied at node {} has no sufficient statistics",
                self.node
            ))
        })
    }
}

pub trait LogDensity {
    /// Log density (or log mass) of `value`. Values outside the support
    /// give negative infinity rather than an error.
    fn log_density(&self, value: &Value, args: &Args) -> Result<f64>;
}

pub trait LogDensityGradient {
    /// Partial derivatives of the log density with respect to the value and
    /// to every operand.
    fn gradient_of_log_density(&self, value: &Value, args: &Args) -> Result<(Value, Vec<Value>)>;
}

pub trait SimulateGradient {
    /// Pulls `direction`, a cotangent of the output, back to the operands
    /// and then to the requested family roots, in that order. `value` is the
    /// output the procedure produced for `args`.
    fn gradient_of_simulate(&self, args: &Args, value: &Value, direction: &Value)
        -> Result<Vec<Value>>;
}

/// A primitive procedure producing the value of an application.
pub trait Psp: Debug + Send + Sync {
    fn name(&self) -> &str;

    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value>;

    fn is_random(&self) -> bool {
        false
    }

    fn incorporate(&self, _value: &Value, _args: &Args, _stats: &mut SufficientStats) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _value: &Value, _args: &Args, _stats: &mut SufficientStats) -> Result<()> {
        Ok(())
    }

    /// Whether a change of `parent` can be absorbed by re-evaluating the
    /// density of the current value instead of resampling it.
    fn can_absorb(&self, _trace: &Trace, _node: NodeId, _parent: NodeId) -> bool {
        self.density().is_some()
    }

    /// Whether the output is just the value of the first requested family
    /// root. Observations of such applications constrain that root.
    fn is_esr_reference(&self) -> bool {
        false
    }

    fn density(&self) -> Option<&dyn LogDensity> {
        None
    }

    fn density_gradient(&self) -> Option<&dyn LogDensityGradient> {
        None
    }

    fn simulate_gradient(&self) -> Option<&dyn SimulateGradient> {
        None
    }
}

/// A request for the family whose root is evaluated from `exp` in `env`.
/// Families are shared between requests with the same `id`.
#[derive(Debug, Clone)]
pub struct Esr {
    pub id: Value,
    pub exp: Value,
    pub env: Env,
}

#[derive(Debug, Clone, Default)]
pub struct Request {
    pub esrs: Vec<Esr>,
}

impl Request {
    pub fn is_empty(&self) -> bool {
        self.esrs.is_empty()
    }
}

/// A primitive procedure producing the requests of an application.
pub trait RequestPsp: Debug + Send + Sync {
    fn simulate_request(&self, args: &Args) -> Result<Request>;

    fn can_absorb(&self, _trace: &Trace, _node: NodeId, _parent: NodeId) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct Sp {
    /// `None` for procedures that never request families.
    pub request: Option<Arc<dyn RequestPsp>>,
    pub output: Arc<dyn Psp>,
    /// Statistics installed for every application site of this procedure.
    pub initial_stats: Option<SufficientStats>,
}

impl Sp {
    pub fn new(output: impl Psp + 'static) -> Sp {
        Sp {
            request: None,
            output: Arc::new(output),
            initial_stats: None,
        }
    }

    pub fn with_request(request: impl RequestPsp + 'static, output: impl Psp + 'static) -> Sp {
        Sp {
            request: Some(Arc::new(request)),
            output: Arc::new(output),
            initial_stats: None,
        }
    }

    pub fn with_stats(mut self, stats: SufficientStats) -> Sp {
        self.initial_stats = Some(stats);
        self
    }

    pub fn name(&self) -> &str {
        self.output.name()
    }

    pub fn makes_esrs(&self) -> bool {
        self.request.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sps::continuous::NormalPsp;
    use pretty_assertions::assert_eq;

    fn args(values: Vec<Value>) -> Args {
        Args {
            node: NodeId(0),
            operand_nodes: Vec::new(),
            operand_values: values,
            esr_values: Vec::new(),
            esr_nodes: Vec::new(),
            env: Env::new(),
            stats: None,
        }
    }

    #[test]
    fn arity_and_operand_access() {
        let args = args(vec![1.0.into(), Value::symbol("x")]);
        assert!(args.check_arity(2).is_ok());
        assert!(matches!(
            args.check_arity(3),
            Err(TraceError::Arity { got: 2, .. })
        ));
        assert!(args.check_arity_range(1, 2).is_ok());
        assert_eq!(args.number(0).unwrap(), 1.0);
        assert!(matches!(
            args.number(1),
            Err(TraceError::TypeMismatch { .. })
        ));
        assert!(args.value(2).is_err());
        assert!(args.stats().is_err());
    }

    #[test]
    fn capabilities_are_discoverable() {
        let sp = Sp::new(NormalPsp);
        assert_eq!(sp.name(), "normal");
        assert!(!sp.makes_esrs());
        assert!(sp.output.is_random());
        assert!(sp.output.density().is_some());
        assert!(sp.output.density_gradient().is_some());
    }
}
