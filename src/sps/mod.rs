//! The built-in procedures bound in the global environment of
//! [`Trace::new`](crate::Trace::new).

pub mod compound;
pub mod continuous;
pub mod deterministic;
pub mod discrete;

use compound::{MakeBetaBernoulliPsp, MakeCspPsp, MemPsp};
use continuous::{BetaPsp, GammaPsp, NormalPsp, UniformContinuousPsp};
use deterministic::{
    Arithmetic, ArithmeticPsp, BiplexPsp, ComparePsp, Comparison, IdentityPsp, ListPsp, LookupPsp,
    NotPsp, VectorPsp,
};
use discrete::{BernoulliPsp, CategoricalPsp, FlipPsp};

use crate::{
    error::{Result, TraceError},
    psp::Sp,
};

/// Parameters outside a distribution's domain put no mass on any value.
/// `None` tells a log density to return negative infinity; arity and type
/// errors still propagate.
pub(crate) fn in_domain<T>(params: Result<T>) -> Result<Option<T>> {
    match params {
        Ok(params) => Ok(Some(params)),
        Err(TraceError::Domain { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

pub(crate) fn builtins() -> Vec<(&'static str, Sp)> {
    vec![
        ("normal", Sp::new(NormalPsp)),
        ("uniform_continuous", Sp::new(UniformContinuousPsp)),
        ("gamma", Sp::new(GammaPsp)),
        ("beta", Sp::new(BetaPsp)),
        ("flip", Sp::new(FlipPsp)),
        ("bernoulli", Sp::new(BernoulliPsp)),
        ("categorical", Sp::new(CategoricalPsp)),
        ("+", Sp::new(ArithmeticPsp(Arithmetic::Add))),
        ("-", Sp::new(ArithmeticPsp(Arithmetic::Sub))),
        ("*", Sp::new(ArithmeticPsp(Arithmetic::Mul))),
        ("/", Sp::new(ArithmeticPsp(Arithmetic::Div))),
        ("exp", Sp::new(ArithmeticPsp(Arithmetic::Exp))),
        ("log", Sp::new(ArithmeticPsp(Arithmetic::Log))),
        ("<", Sp::new(ComparePsp(Comparison::Less))),
        (">", Sp::new(ComparePsp(Comparison::Greater))),
        ("<=", Sp::new(ComparePsp(Comparison::LessEq))),
        (">=", Sp::new(ComparePsp(Comparison::GreaterEq))),
        ("=", Sp::new(ComparePsp(Comparison::Equal))),
        ("not", Sp::new(NotPsp)),
        ("vector", Sp::new(VectorPsp)),
        ("lookup", Sp::new(LookupPsp)),
        ("list", Sp::new(ListPsp)),
        ("identity", Sp::new(IdentityPsp)),
        ("biplex", Sp::new(BiplexPsp)),
        ("make_csp", Sp::new(MakeCspPsp)),
        ("mem", Sp::new(MemPsp)),
        ("make_beta_bernoulli", Sp::new(MakeBetaBernoulliPsp)),
    ]
}

#[cfg(test)]
pub(crate) fn test_args(operand_values: Vec<crate::value::Value>) -> crate::psp::Args {
    use crate::{node::NodeId, value::Env};

    crate::psp::Args {
        node: NodeId(0),
        operand_nodes: (0..operand_values.len()).map(|i| NodeId(i + 1)).collect(),
        operand_values,
        esr_values: Vec::new(),
        esr_nodes: Vec::new(),
        env: Env::new(),
        stats: None,
    }
}
