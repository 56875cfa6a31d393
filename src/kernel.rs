//! Transition kernels and proposal kernels for principal nodes.

use std::{fmt::Debug, sync::Arc};

use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};

use crate::{
    error::{Result, TraceError},
    psp::Args,
    value::Value,
};

/// A proposed value for a principal node with the log densities of
/// proposing it and of proposing the old value back.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub value: Value,
    pub forward: f64,
    pub reverse: f64,
}

/// User supplied proposal for principal nodes.
pub trait ProposalKernel: Debug + Send + Sync {
    fn propose(&self, old: &Value, args: &Args, rng: &mut dyn RngCore) -> Result<Proposal>;
}

/// Symmetric Gaussian random walk on numbers and vectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianDrift {
    pub scale: f64,
}

impl ProposalKernel for GaussianDrift {
    fn propose(&self, old: &Value, _args: &Args, rng: &mut dyn RngCore) -> Result<Proposal> {
        if !(self.scale > 0.) {
            return Err(TraceError::domain("drift scale must be positive"));
        }
        let mut step = || {
            let z: f64 = StandardNormal.sample(rng);
            self.scale * z
        };
        let value = match old {
            Value::Number(x) => Value::Number(x + step()),
            Value::Vector(x) => Value::vector(x.iter().map(|x| x + step()).collect()),
            other => {
                return Err(TraceError::type_mismatch(
                    "number or vector",
                    other.type_name(),
                ))
            }
        };
        Ok(Proposal {
            value,
            forward: 0.,
            reverse: 0.,
        })
    }
}

/// How a transition proposes new values.
#[derive(Debug, Clone, Default)]
pub enum TransitionKernel {
    /// Redraw principal nodes from their own distribution.
    #[default]
    Resimulation,
    Drift {
        scale: f64,
    },
    Custom(Arc<dyn ProposalKernel>),
    /// Leapfrog integration over the principal values using gradients of
    /// the scaffold's log density.
    Hamiltonian {
        step_size: f64,
        num_steps: usize,
    },
    /// Draw `particles` fresh states of the scaffold from the prior and
    /// propose one of them in proportion to its weight.
    ParticleGibbs {
        particles: usize,
    },
}

impl TransitionKernel {
    pub fn drift(scale: f64) -> TransitionKernel {
        TransitionKernel::Drift { scale }
    }

    pub fn hamiltonian(step_size: f64, num_steps: usize) -> TransitionKernel {
        TransitionKernel::Hamiltonian {
            step_size,
            num_steps,
        }
    }

    pub fn particle_gibbs(particles: usize) -> TransitionKernel {
        TransitionKernel::ParticleGibbs { particles }
    }

    pub fn needs_gradient(&self) -> bool {
        matches!(self, TransitionKernel::Hamiltonian { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{node::NodeId, value::Env};
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn no_args() -> Args {
        Args {
            node: NodeId(0),
            operand_values: Vec::new(),
            operand_nodes: Vec::new(),
            esr_values: Vec::new(),
            esr_nodes: Vec::new(),
            env: Env::new(),
            stats: None,
        }
    }

    #[test]
    fn drift_moves_numbers_and_vectors() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let drift = GaussianDrift { scale: 0.5 };
        let proposal = drift.propose(&Value::Number(1.), &no_args(), &mut rng)?;
        assert_ne!(proposal.value, Value::Number(1.));
        assert_eq!((proposal.forward, proposal.reverse), (0., 0.));

        let moved = drift.propose(&Value::vector(vec![0., 0., 0.]), &no_args(), &mut rng)?;
        assert_eq!(moved.value.as_vector()?.len(), 3);

        assert!(drift.propose(&Value::Bool(true), &no_args(), &mut rng).is_err());
        let bad = GaussianDrift { scale: 0. };
        assert!(bad.propose(&Value::Number(1.), &no_args(), &mut rng).is_err());
        Ok(())
    }

    #[test]
    fn drift_steps_have_the_requested_scale() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let drift = GaussianDrift { scale: 2. };
        let n = 20_000;
        let mut sum_sq = 0.;
        for _ in 0..n {
            let x = drift.propose(&Value::Number(0.), &no_args(), &mut rng)?.value.as_number()?;
            sum_sq += x * x;
        }
        approx::assert_relative_eq!((sum_sq / n as f64).sqrt(), 2., max_relative = 0.03);
        Ok(())
    }
}
