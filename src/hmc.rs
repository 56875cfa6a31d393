//! Hamiltonian proposals for the principal nodes of a scaffold.
//!
//! The principal values are flattened into one position vector and moved
//! along a leapfrog trajectory with unit mass. Every gradient evaluation
//! regenerates the scaffold at the current position and detaches it again
//! with gradients enabled. Non-principal random choices in the scaffold are
//! simulated from one seed for the whole trajectory so that the potential
//! does not change between steps.

use std::collections::BTreeMap;

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use tracing::trace;

use crate::{
    detach,
    error::{Result, TraceError},
    gradient,
    math::{axpy, vector_dot},
    node::NodeId,
    omegadb::OmegaDb,
    regen::{self, RegenMode},
    scaffold::{PrincipalProposal, Scaffold},
    trace::Trace,
    value::Value,
};

/// Log densities of the momentum at both ends of a trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Trajectory {
    /// Log density of the initial momentum.
    pub forward: f64,
    /// Log density of the final momentum.
    pub reverse: f64,
}

struct Position<'a> {
    nodes: Vec<NodeId>,
    templates: Vec<Value>,
    seed: u64,
    trace: &'a mut Trace,
    scaffold: &'a mut Scaffold,
}

impl Position<'_> {
    fn values(&self, position: &[f64]) -> Result<BTreeMap<NodeId, Value>> {
        let mut offset = 0;
        let mut values = BTreeMap::new();
        for (&node, template) in self.nodes.iter().zip(self.templates.iter()) {
            let (value, used) = gradient::unflatten(template, &position[offset..])?;
            offset += used;
            values.insert(node, value);
        }
        Ok(values)
    }

    fn flat_partials(&self, db: &OmegaDb) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(self.templates.len());
        for (node, template) in self.nodes.iter().zip(self.templates.iter()) {
            match db.partial(*node) {
                Some(partial) => gradient::flatten(partial, &mut out)?,
                None => gradient::flatten(&gradient::zeros_like(template)?, &mut out)?,
            }
        }
        Ok(out)
    }

    /// Gradient of the scaffold's log density with the principal nodes at
    /// `position`. Leaves the scaffold detached.
    fn gradient_at(&mut self, position: &[f64]) -> Result<Vec<f64>> {
        self.scaffold.proposal = PrincipalProposal::Fixed(self.values(position)?);
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let weights = regen::regen_and_attach(
            self.trace,
            self.scaffold,
            RegenMode::Fresh,
            &OmegaDb::default(),
            &mut rng,
        )?;
        if !weights.new_log_density.is_finite() {
            return Err(TraceError::numerical(
                "log density along trajectory",
                weights.new_log_density,
            ));
        }
        let (_, db) = detach::detach_and_extract(self.trace, self.scaffold, true)?;
        self.trace.retire_brush(&db);
        self.flat_partials(&db)
    }
}

/// Gradients only flow through scaffolds whose structure cannot change.
pub(crate) fn check_scaffold(scaffold: &Scaffold) -> Result<()> {
    if !scaffold.brush.is_empty() {
        return Err(TraceError::UnsupportedScaffold(
            "Hamiltonian proposals need a scaffold whose structure cannot change".into(),
        ));
    }
    Ok(())
}

/// Run a leapfrog trajectory from the detached state recorded in `rho_db`
/// and leave its end point as the fixed proposal of `scaffold`.
pub(crate) fn integrate(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    rho_db: &OmegaDb,
    step_size: f64,
    num_steps: usize,
    rng: &mut dyn RngCore,
) -> Result<Trajectory> {
    check_scaffold(scaffold)?;
    if !(step_size > 0.) || num_steps == 0 {
        return Err(TraceError::domain(
            "Hamiltonian step size and number of steps must be positive",
        ));
    }

    let nodes: Vec<NodeId> = scaffold.principal.iter().copied().collect();
    let templates = nodes
        .iter()
        .map(|&node| {
            rho_db.value(node).cloned().ok_or_else(|| {
                TraceError::Inconsistent(format!("no recorded value for node {}", node))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let mut position = Vec::new();
    for template in templates.iter() {
        gradient::flatten(template, &mut position)?;
    }

    let mut state = Position {
        nodes,
        templates,
        seed: rng.random(),
        trace,
        scaffold,
    };
    let mut grad = state.flat_partials(rho_db)?;
    let initial_momentum: Vec<f64> = (0..position.len())
        .map(|_| StandardNormal.sample(&mut *rng))
        .collect();
    let mut momentum = initial_momentum.clone();

    axpy(&grad, &mut momentum, step_size / 2.);
    for step in 0..num_steps {
        axpy(&momentum, &mut position, step_size);
        grad = state.gradient_at(&position)?;
        let scale = if step + 1 == num_steps {
            step_size / 2.
        } else {
            step_size
        };
        axpy(&grad, &mut momentum, scale);
    }
    if let Some(bad) = momentum.iter().copied().find(|p| !p.is_finite()) {
        return Err(TraceError::numerical("momentum", bad));
    }

    state.scaffold.proposal = PrincipalProposal::Fixed(state.values(&position)?);
    let trajectory = Trajectory {
        forward: -0.5 * vector_dot(&initial_momentum, &initial_momentum),
        reverse: -0.5 * vector_dot(&momentum, &momentum),
    };
    trace!(
        dim = position.len(),
        num_steps,
        forward = trajectory.forward,
        reverse = trajectory.reverse,
        "Integrated trajectory"
    );
    Ok(trajectory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{indexer::ScaffoldIndexer, sexp::read};
    use rand::rngs::StdRng;

    #[test]
    fn trajectory_ends_at_a_fixed_proposal() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut trace = Trace::new();
        trace.assume("x", &read("(normal 0 1)")?, &mut rng)?;
        trace.observe(&read("(normal x 1)")?, Value::Number(1.), &mut rng)?;

        trace.begin_transaction();
        let mut scaffold = ScaffoldIndexer::default().sample_index(
            &trace,
            PrincipalProposal::Fixed(BTreeMap::new()),
            &mut rng,
        )?;
        let (_, db) = detach::detach_and_extract(&mut trace, &scaffold, true)?;
        let trajectory = integrate(&mut trace, &mut scaffold, &db, 0.1, 10, &mut rng)?;
        trace.rollback_transaction();

        assert!(trajectory.forward <= 0.);
        assert!(trajectory.reverse <= 0.);
        let PrincipalProposal::Fixed(values) = &scaffold.proposal else {
            panic!("expected a fixed proposal");
        };
        assert_eq!(values.len(), 1);
        trace.check_consistency()?;
        Ok(())
    }

    #[test]
    fn rejects_bad_settings() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let mut trace = Trace::new();
        trace.assume("x", &read("(normal 0 1)")?, &mut rng)?;
        trace.begin_transaction();
        let mut scaffold = ScaffoldIndexer::default().sample_index(
            &trace,
            PrincipalProposal::Fixed(BTreeMap::new()),
            &mut rng,
        )?;
        let (_, db) = detach::detach_and_extract(&mut trace, &scaffold, true)?;
        assert!(integrate(&mut trace, &mut scaffold, &db, 0., 10, &mut rng).is_err());
        assert!(integrate(&mut trace, &mut scaffold, &db, 0.1, 0, &mut rng).is_err());
        trace.rollback_transaction();
        Ok(())
    }
}
