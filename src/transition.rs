//! One Metropolis-Hastings step over a scaffold: detach, propose,
//! regenerate, then accept or restore.

use std::sync::Arc;

use rand::{Rng, RngCore};
use tracing::debug;

use crate::{
    detach,
    error::{Result, TraceError},
    hmc,
    indexer::ScaffoldIndexer,
    kernel::{GaussianDrift, TransitionKernel},
    omegadb::OmegaDb,
    pgibbs,
    regen::{self, RegenMode},
    scaffold::{PrincipalProposal, Scaffold},
    trace::Trace,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionState {
    Built,
    Detached,
    Proposed,
    Regenerated,
    Committed,
    RolledBack,
}

/// Terms of the log acceptance ratio of a transition.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Weights {
    pub old_log_density: f64,
    pub new_log_density: f64,
    pub forward_proposal: f64,
    pub reverse_proposal: f64,
    /// Log probability of choosing the scaffold in the old trace.
    pub rho_index: f64,
    /// Log probability of choosing the same scaffold in the new trace.
    pub xi_index: f64,
}

impl Weights {
    pub fn log_alpha(&self) -> f64 {
        (self.new_log_density + self.xi_index + self.reverse_proposal)
            - (self.old_log_density + self.rho_index + self.forward_proposal)
    }
}

/// Summary of a finished transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionInfo {
    pub accepted: bool,
    pub log_alpha: f64,
    pub num_principal: usize,
    pub num_resampled: usize,
    pub num_brush: usize,
}

impl TransitionInfo {
    fn empty() -> TransitionInfo {
        TransitionInfo {
            accepted: true,
            log_alpha: 0.,
            num_principal: 0,
            num_resampled: 0,
            num_brush: 0,
        }
    }
}

fn principal_proposal(kernel: &TransitionKernel) -> PrincipalProposal {
    match kernel {
        TransitionKernel::Resimulation | TransitionKernel::ParticleGibbs { .. } => {
            PrincipalProposal::Prior
        }
        TransitionKernel::Drift { scale } => {
            PrincipalProposal::Kernel(Arc::new(GaussianDrift { scale: *scale }))
        }
        TransitionKernel::Custom(kernel) => PrincipalProposal::Kernel(kernel.clone()),
        // Filled in with the end of the trajectory before regenerating.
        TransitionKernel::Hamiltonian { .. } => PrincipalProposal::Fixed(Default::default()),
    }
}

/// A transition in flight. The trace is inside a transaction until the
/// transition is accepted or rejected; dropping it earlier rolls the trace
/// back to where it started.
pub struct MhTransition<'a> {
    trace: &'a mut Trace,
    indexer: &'a ScaffoldIndexer,
    scaffold: Scaffold,
    rho_db: OmegaDb,
    /// The particle to attach when regenerating, for particle Gibbs.
    particle: Option<OmegaDb>,
    weights: Weights,
    state: TransitionState,
}

impl<'a> MhTransition<'a> {
    pub fn new(
        trace: &'a mut Trace,
        indexer: &'a ScaffoldIndexer,
        kernel: &TransitionKernel,
        rng: &mut dyn RngCore,
    ) -> Result<MhTransition<'a>> {
        let scaffold = indexer.sample_index(trace, principal_proposal(kernel), rng)?;
        let rho_index = if scaffold.is_empty() {
            0.
        } else {
            indexer.log_density_of_index(trace, &scaffold)
        };
        trace.begin_transaction();
        Ok(MhTransition {
            trace,
            indexer,
            scaffold,
            rho_db: OmegaDb::default(),
            particle: None,
            weights: Weights {
                rho_index,
                ..Weights::default()
            },
            state: TransitionState::Built,
        })
    }

    pub fn state(&self) -> TransitionState {
        self.state
    }

    pub fn scaffold(&self) -> &Scaffold {
        &self.scaffold
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    pub fn log_alpha(&self) -> f64 {
        self.weights.log_alpha()
    }

    fn expect_state(&self, expected: TransitionState) -> Result<()> {
        if self.state != expected {
            return Err(TraceError::Inconsistent(format!(
                "transition is {:?}, expected {:?}",
                self.state, expected
            )));
        }
        Ok(())
    }

    pub fn detach(&mut self, with_gradient: bool) -> Result<()> {
        self.expect_state(TransitionState::Built)?;
        if with_gradient {
            hmc::check_scaffold(&self.scaffold)?;
        }
        let (weights, db) = detach::detach_and_extract(self.trace, &self.scaffold, with_gradient)?;
        self.weights.old_log_density = weights.old_log_density;
        self.rho_db = db;
        self.state = TransitionState::Detached;
        Ok(())
    }

    /// Settle how the principal nodes get their new values. The
    /// Hamiltonian and particle Gibbs kernels do their work here; the
    /// others propose while regenerating.
    pub fn propose(&mut self, kernel: &TransitionKernel, rng: &mut dyn RngCore) -> Result<()> {
        self.expect_state(TransitionState::Detached)?;
        match *kernel {
            TransitionKernel::Hamiltonian {
                step_size,
                num_steps,
            } => {
                let trajectory = hmc::integrate(
                    self.trace,
                    &mut self.scaffold,
                    &self.rho_db,
                    step_size,
                    num_steps,
                    rng,
                )?;
                self.weights.forward_proposal += trajectory.forward;
                self.weights.reverse_proposal += trajectory.reverse;
            }
            TransitionKernel::ParticleGibbs { particles } => {
                let drawn = pgibbs::propose(
                    self.trace,
                    &self.scaffold,
                    self.weights.old_log_density,
                    particles,
                    rng,
                )?;
                self.weights.old_log_density = drawn.old_log_density;
                self.weights.new_log_density = drawn.new_log_density;
                self.particle = Some(drawn.chosen);
            }
            _ => {}
        }
        self.state = TransitionState::Proposed;
        Ok(())
    }

    pub fn regenerate(&mut self, rng: &mut dyn RngCore) -> Result<()> {
        self.expect_state(TransitionState::Proposed)?;
        if let Some(chosen) = self.particle.take() {
            // The particle weights already hold both densities.
            pgibbs::restore(self.trace, &self.scaffold, &chosen, rng)?;
        } else {
            let weights = regen::regen_and_attach(
                self.trace,
                &self.scaffold,
                RegenMode::Fresh,
                &self.rho_db,
                rng,
            )?;
            self.weights.new_log_density = weights.new_log_density;
            self.weights.forward_proposal += weights.forward_proposal;
            self.weights.reverse_proposal += weights.reverse_proposal;
        }
        if !self.scaffold.is_empty() {
            self.weights.xi_index = self.indexer.log_density_of_index(self.trace, &self.scaffold);
        }
        self.state = TransitionState::Regenerated;
        Ok(())
    }

    /// Keep the new state.
    pub fn accept(mut self) -> Result<TransitionState> {
        self.expect_state(TransitionState::Regenerated)?;
        self.trace.retire_brush(&self.rho_db);
        self.trace.commit_transaction();
        self.state = TransitionState::Committed;
        Ok(self.state)
    }

    /// Put back the old state from the values recorded while detaching.
    /// The restored trace is committed, so the transition ends rolled back
    /// without replaying the journal.
    pub fn reject(mut self, rng: &mut dyn RngCore) -> Result<TransitionState> {
        self.expect_state(TransitionState::Regenerated)?;
        let (_, xi_db) = detach::detach_and_extract(self.trace, &self.scaffold, false)?;
        regen::regen_and_attach(
            self.trace,
            &self.scaffold,
            RegenMode::Restore,
            &self.rho_db,
            rng,
        )?;
        self.trace.retire_brush(&xi_db);
        self.trace.commit_transaction();
        self.state = TransitionState::RolledBack;
        Ok(self.state)
    }

    /// Undo everything the transition did.
    pub fn abort(mut self) -> TransitionState {
        self.roll_back();
        self.state
    }

    fn roll_back(&mut self) {
        if self.state != TransitionState::Committed && self.state != TransitionState::RolledBack {
            self.trace.rollback_transaction();
            self.state = TransitionState::RolledBack;
        }
    }

    fn info(&self, accepted: bool, log_alpha: f64) -> TransitionInfo {
        TransitionInfo {
            accepted,
            log_alpha,
            num_principal: self.scaffold.principal.len(),
            num_resampled: self.scaffold.resampled.len(),
            num_brush: self.scaffold.brush.len(),
        }
    }
}

impl Drop for MhTransition<'_> {
    fn drop(&mut self) {
        self.roll_back();
    }
}

/// Run one Metropolis-Hastings transition on a scaffold chosen by
/// `indexer`. On error the trace is left exactly as it was.
pub fn mix_mh(
    trace: &mut Trace,
    indexer: &ScaffoldIndexer,
    kernel: &TransitionKernel,
    rng: &mut dyn RngCore,
) -> Result<TransitionInfo> {
    let mut transition = MhTransition::new(trace, indexer, kernel, rng)?;
    if transition.scaffold.is_empty() {
        transition.abort();
        return Ok(TransitionInfo::empty());
    }
    transition.detach(kernel.needs_gradient())?;
    transition.propose(kernel, rng)?;
    transition.regenerate(rng)?;

    let log_alpha = transition.log_alpha();
    if log_alpha.is_nan() {
        return Err(TraceError::numerical("log acceptance ratio", log_alpha));
    }
    let u: f64 = rng.random();
    let accepted = u.ln() < log_alpha;
    let info = transition.info(accepted, log_alpha);
    if accepted {
        transition.accept()?;
    } else {
        transition.reject(rng)?;
    }
    debug!(
        accepted,
        log_alpha,
        principal = info.num_principal,
        resampled = info.num_resampled,
        brush = info.num_brush,
        "Finished MH transition"
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sexp::read, value::Value};
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn normal_normal(rng: &mut StdRng) -> Result<Trace> {
        let mut trace = Trace::new();
        trace.assume("x", &read("(normal 0 1)")?, rng)?;
        trace.observe(&read("(normal x 1)")?, Value::Number(2.), rng)?;
        Ok(trace)
    }

    #[test]
    fn steps_through_the_states() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut trace = normal_normal(&mut rng)?;
        let indexer = ScaffoldIndexer::default();
        let kernel = TransitionKernel::Resimulation;

        let mut transition = MhTransition::new(&mut trace, &indexer, &kernel, &mut rng)?;
        assert_eq!(transition.state(), TransitionState::Built);
        assert!(transition.propose(&kernel, &mut rng).is_err());
        transition.detach(false)?;
        assert_eq!(transition.state(), TransitionState::Detached);
        transition.propose(&kernel, &mut rng)?;
        transition.regenerate(&mut rng)?;
        assert_eq!(transition.state(), TransitionState::Regenerated);
        assert!(transition.log_alpha().is_finite());
        assert_eq!(transition.accept()?, TransitionState::Committed);
        trace.check_consistency()?;
        Ok(())
    }

    #[test]
    fn rejection_restores_the_old_value() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut trace = normal_normal(&mut rng)?;
        let x = trace.global_env().find("x").ok_or(TraceError::UnboundSymbol {
            symbol: "x".into(),
        })?;
        let before = trace.value_at(x)?.clone();
        let nodes = trace.num_nodes();

        let indexer = ScaffoldIndexer::default();
        let kernel = TransitionKernel::Resimulation;
        let mut transition = MhTransition::new(&mut trace, &indexer, &kernel, &mut rng)?;
        transition.detach(false)?;
        transition.propose(&kernel, &mut rng)?;
        transition.regenerate(&mut rng)?;
        assert_eq!(transition.reject(&mut rng)?, TransitionState::RolledBack);
        assert!(!trace.in_transaction());

        assert_eq!(trace.value_at(x)?, &before);
        assert_eq!(trace.num_nodes(), nodes);
        trace.check_consistency()?;
        Ok(())
    }

    #[test]
    fn particle_gibbs_weighs_its_particles() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(5);
        let mut trace = normal_normal(&mut rng)?;
        let indexer = ScaffoldIndexer::default();
        let kernel = TransitionKernel::particle_gibbs(4);

        let mut transition = MhTransition::new(&mut trace, &indexer, &kernel, &mut rng)?;
        transition.detach(false)?;
        let rho_weight = transition.weights().old_log_density;
        transition.propose(&kernel, &mut rng)?;
        let weights = *transition.weights();
        assert!(weights.new_log_density.is_finite());
        // The old state joins the other particles in the reverse sum.
        assert!(weights.old_log_density >= rho_weight);
        transition.regenerate(&mut rng)?;
        assert_eq!(transition.weights().new_log_density, weights.new_log_density);
        assert_eq!(transition.accept()?, TransitionState::Committed);
        trace.check_consistency()?;
        Ok(())
    }

    #[test]
    fn dropping_a_transition_rolls_back() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut trace = normal_normal(&mut rng)?;
        let choices: Vec<_> = trace.random_choices().collect();
        let before: Vec<_> = choices.iter().map(|&c| trace.value(c).cloned()).collect();

        let indexer = ScaffoldIndexer::default();
        let kernel = TransitionKernel::Resimulation;
        {
            let mut transition = MhTransition::new(&mut trace, &indexer, &kernel, &mut rng)?;
            transition.detach(false)?;
            transition.propose(&kernel, &mut rng)?;
            transition.regenerate(&mut rng)?;
        }
        let after: Vec<_> = choices.iter().map(|&c| trace.value(c).cloned()).collect();
        assert_eq!(before, after);
        assert!(!trace.in_transaction());
        trace.check_consistency()?;
        Ok(())
    }

    #[test]
    fn empty_scaffold_is_a_no_op() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let mut trace = Trace::new();
        trace.assume("x", &read("(+ 1 2)")?, &mut rng)?;
        let info = mix_mh(
            &mut trace,
            &ScaffoldIndexer::default(),
            &TransitionKernel::Resimulation,
            &mut rng,
        )?;
        assert!(info.accepted);
        assert_eq!(info.num_principal, 0);
        assert!(!trace.in_transaction());
        Ok(())
    }

    #[test]
    fn weights_combine_into_log_alpha() {
        let weights = Weights {
            old_log_density: -1.,
            new_log_density: -2.,
            forward_proposal: -0.5,
            reverse_proposal: -0.25,
            rho_index: -(2f64.ln()),
            xi_index: -(3f64.ln()),
        };
        let expected = (-2. - 3f64.ln() - 0.25) - (-1. - 2f64.ln() - 0.5);
        approx::assert_relative_eq!(weights.log_alpha(), expected);
    }
}
