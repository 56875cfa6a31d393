//! Particle Gibbs over a whole scaffold.
//!
//! The detached state is one particle. Further particles are drawn by
//! regenerating the scaffold from the prior and detaching it again, which
//! leaves each of them in its own [`OmegaDb`] with the log density of its
//! absorbing nodes as weight. One of the fresh particles is picked in
//! proportion to its weight and becomes the proposal.

use rand::{Rng, RngCore};
use tracing::trace;

use crate::{
    detach,
    error::{Result, TraceError},
    math::logsumexp,
    omegadb::OmegaDb,
    regen::{self, RegenMode},
    scaffold::Scaffold,
    trace::Trace,
};

/// The particle chosen by [`propose`] and the log weights the acceptance
/// ratio is made of.
#[derive(Debug)]
pub(crate) struct Particles {
    pub chosen: OmegaDb,
    /// Log of the summed weights of the fresh particles.
    pub new_log_density: f64,
    /// The same sum with the chosen particle replaced by the old state.
    pub old_log_density: f64,
}

/// Index drawn with probability proportional to `exp(log_weights[i])`.
fn sample_log_weights(log_weights: &[f64], rng: &mut dyn RngCore) -> Result<usize> {
    let total = logsumexp(log_weights);
    if !total.is_finite() {
        return Err(TraceError::numerical("particle weights", total));
    }
    let mut u: f64 = rng.random();
    for (index, w) in log_weights.iter().enumerate() {
        let p = (w - total).exp();
        if u < p {
            return Ok(index);
        }
        u -= p;
    }
    Ok(log_weights.len() - 1)
}

/// Draw `num_particles` fresh particles for a detached scaffold whose old
/// state weighs `rho_weight`. The fresh particles that are not chosen are
/// retired with the transaction.
pub(crate) fn propose(
    trace: &mut Trace,
    scaffold: &Scaffold,
    rho_weight: f64,
    num_particles: usize,
    rng: &mut dyn RngCore,
) -> Result<Particles> {
    if num_particles == 0 {
        return Err(TraceError::domain("particle Gibbs needs at least one particle"));
    }
    if !scaffold.proposal.is_prior() {
        return Err(TraceError::UnsupportedScaffold(
            "particles are drawn from the prior".into(),
        ));
    }
    let mut weights = Vec::with_capacity(num_particles);
    let mut dbs = Vec::with_capacity(num_particles);
    for _ in 0..num_particles {
        regen::regen_and_attach(trace, scaffold, RegenMode::Fresh, &OmegaDb::default(), rng)?;
        let (weight, db) = detach::detach_and_extract(trace, scaffold, false)?;
        weights.push(weight.old_log_density);
        dbs.push(db);
    }

    let index = sample_log_weights(&weights, rng)?;
    let chosen = dbs.swap_remove(index);
    for db in dbs.iter() {
        trace.retire_brush(db);
    }
    let mut others: Vec<f64> = weights
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != index)
        .map(|(_, &w)| w)
        .collect();
    others.push(rho_weight);
    let particles = Particles {
        chosen,
        new_log_density: logsumexp(&weights),
        old_log_density: logsumexp(&others),
    };
    trace!(
        num_particles,
        chosen = index,
        new_log_density = particles.new_log_density,
        old_log_density = particles.old_log_density,
        "Drew particles"
    );
    Ok(particles)
}

/// Attach the chosen particle to the detached scaffold.
pub(crate) fn restore(
    trace: &mut Trace,
    scaffold: &Scaffold,
    chosen: &OmegaDb,
    rng: &mut dyn RngCore,
) -> Result<()> {
    regen::regen_and_attach(trace, scaffold, RegenMode::Restore, chosen, rng)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{indexer::ScaffoldIndexer, scaffold::PrincipalProposal, sexp::read, value::Value};
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn log_weights_pick_in_proportion() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let weights = [0.25f64.ln(), f64::NEG_INFINITY, 0.75f64.ln()];
        let n = 20_000;
        let mut counts = [0usize; 3];
        for _ in 0..n {
            counts[sample_log_weights(&weights, &mut rng)?] += 1;
        }
        assert_eq!(counts[1], 0);
        assert_abs_diff_eq!(counts[2] as f64 / n as f64, 0.75, epsilon = 0.02);
        assert!(sample_log_weights(&[f64::NEG_INFINITY; 2], &mut rng).is_err());
        Ok(())
    }

    #[test]
    fn chosen_particle_restores_cleanly() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut trace = Trace::new();
        trace.assume("b", &read("(flip)")?, &mut rng)?;
        trace.assume("x", &read("(if b (normal 0 1) (normal 5 1))")?, &mut rng)?;
        trace.observe(&read("(normal x 1)")?, Value::Number(4.), &mut rng)?;
        let nodes = trace.num_nodes();

        trace.begin_transaction();
        let scaffold = ScaffoldIndexer::default().sample_index(
            &trace,
            PrincipalProposal::Prior,
            &mut rng,
        )?;
        let (rho, rho_db) = detach::detach_and_extract(&mut trace, &scaffold, false)?;
        let particles = propose(&mut trace, &scaffold, rho.old_log_density, 5, &mut rng)?;
        assert!(particles.new_log_density.is_finite());
        assert!(particles.old_log_density.is_finite());
        restore(&mut trace, &scaffold, &particles.chosen, &mut rng)?;
        trace.retire_brush(&rho_db);
        trace.commit_transaction();

        assert_eq!(trace.num_nodes(), nodes);
        trace.check_consistency()?;
        Ok(())
    }

    #[test]
    fn rejects_bad_settings() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let mut trace = Trace::new();
        trace.assume("x", &read("(normal 0 1)")?, &mut rng)?;
        trace.begin_transaction();
        let scaffold = ScaffoldIndexer::default().sample_index(
            &trace,
            PrincipalProposal::Prior,
            &mut rng,
        )?;
        let (rho, _) = detach::detach_and_extract(&mut trace, &scaffold, false)?;
        assert!(propose(&mut trace, &scaffold, rho.old_log_density, 0, &mut rng).is_err());
        trace.rollback_transaction();
        trace.check_consistency()?;
        Ok(())
    }
}
