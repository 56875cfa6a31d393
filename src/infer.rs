use rand::RngCore;
use tracing::{info, warn};

use crate::{
    error::Result,
    indexer::ScaffoldIndexer,
    kernel::TransitionKernel,
    trace::Trace,
    transition::mix_mh,
};

/// Counts of what happened during a run of transitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InferStats {
    pub transitions: usize,
    pub accepted: usize,
    /// Transitions abandoned because of a numerical failure. The trace is
    /// unchanged by them.
    pub divergences: usize,
}

impl InferStats {
    pub fn acceptance_rate(&self) -> f64 {
        if self.transitions == 0 {
            return 0.;
        }
        self.accepted as f64 / self.transitions as f64
    }

    pub fn merge(&mut self, other: &InferStats) {
        self.transitions += other.transitions;
        self.accepted += other.accepted;
        self.divergences += other.divergences;
    }
}

/// Run `num_transitions` Metropolis-Hastings transitions. Numerical
/// failures reject the transition they happen in; any other error stops
/// the run with the trace in the state after the last finished transition.
pub fn infer(
    trace: &mut Trace,
    indexer: &ScaffoldIndexer,
    kernel: &TransitionKernel,
    num_transitions: usize,
    rng: &mut dyn RngCore,
) -> Result<InferStats> {
    let mut stats = InferStats::default();
    for _ in 0..num_transitions {
        stats.transitions += 1;
        match mix_mh(trace, indexer, kernel, rng) {
            Ok(transition) => {
                if transition.accepted {
                    stats.accepted += 1;
                }
            }
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, "Transition diverged");
                stats.divergences += 1;
            }
            Err(err) => return Err(err),
        }
    }
    info!(
        transitions = stats.transitions,
        accepted = stats.accepted,
        divergences = stats.divergences,
        scope = %indexer.scope,
        "Finished inference"
    );
    Ok(stats)
}
