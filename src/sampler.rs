//! Independent chains on a thread pool. Every chain owns its trace and its
//! random number stream; nothing is shared between chains but the model
//! description.

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::ThreadPoolBuilder;
use std::{
    sync::{
        mpsc::{channel, RecvTimeoutError},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tracing::info;

use crate::{
    indexer::ScaffoldIndexer,
    infer::{infer, InferStats},
    kernel::TransitionKernel,
    trace::{DirectiveId, Trace},
    value::Value,
};

/// Settings for [`sample_parallel`].
#[derive(Debug, Clone)]
pub struct SamplerSettings {
    pub num_chains: usize,
    /// Draws discarded at the start of every chain.
    pub num_burn: u64,
    pub num_draws: u64,
    /// Transitions between recorded draws.
    pub steps_per_draw: usize,
    pub seed: u64,
    /// Worker threads. Defaults to one per chain.
    pub num_threads: Option<usize>,
    pub kernel: TransitionKernel,
    pub indexer: ScaffoldIndexer,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            num_chains: 4,
            num_burn: 100,
            num_draws: 1000,
            steps_per_draw: 1,
            seed: 0,
            num_threads: None,
            kernel: TransitionKernel::default(),
            indexer: ScaffoldIndexer::default(),
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct ChainProgress {
    pub finished_draws: u64,
    pub total_draws: u64,
    pub burn_in: bool,
    pub started: bool,
    pub transitions: usize,
    pub accepted: usize,
    pub divergences: usize,
    pub runtime: Duration,
}

impl ChainProgress {
    fn new(total: u64) -> Self {
        Self {
            finished_draws: 0,
            total_draws: total,
            burn_in: true,
            started: false,
            transitions: 0,
            accepted: 0,
            divergences: 0,
            runtime: Duration::ZERO,
        }
    }

    fn update(&mut self, stats: &InferStats, burn_in: bool, draw_duration: Duration) {
        self.finished_draws += 1;
        self.burn_in = burn_in;
        self.transitions += stats.transitions;
        self.accepted += stats.accepted;
        self.divergences += stats.divergences;
        self.runtime += draw_duration;
    }
}

pub struct ChainOutput {
    pub chain_id: u64,
    /// Reported values of the recorded directives, one row per draw.
    pub draws: Vec<Vec<Value>>,
    /// Transition counts after burn-in.
    pub stats: InferStats,
}

pub struct ProgressCallback {
    pub callback: Box<dyn FnMut(Duration, Box<[ChainProgress]>) + Send>,
    pub rate: Duration,
}

/// Run one chain in the current thread. `build` creates the trace of the
/// model and names the directives whose values are recorded per draw.
pub fn sample_chain<F>(build: &F, settings: &SamplerSettings, chain_id: u64) -> Result<ChainOutput>
where
    F: Fn(&mut dyn RngCore) -> Result<(Trace, Vec<DirectiveId>)>,
{
    let progress = Mutex::new(ChainProgress::new(settings.num_burn + settings.num_draws));
    run_chain(build, settings, chain_id, &progress)
}

fn run_chain<F>(
    build: &F,
    settings: &SamplerSettings,
    chain_id: u64,
    progress: &Mutex<ChainProgress>,
) -> Result<ChainOutput>
where
    F: Fn(&mut dyn RngCore) -> Result<(Trace, Vec<DirectiveId>)>,
{
    let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
    rng.set_stream(chain_id);

    let (mut trace, recorded) = build(&mut rng).context("Failed to build model trace")?;
    progress.lock().expect("Poisoned lock").started = true;

    let mut draws = Vec::with_capacity(settings.num_draws as usize);
    let mut stats = InferStats::default();
    for draw in 0..settings.num_burn + settings.num_draws {
        let start = Instant::now();
        let burn_in = draw < settings.num_burn;
        let step = infer(
            &mut trace,
            &settings.indexer,
            &settings.kernel,
            settings.steps_per_draw,
            &mut rng,
        )
        .with_context(|| format!("Transition failed in draw {} of chain {}", draw, chain_id))?;
        if !burn_in {
            stats.merge(&step);
            let values = recorded
                .iter()
                .map(|&id| trace.report(id))
                .collect::<crate::error::Result<Vec<_>>>()
                .context("Could not report recorded directive")?;
            draws.push(values);
        }
        progress
            .lock()
            .expect("Poisoned lock")
            .update(&step, burn_in, start.elapsed());
    }
    info!(
        chain = chain_id,
        draws = draws.len(),
        acceptance_rate = stats.acceptance_rate(),
        divergences = stats.divergences,
        "Finished chain"
    );
    Ok(ChainOutput {
        chain_id,
        draws,
        stats,
    })
}

/// Run `settings.num_chains` chains in parallel and return their outputs
/// ordered by chain id. Chain `i` uses stream `i` of a ChaCha8 generator
/// seeded with `settings.seed`, so results do not depend on scheduling.
pub fn sample_parallel<F>(
    build: F,
    settings: &SamplerSettings,
    callback: Option<ProgressCallback>,
) -> Result<Vec<ChainOutput>>
where
    F: Fn(&mut dyn RngCore) -> Result<(Trace, Vec<DirectiveId>)> + Sync,
{
    if settings.num_chains == 0 {
        bail!("At least one chain is required");
    }
    let num_threads = settings.num_threads.unwrap_or(settings.num_chains);
    let pool = ThreadPoolBuilder::new()
        .num_threads(num_threads + 1) // One more thread because the controller also uses one
        .thread_name(|i| format!("regen-worker-{}", i))
        .build()
        .context("Could not start thread pool")?;

    let total = settings.num_burn + settings.num_draws;
    let progress = (0..settings.num_chains)
        .map(|_| Arc::new(Mutex::new(ChainProgress::new(total))))
        .collect_vec();
    let (results_tx, results_rx) = channel();
    let build = &build;
    let progress_ref = &progress;
    let mut callback = callback;
    let callback_ref = &mut callback;

    let results = pool.scope_fifo(move |scope| {
        for chain_id in 0..settings.num_chains {
            let results = results_tx.clone();
            let progress = progress_ref[chain_id].clone();
            scope.spawn_fifo(move |_| {
                let output = run_chain(build, settings, chain_id as u64, &progress);
                // The controller only stops listening after every chain
                // reported or failed.
                let _ = results.send(output);
            });
        }
        drop(results_tx);

        let snapshot = || {
            progress_ref
                .iter()
                .map(|chain| chain.lock().expect("Poisoned lock").clone())
                .collect_vec()
        };
        let start_time = Instant::now();
        let rate = callback_ref.as_ref().map_or(Duration::MAX, |c| c.rate);
        let mut results = Vec::with_capacity(settings.num_chains);
        loop {
            match results_rx.recv_timeout(rate) {
                Ok(output) => results.push(output),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(ProgressCallback { callback, .. }) = callback_ref.as_mut() {
                        callback(start_time.elapsed(), snapshot().into());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if let Some(ProgressCallback { callback, .. }) = callback_ref.as_mut() {
            callback(start_time.elapsed(), snapshot().into());
        }
        results
    });

    let mut chains = results.into_iter().collect::<Result<Vec<_>>>()?;
    chains.sort_by_key(|chain| chain.chain_id);
    Ok(chains)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sexp::read;
    use pretty_assertions::assert_eq;

    fn normal_normal(rng: &mut dyn RngCore) -> Result<(Trace, Vec<DirectiveId>)> {
        let mut trace = Trace::new();
        let (x, _) = trace.assume("x", &read("(normal 0 1)")?, rng)?;
        trace.observe(&read("(normal x 1)")?, Value::Number(2.), rng)?;
        Ok((trace, vec![x]))
    }

    fn settings() -> SamplerSettings {
        SamplerSettings {
            num_chains: 3,
            num_burn: 50,
            num_draws: 400,
            steps_per_draw: 2,
            seed: 10,
            kernel: TransitionKernel::drift(1.),
            ..Default::default()
        }
    }

    #[test]
    fn sample_parallel_orders_chains() -> Result<()> {
        let settings = settings();
        let chains = sample_parallel(normal_normal, &settings, None)?;
        assert_eq!(chains.len(), 3);
        for (i, chain) in chains.iter().enumerate() {
            assert_eq!(chain.chain_id, i as u64);
            assert_eq!(chain.draws.len(), 400);
            assert_eq!(chain.stats.transitions, 800);
        }
        assert_ne!(chains[0].draws, chains[1].draws);
        Ok(())
    }

    #[test]
    fn chains_do_not_depend_on_scheduling() -> Result<()> {
        let settings = settings();
        let parallel = sample_parallel(normal_normal, &settings, None)?;
        let single = sample_chain(&normal_normal, &settings, 2)?;
        assert_eq!(parallel[2].draws, single.draws);
        Ok(())
    }

    #[test]
    fn progress_is_reported() -> Result<()> {
        let settings = settings();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let callback = ProgressCallback {
            callback: Box::new(move |_, progress| {
                sink.lock().unwrap().push(progress);
            }),
            rate: Duration::from_millis(1),
        };
        sample_parallel(normal_normal, &settings, Some(callback))?;
        let reports = reports.lock().unwrap();
        let last = reports.last().expect("no progress reported");
        assert!(last.iter().all(|chain| chain.finished_draws == 450 && !chain.burn_in));
        Ok(())
    }

    #[test]
    fn build_failures_are_reported() {
        let settings = SamplerSettings {
            num_chains: 2,
            num_draws: 10,
            ..Default::default()
        };
        let failing = |rng: &mut dyn RngCore| -> Result<(Trace, Vec<DirectiveId>)> {
            let mut trace = Trace::new();
            trace.assume("x", &read("(normal 0 -1)")?, rng)?;
            Ok((trace, Vec::new()))
        };
        assert!(sample_parallel(failing, &settings, None).is_err());
        let no_chains = SamplerSettings {
            num_chains: 0,
            ..Default::default()
        };
        assert!(sample_parallel(normal_normal, &no_chains, None).is_err());
    }
}
