//! Incremental Metropolis-Hastings over the execution traces of
//! probabilistic programs.
//!
//! A [`Trace`] records every random choice and deterministic computation a
//! program made as a graph of nodes. A transition picks principal nodes
//! with a [`ScaffoldIndexer`], detaches the part of the graph that depends
//! on them, proposes new values and regenerates it, touching nothing else.

pub(crate) mod consistency;
pub(crate) mod detach;
pub(crate) mod error;
pub(crate) mod gradient;
pub(crate) mod hmc;
pub(crate) mod indexer;
pub(crate) mod infer;
pub(crate) mod kernel;
pub(crate) mod math;
pub(crate) mod node;
pub(crate) mod omegadb;
pub(crate) mod pgibbs;
pub(crate) mod psp;
pub(crate) mod regen;
pub(crate) mod sampler;
pub(crate) mod scaffold;
pub(crate) mod sexp;
pub mod sps;
pub(crate) mod trace;
pub(crate) mod transition;
pub(crate) mod value;

pub use detach::DetachWeights;
pub use error::{Result, Site, TraceError};
pub use indexer::{BlockSelector, ScaffoldIndexer};
pub use infer::{infer, InferStats};
pub use kernel::{GaussianDrift, Proposal, ProposalKernel, TransitionKernel};
pub use node::{Application, Node, NodeId, NodeKind};
pub use omegadb::OmegaDb;
pub use psp::{
    Args, Esr, LogDensity, LogDensityGradient, Psp, Request, RequestPsp, SimulateGradient, Sp,
    SufficientStats,
};
pub use regen::RegenWeights;
pub use sampler::{
    sample_chain, sample_parallel, ChainOutput, ChainProgress, ProgressCallback, SamplerSettings,
};
pub use scaffold::{PrincipalProposal, Scaffold};
pub use sexp::{read, read_all};
pub use trace::{Directive, DirectiveId, DirectiveKind, SpRecord, Trace, DEFAULT_SCOPE};
pub use transition::{mix_mh, MhTransition, TransitionInfo, TransitionState, Weights};
pub use value::{Env, MatrixValue, SpRef, Value};
