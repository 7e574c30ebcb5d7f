//! Distributed stochastic variational inference for the assortative MMSB.
//!
//! One iteration broadcasts theta, optionally evaluates perplexity,
//! deploys a stratified minibatch over the cohort, updates phi and pi for
//! the touched vertices with injected Gaussian noise, and folds reduced
//! beta gradients into theta at the master. Pi rows live in a distributed
//! key-value store; a strict happens-before ordering separates reads and
//! writes of pi across iterations.

pub mod config;
pub mod error;

/// Source-aware random generator fleet, keyed by (purpose, rank, thread)
pub mod rng;

/// Contiguous work splitting for the rayon loops
pub mod par;

/// Accumulating wall-clock timers with a tabular report
pub mod timer;

/// Shared learner state: priors, step size, convergence, edge likelihood
pub mod learner;

/// Minibatch node partitioning across the cohort
pub mod minibatch;

/// Per-node phi update with stochastic-gradient noise
pub mod phi;

/// Beta/theta update from reduced minibatch gradients
pub mod beta;

/// Chunked held-out perplexity evaluation
pub mod perplexity;

/// The per-worker distributed iteration loop
pub mod svi;

pub use config::SviConfig;
pub use error::SviError;
pub use learner::MCMC_NONZERO_GUARD;
pub use svi::DistributedSvi;
