//! Run configuration, decoupled from the command line.

use sbm_net::Strategy;

use crate::error::SviError;

/// Which pi-store transport backs the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DkvType {
    /// Shard files under a directory; single-process friendly.
    File { dir: std::path::PathBuf },
    /// In-process shards for the emulated cohort.
    Shared,
    /// Remote multi-read/multi-write RPC store (external wire layer).
    Rpc { coordinator: String },
    /// One-sided RDMA reads of pinned pi regions (external wire layer).
    Rdma { device: String, port: u16 },
}

#[derive(Debug, Clone)]
pub struct SviConfig {
    /// Number of communities K
    pub k: usize,
    /// Dirichlet prior on pi
    pub alpha: f64,
    /// Beta prior on the community strengths
    pub eta0: f64,
    pub eta1: f64,
    /// Background link probability across communities
    pub epsilon: f64,
    /// Minibatch size b; 0 means N/2
    pub mini_batch_size: usize,
    pub max_iteration: u64,
    /// Robbins-Monro step size parameters: eps_t = a * (1 + t/b)^-c
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub held_out_ratio: f64,
    /// Neighbours sampled per minibatch node; 0 means N/50
    pub num_node_sample: usize,
    pub strategy: Strategy,
    /// Non-link partitions per node for stratified-random-node sampling
    pub num_pieces: usize,
    pub dkv_type: DkvType,
    pub random_seed: u64,
    /// Perplexity cadence in iterations
    pub interval: u64,
    /// Read-cache capacity in pi records; 0 derives a default from N
    pub max_pi_cache_entries: usize,
    /// Cohort size of the emulated run
    pub workers: usize,
    /// Work-sharing threads inside each worker
    pub threads: usize,
    /// Whether every worker holds the full graph
    pub replicated_graph: bool,
    /// Force the master to take a minibatch node slice even when S > 1
    pub forced_master_is_worker: bool,
    /// Drop the Gaussian noise terms (pure drift; used by tests)
    pub no_noise: bool,
}

impl Default for SviConfig {
    fn default() -> Self {
        SviConfig {
            k: 300,
            alpha: 0.01,
            eta0: 1.0,
            eta1: 1.0,
            epsilon: 0.05,
            mini_batch_size: 50,
            max_iteration: 10_000_000,
            a: 0.01,
            b: 1024.0,
            c: 0.55,
            held_out_ratio: 0.1,
            num_node_sample: 0,
            strategy: Strategy::StratifiedRandomNode,
            num_pieces: 10,
            dkv_type: DkvType::Shared,
            random_seed: 42,
            interval: 10,
            max_pi_cache_entries: 0,
            workers: 1,
            threads: 1,
            replicated_graph: true,
            forced_master_is_worker: false,
            no_noise: false,
        }
    }
}

impl SviConfig {
    pub fn validate(&self) -> Result<(), SviError> {
        if self.k == 0 {
            return Err(SviError::Config("K must be positive".into()));
        }
        if self.eta0 <= 0.0 || self.eta1 <= 0.0 || self.alpha <= 0.0 {
            return Err(SviError::Config("priors must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.epsilon) {
            return Err(SviError::Config("epsilon must lie in (0, 1)".into()));
        }
        if !(0.0..=1.0).contains(&self.held_out_ratio) {
            return Err(SviError::Config("held-out ratio must lie in [0, 1]".into()));
        }
        if self.a <= 0.0 || self.b <= 0.0 || self.c <= 0.5 || self.c > 1.0 {
            return Err(SviError::Config(
                "step size needs a > 0, b > 0 and 0.5 < c <= 1".into(),
            ));
        }
        if self.num_pieces == 0 {
            return Err(SviError::Config("num-pieces must be positive".into()));
        }
        if self.workers == 0 || self.threads == 0 {
            return Err(SviError::Config("workers and threads must be positive".into()));
        }
        if self.interval == 0 {
            return Err(SviError::Config("perplexity interval must be positive".into()));
        }
        Ok(())
    }

    /// Resolved minibatch size for a graph of `n` vertices.
    pub fn resolved_mini_batch_size(&self, n: usize) -> usize {
        if self.mini_batch_size == 0 {
            n / 2
        } else {
            self.mini_batch_size
        }
    }

    /// Resolved neighbour sample count for a graph of `n` vertices.
    pub fn resolved_num_node_sample(&self, n: usize) -> usize {
        if self.num_node_sample == 0 {
            n / 50
        } else {
            self.num_node_sample
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SviConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_step_size_is_rejected() {
        let cfg = SviConfig {
            c: 0.2,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_flags_resolve_from_n() {
        let cfg = SviConfig {
            mini_batch_size: 0,
            num_node_sample: 0,
            ..Default::default()
        };
        assert_eq!(cfg.resolved_mini_batch_size(1000), 500);
        assert_eq!(cfg.resolved_num_node_sample(1000), 20);
    }
}
