//! End-to-end runs of the distributed SVI loop on synthetic graphs:
//! single worker, multi-worker emulated cohorts (replicated and
//! scattered-subgraph modes), seeded reproducibility and the degenerate
//! boundary shapes.

use dkv_store::cohort::local_cohort;
use dkv_store::shared_store::shared_family;
use dkv_store::{Cohort, DkvTransport};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sbm_net::{Edge, EdgeSet, Graph, Network};
use sbm_svi::config::SviConfig;
use sbm_svi::rng::RngFleet;
use sbm_svi::{DistributedSvi, MCMC_NONZERO_GUARD};

fn planted_partition_graph(
    n_per_cluster: usize,
    n_clusters: usize,
    p_in: f64,
    p_out: f64,
    seed: u64,
) -> Graph {
    let n = n_per_cluster * n_clusters;
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut edges = EdgeSet::default();
    for i in 0..n {
        for j in (i + 1)..n {
            let same = i / n_per_cluster == j / n_per_cluster;
            let p = if same { p_in } else { p_out };
            if rng.random::<f64>() < p {
                edges.insert(Edge::new(i as i32, j as i32));
            }
        }
    }
    Graph::from_edges(n, edges)
}

struct RunOutput {
    /// Perplexity checkpoints per rank, in rank order.
    traces: Vec<Vec<f64>>,
    betas: Vec<Vec<f64>>,
}

fn run_cohort(cfg: &SviConfig, graph: &Graph) -> anyhow::Result<RunOutput> {
    let mut partition_rng = RngFleet::graph_init(cfg.random_seed);
    let network = Network::new(graph, cfg.held_out_ratio, cfg.num_pieces, &mut partition_rng)?;

    let transports: Vec<Box<dyn DkvTransport>> = shared_family(cfg.workers, true)
        .into_iter()
        .map(|t| Box::new(t) as Box<dyn DkvTransport>)
        .collect();
    let cohort = local_cohort(cfg.workers);

    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for (handle, transport) in cohort.into_iter().zip(transports) {
            let rank = handle.rank();
            let cfg = cfg.clone();
            let graph_ref = (cfg.replicated_graph || rank == 0).then_some(graph);
            let network_ref = (rank == 0).then_some(&network);
            handles.push(scope.spawn(move || -> anyhow::Result<(Vec<f64>, Vec<f64>)> {
                let mut svi = DistributedSvi::new(cfg, graph_ref, network_ref, handle, transport)?;
                svi.run()?;
                Ok((svi.perplexity_trace().to_vec(), svi.beta().to_vec()))
            }));
        }

        let mut traces = Vec::new();
        let mut betas = Vec::new();
        for h in handles {
            let (trace, beta) = h.join().expect("worker thread panicked")?;
            traces.push(trace);
            betas.push(beta);
        }
        Ok(RunOutput { traces, betas })
    })
}

fn base_config(k: usize) -> SviConfig {
    SviConfig {
        k,
        max_iteration: 60,
        interval: 10,
        num_node_sample: 5,
        mini_batch_size: 20,
        random_seed: 42,
        ..Default::default()
    }
}

#[test]
fn single_worker_perplexity_improves_without_noise() {
    let graph = planted_partition_graph(25, 4, 0.5, 0.02, 7);
    let cfg = SviConfig {
        no_noise: true,
        max_iteration: 120,
        ..base_config(4)
    };
    let out = run_cohort(&cfg, &graph).unwrap();
    let trace = &out.traces[0];

    assert!(trace.len() >= 3);
    assert!(trace.iter().all(|p| p.is_finite() && *p > 0.0));
    let first = trace[0];
    let last = *trace.last().unwrap();
    assert!(
        last < first,
        "perplexity should improve on a planted partition: {first} -> {last}"
    );

    let beta = &out.betas[0];
    assert!(beta.iter().all(|&b| b > 0.0 && b < 1.0));
}

#[test]
fn fixed_seed_reproduces_the_trajectory_bitwise() {
    let graph = planted_partition_graph(20, 3, 0.4, 0.03, 11);
    let cfg = base_config(3);

    let a = run_cohort(&cfg, &graph).unwrap();
    let b = run_cohort(&cfg, &graph).unwrap();

    assert_eq!(a.traces[0].len(), b.traces[0].len());
    for (x, y) in a.traces[0].iter().zip(&b.traces[0]) {
        assert_eq!(x.to_bits(), y.to_bits());
    }
    for (x, y) in a.betas[0].iter().zip(&b.betas[0]) {
        assert_eq!(x.to_bits(), y.to_bits());
    }
}

#[test]
fn emulated_cohort_agrees_across_ranks() {
    let graph = planted_partition_graph(20, 3, 0.4, 0.03, 13);
    let cfg = SviConfig {
        workers: 3,
        forced_master_is_worker: true,
        ..base_config(3)
    };
    let out = run_cohort(&cfg, &graph).unwrap();

    // the all-reduce hands every rank the same checkpoints
    for rank_trace in &out.traces[1..] {
        assert_eq!(rank_trace.len(), out.traces[0].len());
        for (x, y) in rank_trace.iter().zip(&out.traces[0]) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }
    assert!(out.traces[0].iter().all(|p| p.is_finite() && *p > 0.0));
}

#[test]
fn non_replicated_graph_runs_through_subgraph_scatter() {
    let graph = planted_partition_graph(20, 3, 0.4, 0.03, 17);
    let cfg = SviConfig {
        workers: 3,
        replicated_graph: false,
        ..base_config(3)
    };
    let out = run_cohort(&cfg, &graph).unwrap();
    assert!(out.traces[0].iter().all(|p| p.is_finite() && *p > 0.0));
}

#[test]
fn idle_master_cohort_still_converges_structurally() {
    // default: with workers > 1 the master takes no node slice
    let graph = planted_partition_graph(20, 2, 0.4, 0.05, 19);
    let cfg = SviConfig {
        workers: 2,
        ..base_config(2)
    };
    let out = run_cohort(&cfg, &graph).unwrap();
    assert!(out.traces[0].iter().all(|p| p.is_finite() && *p > 0.0));
    assert!(out.betas[0].iter().all(|&b| b > 0.0 && b < 1.0));
}

#[test]
fn boundary_two_vertices_one_community() {
    let mut edges = EdgeSet::default();
    edges.insert(Edge::new(0, 1));
    let graph = Graph::from_edges(2, edges);

    let cfg = SviConfig {
        k: 1,
        held_out_ratio: 0.0,
        max_iteration: 6,
        interval: 2,
        num_node_sample: 1,
        mini_batch_size: 1,
        ..Default::default()
    };
    let out = run_cohort(&cfg, &graph).unwrap();

    // empty held-out set: perplexity reduces to exp(0) = 1
    assert!(out.traces[0].iter().all(|&p| p == 1.0));
    let beta = &out.betas[0];
    assert_eq!(beta.len(), 1);
    assert!(beta[0] > 0.0 && beta[0] < 1.0);
}

#[test]
fn zero_node_sample_degenerates_without_nan() {
    // N below 50 resolves num_node_sample to zero: prior drift plus noise
    let graph = planted_partition_graph(15, 2, 0.5, 0.05, 23);
    let cfg = SviConfig {
        k: 2,
        num_node_sample: 0,
        max_iteration: 12,
        interval: 4,
        mini_batch_size: 10,
        ..Default::default()
    };
    let out = run_cohort(&cfg, &graph).unwrap();
    assert!(out.traces[0].iter().all(|p| p.is_finite() && *p > 0.0));
    assert!(out.betas[0].iter().all(|&b| b >= MCMC_NONZERO_GUARD && b < 1.0));
}
