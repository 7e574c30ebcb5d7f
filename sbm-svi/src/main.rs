use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use dkv_store::cohort::local_cohort;
use dkv_store::file_store::FileTransport;
use dkv_store::shared_store::shared_family;
use dkv_store::{Cohort, DkvTransport};
use log::info;

use sbm_net::{dataset, Network, Strategy};
use sbm_svi::config::{DkvType, SviConfig};
use sbm_svi::rng::RngFleet;
use sbm_svi::DistributedSvi;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "kebab-case")]
enum StrategyArg {
    RandomPair,
    RandomNode,
    StratifiedRandomPair,
    StratifiedRandomNode,
}

impl From<&StrategyArg> for Strategy {
    fn from(s: &StrategyArg) -> Strategy {
        match s {
            StrategyArg::RandomPair => Strategy::RandomPair,
            StrategyArg::RandomNode => Strategy::RandomNode,
            StrategyArg::StratifiedRandomPair => Strategy::StratifiedRandomPair,
            StrategyArg::StratifiedRandomNode => Strategy::StratifiedRandomNode,
        }
    }
}

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
enum DkvTypeArg {
    File,
    Shared,
    Rpc,
    Rdma,
}

/// Distributed stochastic variational inference for the assortative
/// mixed-membership stochastic blockmodel on sparse graphs.
#[derive(Parser, Debug)]
#[command(version, about, long_about, term_width = 80)]
struct Cli {
    /// Edge-list dataset (`.bin` loads the compact binary dump format)
    #[arg(long, short = 'f')]
    input_file: PathBuf,

    /// Dump the loaded graph in the binary format and continue
    #[arg(long)]
    dump_file: Option<PathBuf>,

    /// Number of communities
    #[arg(long = "K", short = 'k', default_value_t = 300)]
    k: usize,

    /// Dirichlet prior on the community memberships
    #[arg(long, default_value_t = 0.01)]
    alpha: f64,

    /// Beta prior on the community strengths
    #[arg(long, default_value_t = 1.0)]
    eta0: f64,
    #[arg(long, default_value_t = 1.0)]
    eta1: f64,

    /// Background link probability across communities
    #[arg(long, short = 'e', default_value_t = 0.05)]
    epsilon: f64,

    /// Minibatch size; 0 means N/2
    #[arg(long, short = 'b', default_value_t = 50)]
    mini_batch_size: usize,

    #[arg(long, short = 'x', default_value_t = 10_000_000)]
    max_iteration: u64,

    /// Robbins-Monro step size parameters
    #[arg(long, default_value_t = 0.01)]
    a: f64,
    #[arg(long, default_value_t = 1024.0)]
    b: f64,
    #[arg(long, default_value_t = 0.55)]
    c: f64,

    /// Fraction of the linked edges reserved for held-out and test
    #[arg(long, default_value_t = 0.1)]
    hold_out_prob: f64,

    /// Neighbours sampled per minibatch node; 0 means N/50
    #[arg(long, default_value_t = 0)]
    num_node_sample: usize,

    #[arg(long, value_enum, default_value_t = StrategyArg::StratifiedRandomNode)]
    strategy: StrategyArg,

    /// Non-link partitions per node for stratified-random-node sampling
    #[arg(long, default_value_t = 10)]
    num_pieces: usize,

    #[arg(long, value_enum, default_value_t = DkvTypeArg::Shared)]
    dkv_type: DkvTypeArg,

    /// Shard directory for the file transport
    #[arg(long, default_value = "pi-store")]
    dkv_dir: PathBuf,

    /// Coordinator address for the rpc transport
    #[arg(long, default_value = "localhost:24001")]
    rpc_coordinator: String,

    /// Fabric device for the rdma transport
    #[arg(long, default_value = "mlx5_0")]
    rdma_device: String,
    #[arg(long, default_value_t = 1)]
    rdma_port: u16,

    #[arg(long, default_value_t = 42)]
    random_seed: u64,

    /// Perplexity cadence in iterations
    #[arg(long, short = 'i', default_value_t = 10)]
    interval: u64,

    /// Pi cache capacity in records; 0 derives a default from N
    #[arg(long, default_value_t = 0)]
    max_pi_cache_entries: usize,

    /// Emulated cohort size
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Work-sharing threads inside each worker
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Keep the full graph on every worker
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    replicated_graph: bool,

    /// Give the master a minibatch node slice even when workers > 1
    #[arg(long, default_value_t = false)]
    master_is_worker: bool,

    /// Drop the Gaussian noise terms (pure drift; for debugging)
    #[arg(long, default_value_t = false)]
    no_noise: bool,
}

fn config_from(cli: &Cli) -> SviConfig {
    SviConfig {
        k: cli.k,
        alpha: cli.alpha,
        eta0: cli.eta0,
        eta1: cli.eta1,
        epsilon: cli.epsilon,
        mini_batch_size: cli.mini_batch_size,
        max_iteration: cli.max_iteration,
        a: cli.a,
        b: cli.b,
        c: cli.c,
        held_out_ratio: cli.hold_out_prob,
        num_node_sample: cli.num_node_sample,
        strategy: (&cli.strategy).into(),
        num_pieces: cli.num_pieces,
        dkv_type: match cli.dkv_type {
            DkvTypeArg::File => DkvType::File {
                dir: cli.dkv_dir.clone(),
            },
            DkvTypeArg::Shared => DkvType::Shared,
            DkvTypeArg::Rpc => DkvType::Rpc {
                coordinator: cli.rpc_coordinator.clone(),
            },
            DkvTypeArg::Rdma => DkvType::Rdma {
                device: cli.rdma_device.clone(),
                port: cli.rdma_port,
            },
        },
        random_seed: cli.random_seed,
        interval: cli.interval,
        max_pi_cache_entries: cli.max_pi_cache_entries,
        workers: cli.workers,
        threads: cli.threads,
        replicated_graph: cli.replicated_graph,
        forced_master_is_worker: cli.master_is_worker,
        no_noise: cli.no_noise,
    }
}

/// One connected transport per rank for the configured store type.
fn build_transports(cfg: &SviConfig) -> anyhow::Result<Vec<Box<dyn DkvTransport>>> {
    match &cfg.dkv_type {
        DkvType::Shared => Ok(shared_family(cfg.workers, true)
            .into_iter()
            .map(|t| Box::new(t) as Box<dyn DkvTransport>)
            .collect()),
        DkvType::File { dir } => Ok((0..cfg.workers)
            .map(|rank| {
                Box::new(FileTransport::new(dir.clone(), cfg.workers, rank))
                    as Box<dyn DkvTransport>
            })
            .collect()),
        DkvType::Rpc { coordinator } => {
            bail!("rpc transport (coordinator {coordinator}) is not compiled into this build")
        }
        DkvType::Rdma { device, port } => {
            bail!("rdma transport ({device}:{port}) is not compiled into this build")
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let cfg = config_from(&cli);
    cfg.validate()?;

    let ds = if cli.input_file.extension().is_some_and(|e| e == "bin") {
        dataset::load_binary(&cli.input_file)?
    } else {
        dataset::read_edge_list(&cli.input_file)?
    };
    info!(
        "loaded {}: N {} with {} linked edges",
        ds.header,
        ds.graph.num_nodes(),
        ds.graph.num_linked_edges()
    );
    if let Some(dump) = &cli.dump_file {
        dataset::dump_binary(&ds.graph, dump)
            .with_context(|| format!("dump graph to {}", dump.display()))?;
        info!("dumped graph to {}", dump.display());
    }

    let mut partition_rng = RngFleet::graph_init(cfg.random_seed);
    let network = Network::new(&ds.graph, cfg.held_out_ratio, cfg.num_pieces, &mut partition_rng)?;

    let transports = build_transports(&cfg)?;
    let cohort = local_cohort(cfg.workers);

    let final_ppx = std::thread::scope(|scope| -> anyhow::Result<f64> {
        let mut handles = Vec::new();
        for (handle, transport) in cohort.into_iter().zip(transports) {
            let rank = handle.rank();
            let cfg = cfg.clone();
            let graph = (cfg.replicated_graph || rank == 0).then_some(&ds.graph);
            let network = (rank == 0).then_some(&network);
            handles.push(scope.spawn(move || -> anyhow::Result<f64> {
                let mut svi = DistributedSvi::new(cfg, graph, network, handle, transport)?;
                svi.run()
            }));
        }

        let mut final_ppx = 1.0;
        for (rank, h) in handles.into_iter().enumerate() {
            let ppx = h
                .join()
                .map_err(|_| anyhow::anyhow!("worker {rank} panicked"))??;
            if rank == 0 {
                final_ppx = ppx;
            }
        }
        Ok(final_ppx)
    })?;

    info!("final held-out perplexity: {final_ppx:.12}");
    Ok(())
}
