//! The per-worker distributed iteration loop.
//!
//! Every rank of the cohort runs this body. One iteration:
//! broadcast theta and recompute beta, optionally evaluate perplexity,
//! deploy a minibatch (node slices, subgraph and observed edges), sample
//! neighbours and update phi, barrier, publish the new pi rows, barrier,
//! then fold the reduced beta gradients into theta at the master. The two
//! barriers enforce that pi written in iteration t is read no earlier
//! than iteration t + 1.

use anyhow::{bail, Context};
use dkv_store::{Cohort, DkvClient, DkvTransport, RwMode};
use fnv::{FnvHashMap, FnvHashSet};
use indicatif::ProgressBar;
use log::{info, warn};
use rayon::prelude::*;
use sbm_net::local_graph::LocalGraph;
use sbm_net::{Edge, EdgeSet, Graph, Network, Vertex};

use crate::beta::{self, ObservedEdge};
use crate::config::SviConfig;
use crate::error::SviError;
use crate::learner::{beta_from_theta, eps_t, PerplexityTrace};
use crate::minibatch::{even_counts, nodes_in_batch, partition_nodes};
use crate::par::{split_mut, split_ranges};
use crate::perplexity::{HeldOutEdge, PerpData};
use crate::phi::{pi_from_phi, update_phi_node, PhiContext};
use crate::rng::{RngFleet, SviRng};
use crate::timer::Timers;

const MASTER: usize = 0;

pub struct DistributedSvi<'a, C: Cohort> {
    cfg: SviConfig,
    /// Full graph; present on every rank in replicated mode, on the master
    /// otherwise.
    graph: Option<&'a Graph>,
    /// Partitioned network; master only.
    network: Option<&'a Network<'a>>,
    cohort: C,
    dkv: DkvClient,
    fleet: RngFleet,
    timers: Timers,

    n: usize,
    k: usize,
    num_node_sample: usize,
    mini_batch_size: usize,
    master_is_worker: bool,
    master_hosts_pi: bool,
    max_minibatch_nodes: usize,
    max_minibatch_chunk: usize,
    write_capacity: usize,

    /// K x 2, row-major; authoritative at the master, broadcast each
    /// iteration.
    theta: Vec<f64>,
    beta: Vec<f64>,
    /// H and T edge keys; replicated so neighbour sampling can reject them.
    excluded: EdgeSet,
    local_graph: LocalGraph,
    /// My minibatch node slice for the current iteration.
    nodes: Vec<Vertex>,
    perp: Option<PerpData>,
    trace: PerplexityTrace,
    step_count: u64,
}

impl<'a, C: Cohort> DistributedSvi<'a, C> {
    pub fn new(
        cfg: SviConfig,
        graph: Option<&'a Graph>,
        network: Option<&'a Network<'a>>,
        cohort: C,
        transport: Box<dyn DkvTransport>,
    ) -> anyhow::Result<Self> {
        cfg.validate()?;
        if cohort.rank() == MASTER && network.is_none() {
            bail!("the master rank needs the partitioned network");
        }
        if cfg.replicated_graph && graph.is_none() {
            bail!("replicated-graph mode needs the graph at every rank");
        }
        let fleet = RngFleet::new(cfg.random_seed, cohort.rank(), cfg.threads);
        let k = cfg.k;
        Ok(DistributedSvi {
            cfg,
            graph,
            network,
            cohort,
            dkv: DkvClient::new(transport),
            fleet,
            timers: Timers::new(),
            n: 0,
            k,
            num_node_sample: 0,
            mini_batch_size: 0,
            master_is_worker: false,
            master_hosts_pi: true,
            max_minibatch_nodes: 0,
            max_minibatch_chunk: 0,
            write_capacity: 0,
            theta: Vec::new(),
            beta: Vec::new(),
            excluded: EdgeSet::default(),
            local_graph: LocalGraph::new(),
            nodes: Vec::new(),
            perp: None,
            trace: PerplexityTrace::new(),
            step_count: 1,
        })
    }

    pub fn perplexity_trace(&self) -> &[f64] {
        self.trace.values()
    }

    pub fn theta(&self) -> &[f64] {
        &self.theta
    }

    pub fn beta(&self) -> &[f64] {
        &self.beta
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Run to convergence or `max_iteration`; returns the final held-out
    /// perplexity.
    pub fn run(&mut self) -> anyhow::Result<f64> {
        self.init()?;

        while self.step_count < self.cfg.max_iteration && !self.trace.converged() {
            self.timers.outer.start();

            // 1. theta reaches every rank; beta is derived locally
            let mut theta = std::mem::take(&mut self.theta);
            self.cohort.broadcast_f64(&mut theta, MASTER)?;
            self.theta = theta;
            self.beta = beta_from_theta(&self.theta, self.k);

            // 2. periodic perplexity over the pre-mutation pi snapshot;
            //    its all-reduce doubles as a barrier
            if (self.step_count - 1) % self.cfg.interval == 0 {
                self.check_perplexity()?;
            }

            // 3. minibatch deployment: node slices, subgraph, edge slices
            self.timers.deploy_minibatch.start();
            let (edge_slice, scale) = self.deploy_mini_batch()?;
            self.timers.deploy_minibatch.stop();

            // 4-6. neighbour sampling and phi updates over this iteration's pi
            let phi_new = self.update_phi()?;

            // 7. everyone finishes reading pi before anyone writes it
            self.timers.barrier_phi.start();
            self.dkv.barrier()?;
            self.cohort.barrier();
            self.timers.barrier_phi.stop();

            // 8. publish pi for my slice
            self.timers.update_pi.start();
            self.update_pi(&phi_new)?;
            self.timers.update_pi.stop();

            // 9. new pi becomes visible to peers
            self.timers.barrier_pi.start();
            self.dkv.barrier()?;
            self.cohort.barrier();
            self.timers.barrier_pi.stop();

            // 10. reduced gradients fold into theta at the master
            self.timers.update_beta.start();
            self.update_beta(&edge_slice, scale)?;
            self.timers.update_beta.stop();

            self.step_count += 1;
            self.timers.outer.stop();
        }

        self.cohort.barrier();
        let final_ppx = self.check_perplexity()?;
        self.cohort.barrier();

        if self.cohort.rank() == MASTER {
            if !self.trace.converged() {
                warn!(
                    "stopped at step {} without meeting the convergence threshold",
                    self.step_count
                );
            }
            self.timers.report();
        }
        Ok(final_ppx)
    }

    fn init(&mut self) -> anyhow::Result<()> {
        let rank = self.cohort.rank();
        let size = self.cohort.size();
        self.master_is_worker = self.cfg.forced_master_is_worker || size == 1;

        // structural info reaches every rank
        let mut head = [0u64; 4];
        if rank == MASTER {
            let net = self.network.expect("master network");
            let n = net.num_nodes();
            self.mini_batch_size = self.cfg.resolved_mini_batch_size(n);
            head = [
                n as u64,
                net.graph().num_linked_edges() as u64,
                net.held_out_size() as u64,
                net.max_minibatch_nodes_for_strategy(self.cfg.strategy, self.mini_batch_size)
                    as u64,
            ];
        }
        self.cohort.broadcast_u64(&mut head, MASTER)?;
        self.n = head[0] as usize;
        let num_links = head[1] as usize;
        let held_out_total = head[2] as usize;
        self.max_minibatch_nodes = head[3] as usize;
        self.mini_batch_size = self.cfg.resolved_mini_batch_size(self.n);
        self.num_node_sample = self.cfg.resolved_num_node_sample(self.n);

        if rank == MASTER {
            let n = self.n as f64;
            info!(
                "N {} links {} link-ratio {:.6e} minibatch {} num_node_sample {} K {} cohort {}",
                self.n,
                num_links,
                num_links as f64 / (n * (n - 1.0) / 2.0),
                self.mini_batch_size,
                self.num_node_sample,
                self.k,
                size,
            );
        }

        self.broadcast_excluded(held_out_total)?;
        let my_held_out = self.scatter_held_out(held_out_total)?;

        // buffer sizing around the pi cache
        let real = self.num_node_sample + 1;
        let workers = if self.master_is_worker { size } else { size - 1 };
        let cache = if self.cfg.max_pi_cache_entries == 0 {
            (2 * self.n).max(1024)
        } else {
            self.cfg.max_pi_cache_entries
        };
        self.max_minibatch_chunk = cache / (1 + real);
        if self.max_minibatch_chunk == 0 {
            return Err(SviError::Config(format!(
                "pi cache of {cache} records cannot hold one node and its {real} neighbours"
            ))
            .into());
        }
        let max_my_nodes = self.max_minibatch_nodes.div_ceil(workers).max(1);
        self.write_capacity = max_my_nodes.max(64);

        // the theta update bulk-reads pi for both endpoints of its slice
        let max_batch_edges = self.max_minibatch_nodes.max(self.mini_batch_size);
        let beta_rows = 2 * max_batch_edges.div_ceil(workers);
        if beta_rows > cache {
            return Err(SviError::Config(format!(
                "pi cache of {cache} records cannot hold the {beta_rows}-row theta update \
                 working set; raise --max-pi-cache-entries"
            ))
            .into());
        }
        let perp_chunk = cache / 2;

        self.dkv
            .init(self.k + 1, self.n, cache, self.write_capacity)
            .context("init pi store")?;
        self.master_hosts_pi = self.dkv.include_master();
        if rank == MASTER {
            info!(
                "master {} a worker, {} pi shards; cache {} records, chunk {} nodes",
                if self.master_is_worker { "is" } else { "is not" },
                if self.master_hosts_pi { "hosts" } else { "does not host" },
                cache,
                self.max_minibatch_chunk,
            );
        }
        self.perp = Some(PerpData::new(my_held_out, perp_chunk));

        self.theta = vec![0.0; 2 * self.k];
        if rank == MASTER {
            self.theta = self
                .fleet
                .theta_init()
                .gamma_matrix(self.cfg.eta0, self.cfg.eta1, self.k, 2);
        }
        self.beta = vec![0.0; self.k];

        self.timers.populate_pi.start();
        self.init_pi()?;
        self.timers.populate_pi.stop();

        self.dkv.barrier()?;
        self.cohort.barrier();
        Ok(())
    }

    /// Replicate the H and T edge keys so every rank can reject them
    /// during neighbour sampling. The maps are small and static.
    fn broadcast_excluded(&mut self, held_out_total: usize) -> anyhow::Result<()> {
        let rank = self.cohort.rank();

        let mut len = [0u64];
        let mut flat: Vec<i32> = Vec::new();
        if rank == MASTER {
            let net = self.network.expect("master network");
            let mut keys: Vec<Edge> = net
                .held_out_map()
                .keys()
                .chain(net.test_map().keys())
                .copied()
                .collect();
            keys.sort_unstable();
            flat = keys.iter().flat_map(|e| [e.u, e.v]).collect();
            len[0] = flat.len() as u64;
        }
        self.cohort.broadcast_u64(&mut len, MASTER)?;
        flat.resize(len[0] as usize, 0);
        self.cohort.broadcast_i32(&mut flat, MASTER)?;

        self.excluded = flat
            .chunks_exact(2)
            .map(|p| Edge::new(p[0], p[1]))
            .collect();
        debug_assert!(rank != MASTER || self.excluded.len() == 2 * held_out_total);
        Ok(())
    }

    /// Pre-shard the held-out entries over all ranks for the evaluator.
    fn scatter_held_out(&mut self, held_out_total: usize) -> anyhow::Result<Vec<HeldOutEdge>> {
        let rank = self.cohort.rank();
        let size = self.cohort.size();

        let base = held_out_total / size;
        let surplus = held_out_total % size;
        let counts: Vec<usize> = (0..size)
            .map(|r| 3 * (base + usize::from(r < surplus)))
            .collect();

        let mut flat: Vec<i32> = Vec::new();
        if rank == MASTER {
            let net = self.network.expect("master network");
            let mut entries: Vec<(Edge, bool)> =
                net.held_out_map().iter().map(|(e, &y)| (*e, y)).collect();
            entries.sort_unstable();
            flat = entries
                .iter()
                .flat_map(|(e, y)| [e.u, e.v, i32::from(*y)])
                .collect();
        }

        let mut recv = vec![0i32; counts[rank]];
        let send = (rank == MASTER).then_some((flat.as_slice(), counts.as_slice()));
        self.cohort.scatterv_i32(send, &mut recv, MASTER)?;

        Ok(recv
            .chunks_exact(3)
            .map(|t| (t[0], t[1], t[2] != 0))
            .collect())
    }

    /// Gamma-initialise phi for the vertices of my stripe and publish the
    /// normalised records.
    fn init_pi(&mut self) -> anyhow::Result<()> {
        let rank = self.cohort.rank();
        let size = self.cohort.size();
        let k = self.k;

        let stripe = (self.n + size - 1 - rank) / size;
        let pb = if rank == MASTER {
            ProgressBar::new(stripe as u64)
        } else {
            ProgressBar::hidden()
        };

        let mut keys: Vec<Vertex> = Vec::with_capacity(self.write_capacity);
        let mut values: Vec<f64> = Vec::with_capacity(self.write_capacity * (k + 1));
        let mut record = vec![0.0; k + 1];

        let mut v = rank;
        while v < self.n {
            let phi = self.fleet.phi_init().gamma_vec(1.0, 1.0, k);
            pi_from_phi(&phi, &mut record);
            keys.push(v as Vertex);
            values.extend_from_slice(&record);
            if keys.len() == self.write_capacity {
                self.dkv.write(&keys, &values)?;
                self.dkv.purge();
                keys.clear();
                values.clear();
            }
            pb.inc(1);
            v += size;
        }
        if !keys.is_empty() {
            self.dkv.write(&keys, &values)?;
            self.dkv.purge();
        }
        pb.finish_and_clear();
        Ok(())
    }

    fn check_perplexity(&mut self) -> anyhow::Result<f64> {
        self.timers.perplexity.start();
        let perp = self.perp.as_mut().expect("initialised");
        let ppx = perp.evaluate(
            &mut self.dkv,
            &self.cohort,
            &self.beta,
            self.cfg.epsilon,
            self.cfg.threads,
        )?;
        self.timers.perplexity.stop();
        self.trace.push(ppx);
        if self.cohort.rank() == MASTER {
            info!(
                "step count: {} perplexity for held out set: {:.12}",
                self.step_count, ppx
            );
        }
        Ok(ppx)
    }

    /// Master samples the minibatch and scatters node slices, the
    /// subgraph (when the graph is not replicated) and the observed edge
    /// slices for the theta update. Returns my edge slice and the scale.
    fn deploy_mini_batch(&mut self) -> anyhow::Result<(Vec<ObservedEdge>, f64)> {
        let rank = self.cohort.rank();
        let size = self.cohort.size();

        let mut scale_buf = [0.0f64];
        let mut subminibatch: Vec<Vec<Vertex>> = Vec::new();
        let mut batch_edges: Vec<(Edge, bool)> = Vec::new();

        let mut node_counts_i32: Vec<i32> = Vec::new();
        if rank == MASTER {
            self.timers.sample_minibatch.start();
            let net = self.network.expect("master network");
            let (batch, scale) = net.sample_mini_batch(
                self.cfg.strategy,
                self.mini_batch_size,
                self.fleet.minibatch().small(),
            );
            self.timers.sample_minibatch.stop();
            scale_buf[0] = scale;

            let nodes = nodes_in_batch(&batch);
            subminibatch =
                partition_nodes(&nodes, size, self.master_is_worker, self.master_hosts_pi);
            node_counts_i32 = subminibatch.iter().map(|s| s.len() as i32).collect();

            let graph = net.graph();
            let mut edges: Vec<Edge> = batch.iter().copied().collect();
            edges.sort_unstable();
            batch_edges = edges.into_iter().map(|e| (e, graph.contains(&e))).collect();
        }

        // node slices
        let mut my_node_count = [0i32];
        self.cohort.scatter_i32(
            (rank == MASTER).then_some(node_counts_i32.as_slice()),
            &mut my_node_count,
            MASTER,
        )?;
        self.nodes.clear();
        self.nodes.resize(my_node_count[0] as usize, 0);

        let flat_nodes: Vec<i32> = subminibatch.concat();
        let node_counts: Vec<usize> = subminibatch.iter().map(Vec::len).collect();
        let send =
            (rank == MASTER).then_some((flat_nodes.as_slice(), node_counts.as_slice()));
        let mut nodes = std::mem::take(&mut self.nodes);
        self.cohort.scatterv_i32(send, &mut nodes, MASTER)?;
        self.nodes = nodes;

        // subgraph, when workers have no graph of their own
        if !self.cfg.replicated_graph {
            self.timers.scatter_subgraph.start();
            self.scatter_subgraph(&subminibatch)?;
            self.timers.scatter_subgraph.stop();
        }

        // observed edge slices for the theta update
        let mut my_edge_units = [0i32];
        let edge_unit_counts: Vec<usize> = if rank == MASTER {
            even_counts(batch_edges.len(), size, self.master_is_worker)
                .into_iter()
                .map(|c| 3 * c)
                .collect()
        } else {
            Vec::new()
        };
        let edge_unit_counts_i32: Vec<i32> =
            edge_unit_counts.iter().map(|&c| c as i32).collect();
        self.cohort.scatter_i32(
            (rank == MASTER).then_some(edge_unit_counts_i32.as_slice()),
            &mut my_edge_units,
            MASTER,
        )?;

        let flat_edges: Vec<i32> = batch_edges
            .iter()
            .flat_map(|(e, y)| [e.u, e.v, i32::from(*y)])
            .collect();
        let mut recv = vec![0i32; my_edge_units[0] as usize];
        let send =
            (rank == MASTER).then_some((flat_edges.as_slice(), edge_unit_counts.as_slice()));
        self.cohort.scatterv_i32(send, &mut recv, MASTER)?;
        let edge_slice: Vec<ObservedEdge> = recv
            .chunks_exact(3)
            .map(|t| (t[0], t[1], t[2] != 0))
            .collect();

        self.cohort.broadcast_f64(&mut scale_buf, MASTER)?;
        Ok((edge_slice, scale_buf[0]))
    }

    /// Marshal the adjacency of every minibatch node and scatter it as a
    /// contiguous subgraph workers index by node-in-slice.
    fn scatter_subgraph(&mut self, subminibatch: &[Vec<Vertex>]) -> anyhow::Result<()> {
        let rank = self.cohort.rank();
        self.local_graph.reset();

        let mut my_sizes = vec![0i32; self.nodes.len()];
        let mut my_adj: Vec<i32>;

        if rank == MASTER {
            let graph = self.network.expect("master network").graph();

            let mut sizes_flat: Vec<i32> = Vec::new();
            let mut size_counts: Vec<usize> = Vec::with_capacity(subminibatch.len());
            for slice in subminibatch {
                size_counts.push(slice.len());
                for &v in slice {
                    sizes_flat.push(graph.fan_out(v) as i32);
                }
            }
            self.cohort.scatterv_i32(
                Some((&sizes_flat, &size_counts)),
                &mut my_sizes,
                MASTER,
            )?;

            let mut adj_flat: Vec<Vertex> = Vec::new();
            let mut adj_counts: Vec<usize> = Vec::with_capacity(subminibatch.len());
            for slice in subminibatch {
                let before = adj_flat.len();
                for &v in slice {
                    graph.marshall_edges_from(v, &mut adj_flat);
                }
                adj_counts.push(adj_flat.len() - before);
            }
            let my_total: usize = my_sizes.iter().map(|&s| s as usize).sum();
            my_adj = vec![0i32; my_total];
            self.cohort
                .scatterv_i32(Some((&adj_flat, &adj_counts)), &mut my_adj, MASTER)?;
        } else {
            self.cohort.scatterv_i32(None, &mut my_sizes, MASTER)?;
            let my_total: usize = my_sizes.iter().map(|&s| s as usize).sum();
            my_adj = vec![0i32; my_total];
            self.cohort.scatterv_i32(None, &mut my_adj, MASTER)?;
        }

        let mut offset = 0;
        for (i, &s) in my_sizes.iter().enumerate() {
            self.local_graph.unmarshall(i, &my_adj[offset..offset + s as usize]);
            offset += s as usize;
        }
        Ok(())
    }

    /// Steps 4-6: sample neighbours, load pi in cache-sized chunks and
    /// compute the new phi vectors for my node slice.
    fn update_phi(&mut self) -> anyhow::Result<Vec<f64>> {
        let k = self.k;
        let real = self.num_node_sample + 1;
        let threads = self.cfg.threads;
        let e_t = eps_t(self.cfg.a, self.cfg.b, self.cfg.c, self.step_count);
        let mut phi_new = vec![0.0; self.nodes.len() * k];

        let mut chunk_start = 0;
        while chunk_start < self.nodes.len() {
            let chunk_len = self.max_minibatch_chunk.min(self.nodes.len() - chunk_start);
            let chunk_nodes = &self.nodes[chunk_start..chunk_start + chunk_len];

            self.timers.load_pi_minibatch.start();
            let node_rows = self.dkv.read(chunk_nodes, RwMode::ReadOnly)?;
            self.timers.load_pi_minibatch.stop();

            self.timers.sample_neighbours.start();
            let mut flat_neighbours = vec![0i32; chunk_len * real];
            {
                let ranges = split_ranges(chunk_len, threads);
                let out_slices = split_mut(&mut flat_neighbours, &ranges, real);
                let rngs = self.fleet.neighbor_slots();
                let n_total = self.n;
                let excluded = &self.excluded;
                ranges
                    .par_iter()
                    .zip(out_slices.into_par_iter())
                    .zip(rngs.par_iter_mut())
                    .for_each(|((range, out), rng)| {
                        for (slot, i) in range.clone().enumerate() {
                            sample_neighbours(
                                chunk_nodes[i],
                                n_total,
                                excluded,
                                rng,
                                &mut out[slot * real..(slot + 1) * real],
                            );
                        }
                    });
            }
            self.timers.sample_neighbours.stop();

            self.timers.load_pi_neighbour.start();
            let nbr_rows = self.dkv.read(&flat_neighbours, RwMode::ReadOnly)?;
            self.timers.load_pi_neighbour.stop();

            self.timers.update_phi.start();
            {
                let dkv = &self.dkv;
                let node_refs: Vec<&[f64]> = node_rows.map(|r| dkv.row(r)).collect();
                let nbr_refs: Vec<&[f64]> = nbr_rows.map(|r| dkv.row(r)).collect();
                let ctx = PhiContext {
                    k,
                    alpha: self.cfg.alpha,
                    epsilon: self.cfg.epsilon,
                    beta: &self.beta,
                    n_total: self.n,
                    num_node_sample: self.num_node_sample,
                    eps_t: e_t,
                    no_noise: self.cfg.no_noise,
                };
                let ranges = split_ranges(chunk_len, threads);
                let phi_slices = split_mut(
                    &mut phi_new[chunk_start * k..(chunk_start + chunk_len) * k],
                    &ranges,
                    k,
                );
                let rngs = self.fleet.phi_update_slots();
                let graph = self.graph;
                let local_graph = &self.local_graph;
                let replicated = self.cfg.replicated_graph;

                let result: Result<Vec<()>, SviError> = ranges
                    .par_iter()
                    .zip(phi_slices.into_par_iter())
                    .zip(rngs.par_iter_mut())
                    .map(|((range, phi_out), rng)| {
                        for (slot, i) in range.clone().enumerate() {
                            let node = chunk_nodes[i];
                            let slice_index = chunk_start + i;
                            let is_link = |m: Vertex| {
                                if replicated {
                                    graph
                                        .expect("replicated graph")
                                        .contains(&Edge::new(node, m))
                                } else {
                                    local_graph.find(slice_index, m)
                                }
                            };
                            update_phi_node(
                                &ctx,
                                node,
                                node_refs[i],
                                &flat_neighbours[i * real..(i + 1) * real],
                                &nbr_refs[i * real..(i + 1) * real],
                                is_link,
                                rng,
                                &mut phi_out[slot * k..(slot + 1) * k],
                            )?;
                        }
                        Ok(())
                    })
                    .collect();
                result?;
            }
            self.timers.update_phi.stop();

            self.dkv.purge();
            chunk_start += chunk_len;
        }
        Ok(phi_new)
    }

    /// Step 8: normalise the new phi vectors and publish the K+1 records.
    fn update_pi(&mut self, phi_new: &[f64]) -> anyhow::Result<()> {
        let k = self.k;
        let mut records = vec![0.0; self.nodes.len() * (k + 1)];
        {
            let ranges = split_ranges(self.nodes.len(), self.cfg.threads);
            let rec_slices = split_mut(&mut records, &ranges, k + 1);
            ranges
                .par_iter()
                .zip(rec_slices.into_par_iter())
                .for_each(|(range, recs)| {
                    for (slot, i) in range.clone().enumerate() {
                        pi_from_phi(
                            &phi_new[i * k..(i + 1) * k],
                            &mut recs[slot * (k + 1)..(slot + 1) * (k + 1)],
                        );
                    }
                });
        }
        self.dkv.write(&self.nodes, &records)?;
        self.dkv.purge();
        Ok(())
    }

    /// Step 10: gradients over my edge slice, reduced to the master, which
    /// applies the theta step.
    fn update_beta(&mut self, edge_slice: &[ObservedEdge], scale: f64) -> anyhow::Result<()> {
        // dense rank over the slice's endpoints
        let mut node_rank: FnvHashMap<Vertex, usize> = FnvHashMap::default();
        let mut slice_nodes: Vec<Vertex> = Vec::new();
        for &(a, b, _) in edge_slice {
            for v in [a, b] {
                if !node_rank.contains_key(&v) {
                    node_rank.insert(v, slice_nodes.len());
                    slice_nodes.push(v);
                }
            }
        }

        let rows = self.dkv.read(&slice_nodes, RwMode::ReadOnly)?;
        let mut grads = {
            let dkv = &self.dkv;
            let row_refs: Vec<&[f64]> = rows.map(|r| dkv.row(r)).collect();
            beta::gradients(
                edge_slice,
                |v| node_rank[&v],
                &row_refs,
                &self.theta,
                &self.beta,
                self.cfg.epsilon,
                self.cfg.threads,
            )
        };
        self.cohort.reduce_sum_f64(&mut grads, MASTER)?;

        if self.cohort.rank() == MASTER {
            let e_t = eps_t(self.cfg.a, self.cfg.b, self.cfg.c, self.step_count);
            beta::update_theta(
                &mut self.theta,
                &grads,
                scale,
                e_t,
                [self.cfg.eta0, self.cfg.eta1],
                self.cfg.no_noise,
                self.fleet.beta_update(),
            )?;
        }
        self.dkv.purge();
        Ok(())
    }
}

/// Draw `out.len()` distinct neighbour ids from `[0, n) \ {node}` whose
/// edge with `node` is not reserved for evaluation. When the valid pool
/// cannot fill the buffer (degenerate graphs), the remainder is padded
/// with `node` itself, which the phi update skips as a self-draw.
fn sample_neighbours(
    node: Vertex,
    n: usize,
    excluded: &EdgeSet,
    rng: &mut SviRng,
    out: &mut [i32],
) {
    let mut seen = FnvHashSet::default();
    let mut filled = 0;
    let mut attempts = 0usize;
    let max_attempts = 200 * (n + out.len());

    while filled < out.len() {
        attempts += 1;
        if attempts > max_attempts {
            log::warn!(
                "neighbour pool of node {node} exhausted after {attempts} draws; padding"
            );
            for slot in out[filled..].iter_mut() {
                *slot = node;
            }
            return;
        }
        let nbr = rng.uniform_int(0, n as i64 - 1) as i32;
        if nbr == node || excluded.contains(&Edge::new(node, nbr)) {
            continue;
        }
        if !seen.insert(nbr) {
            continue;
        }
        out[filled] = nbr;
        filled += 1;
    }
}
