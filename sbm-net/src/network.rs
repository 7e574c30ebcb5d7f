//! Held-out/test partitioning and stratified minibatch sampling.
//!
//! The network borrows the immutable graph, carves out the held-out map H
//! and test map T (equal numbers of links and non-links each, disjoint),
//! and maintains the train link map: for every vertex, its linked
//! neighbours excluding endpoints of any H/T edge. All sampling strategies
//! return `(minibatch, scale)` where `scale = 1/h(x)` makes the stochastic
//! gradients unbiased.

use fnv::FnvHashSet;
use log::debug;
use rand::rngs::SmallRng;
use rand::Rng;
use thiserror::Error;

use crate::edge::{Edge, EdgeMap, EdgeSet, Vertex, VertexSet};
use crate::graph::Graph;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error(
        "not enough linked edges to sample from ({links} links, need {need}); \
         use a smaller held-out ratio"
    )]
    NotEnoughLinks { links: usize, need: usize },
}

/// Minibatch sampling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RandomPair,
    RandomNode,
    StratifiedRandomPair,
    StratifiedRandomNode,
}

/// A sampled minibatch with its gradient scale factor `1/h(x)`.
pub type EdgeSample = (EdgeSet, f64);

#[derive(Debug)]
pub struct Network<'g> {
    graph: &'g Graph,
    held_out_map: EdgeMap,
    test_map: EdgeMap,
    /// Linked neighbours per vertex, with H/T endpoints removed.
    train_link_map: Vec<VertexSet>,
    held_out_size: usize,
    num_pieces: usize,
}

impl<'g> Network<'g> {
    /// Partition the graph into train / held-out / test. The target size is
    /// `h = floor(held_out_ratio * |E|)`; H takes `h/2` links and `h/2`
    /// non-links, T takes the same amounts, all mutually disjoint.
    pub fn new(
        graph: &'g Graph,
        held_out_ratio: f64,
        num_pieces: usize,
        rng: &mut SmallRng,
    ) -> Result<Self, NetworkError> {
        let num_links = graph.num_linked_edges();
        let held_out_size = (held_out_ratio * num_links as f64) as usize;
        if held_out_size > num_links {
            return Err(NetworkError::NotEnoughLinks {
                links: num_links,
                need: held_out_size,
            });
        }

        let mut net = Network {
            graph,
            held_out_map: EdgeMap::default(),
            test_map: EdgeMap::default(),
            train_link_map: Vec::new(),
            held_out_size,
            num_pieces,
        };
        net.init_train_link_map();
        net.init_held_out_set(rng)?;
        net.init_test_set(rng);
        debug!(
            "partitioned graph: {} held-out entries, {} test entries",
            net.held_out_map.len(),
            net.test_map.len()
        );
        Ok(net)
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    pub fn num_nodes(&self) -> usize {
        self.graph.num_nodes()
    }

    pub fn held_out_map(&self) -> &EdgeMap {
        &self.held_out_map
    }

    pub fn test_map(&self) -> &EdgeMap {
        &self.test_map
    }

    pub fn held_out_size(&self) -> usize {
        self.held_out_map.len()
    }

    pub fn train_link_map(&self) -> &[VertexSet] {
        &self.train_link_map
    }

    /// True iff the edge is reserved for evaluation (H or T).
    pub fn is_held_out(&self, edge: &Edge) -> bool {
        self.held_out_map.contains_key(edge) || self.test_map.contains_key(edge)
    }

    fn init_train_link_map(&mut self) {
        let n = self.graph.num_nodes();
        let mut map = vec![VertexSet::default(); n];
        for e in self.graph.edges() {
            map[e.u as usize].insert(e.v);
            map[e.v as usize].insert(e.u);
        }
        self.train_link_map = map;
    }

    fn remove_train_link(&mut self, edge: &Edge) {
        self.train_link_map[edge.u as usize].remove(&edge.v);
        self.train_link_map[edge.v as usize].remove(&edge.u);
    }

    /// Draw `count` distinct linked edges by index into the canonical edge
    /// ordering, skipping any edge for which `taken` returns true.
    fn sample_links(
        &self,
        count: usize,
        rng: &mut SmallRng,
        taken: impl Fn(&Network, &Edge) -> bool,
    ) -> Vec<Edge> {
        let edges = self.graph.edges();
        let mut chosen = FnvHashSet::default();
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let ix = rng.random_range(0..edges.len());
            if !chosen.insert(ix) {
                continue;
            }
            let e = edges[ix];
            if taken(self, &e) {
                continue;
            }
            out.push(e);
        }
        out
    }

    /// Reject-sample one non-link edge not yet used anywhere.
    fn sample_non_link_edge(&self, rng: &mut SmallRng) -> Edge {
        let n = self.graph.num_nodes() as i32;
        loop {
            let a = rng.random_range(0..n);
            let b = rng.random_range(0..n);
            if a == b {
                continue;
            }
            let edge = Edge::new(a, b);
            if self.graph.contains(&edge) || self.is_held_out(&edge) {
                continue;
            }
            return edge;
        }
    }

    fn init_held_out_set(&mut self, rng: &mut SmallRng) -> Result<(), NetworkError> {
        let p = self.held_out_size / 2;
        if self.graph.num_linked_edges() < p {
            return Err(NetworkError::NotEnoughLinks {
                links: self.graph.num_linked_edges(),
                need: p,
            });
        }

        for e in self.sample_links(p, rng, |_, _| false) {
            self.held_out_map.insert(e, true);
            self.remove_train_link(&e);
        }
        for _ in 0..p {
            let e = self.sample_non_link_edge(rng);
            self.held_out_map.insert(e, false);
        }
        Ok(())
    }

    fn init_test_set(&mut self, rng: &mut SmallRng) {
        let p = self.held_out_size / 2;

        for e in self.sample_links(p, rng, |net, e| {
            net.held_out_map.contains_key(e) || net.test_map.contains_key(e)
        }) {
            self.test_map.insert(e, true);
            self.remove_train_link(&e);
        }
        for _ in 0..p {
            let e = self.sample_non_link_edge(rng);
            self.test_map.insert(e, false);
        }
    }

    /// Draw one minibatch with the given strategy; see the per-strategy
    /// methods for the scale factors.
    pub fn sample_mini_batch(
        &self,
        strategy: Strategy,
        mini_batch_size: usize,
        rng: &mut SmallRng,
    ) -> EdgeSample {
        match strategy {
            Strategy::RandomPair => self.random_pair_sampling(mini_batch_size, rng),
            Strategy::RandomNode => self.random_node_sampling(rng),
            Strategy::StratifiedRandomPair => {
                self.stratified_random_pair_sampling(mini_batch_size, rng)
            }
            Strategy::StratifiedRandomNode => self.stratified_random_node_sampling(rng),
        }
    }

    /// Uniform pair sampling: `b` distinct edges not in H, T or the batch.
    /// Scale: `N(N-1) / 2b`.
    fn random_pair_sampling(&self, mini_batch_size: usize, rng: &mut SmallRng) -> EdgeSample {
        let n = self.graph.num_nodes();
        let mut batch = EdgeSet::default();
        while batch.len() < mini_batch_size {
            let a = rng.random_range(0..n as i32);
            let b = rng.random_range(0..n as i32);
            if a == b {
                continue;
            }
            let edge = Edge::new(a, b);
            if self.is_held_out(&edge) || batch.contains(&edge) {
                continue;
            }
            batch.insert(edge);
        }
        let scale = (n * (n - 1)) as f64 / (2 * mini_batch_size) as f64;
        (batch, scale)
    }

    /// All pairs incident to one uniformly drawn node. Scale: `N`.
    fn random_node_sampling(&self, rng: &mut SmallRng) -> EdgeSample {
        let n = self.graph.num_nodes();
        let node = rng.random_range(0..n as i32);
        let mut batch = EdgeSet::default();
        for other in 0..n as i32 {
            if other == node {
                continue;
            }
            let edge = Edge::new(node, other);
            if self.is_held_out(&edge) {
                continue;
            }
            batch.insert(edge);
        }
        (batch, n as f64)
    }

    /// Coin flip between a link-only and a non-link-only batch of size `b`.
    /// Scale: `|E|/b` for links, `N(N-1)/2 - |E|/b` for non-links.
    fn stratified_random_pair_sampling(
        &self,
        mini_batch_size: usize,
        rng: &mut SmallRng,
    ) -> EdgeSample {
        let n = self.graph.num_nodes();
        let num_links = self.graph.num_linked_edges();
        let flag = rng.random_range(0..2u32);

        if flag == 1 {
            let count = mini_batch_size.min(num_links);
            let links = self.sample_links(count, rng, |net, e| net.is_held_out(e));
            let batch: EdgeSet = links.into_iter().collect();
            (batch, num_links as f64 / mini_batch_size as f64)
        } else {
            let mut batch = EdgeSet::default();
            while batch.len() < mini_batch_size {
                let a = rng.random_range(0..n as i32);
                let b = rng.random_range(0..n as i32);
                if a == b {
                    continue;
                }
                let edge = Edge::new(a, b);
                if self.graph.contains(&edge) || self.is_held_out(&edge) || batch.contains(&edge)
                {
                    continue;
                }
                batch.insert(edge);
            }
            let scale =
                (n * (n - 1) / 2) as f64 - num_links as f64 / mini_batch_size as f64;
            (batch, scale)
        }
    }

    /// Stratified node sampling: pick a node, then with equal probability
    /// either return all of its training links (scale `N`) or reject-sample
    /// `(N - fan_out) / num_pieces` of its non-links (scale `N * num_pieces`).
    fn stratified_random_node_sampling(&self, rng: &mut SmallRng) -> EdgeSample {
        let n = self.graph.num_nodes();
        let node = rng.random_range(0..n as i32);
        let flag = rng.random_range(0..2u32);

        let mut batch = EdgeSet::default();

        if flag == 1 {
            for &nbr in &self.train_link_map[node as usize] {
                batch.insert(Edge::new(node, nbr));
            }
            (batch, n as f64)
        } else {
            let target = (n - self.graph.fan_out(node)) / self.num_pieces;
            let mut remaining = target;
            while remaining > 0 {
                // Sparsity makes twice the target draws very likely to
                // contain enough valid neighbours; trim at the target.
                for _ in 0..2 * target {
                    if remaining == 0 {
                        break;
                    }
                    let nbr = rng.random_range(0..n as i32);
                    if nbr == node {
                        continue;
                    }
                    let edge = Edge::new(node, nbr);
                    if self.graph.contains(&edge)
                        || self.is_held_out(&edge)
                        || batch.contains(&edge)
                    {
                        continue;
                    }
                    batch.insert(edge);
                    remaining -= 1;
                }
            }
            (batch, (n * self.num_pieces) as f64)
        }
    }

    /// Tight upper bound on the number of distinct nodes a minibatch of the
    /// given strategy can touch; sizes the distributed pi buffers.
    pub fn max_minibatch_nodes_for_strategy(
        &self,
        strategy: Strategy,
        mini_batch_size: usize,
    ) -> usize {
        let n = self.graph.num_nodes();
        match strategy {
            Strategy::RandomPair | Strategy::StratifiedRandomPair => 2 * mini_batch_size,
            Strategy::RandomNode => n,
            Strategy::StratifiedRandomNode => {
                let mut worst = 0usize;
                for v in 0..n as i32 {
                    let link_branch = self.train_link_map[v as usize].len();
                    let non_link_branch = (n - self.graph.fan_out(v)) / self.num_pieces;
                    worst = worst.max(link_branch.max(non_link_branch));
                }
                worst + 1
            }
        }
    }
}
