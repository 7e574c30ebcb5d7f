//! Sparse graph store and minibatch sampling for assortative MMSB inference.
//!
//! The dataset owns an immutable [`graph::Graph`]; a [`network::Network`]
//! borrows it, carves out the held-out and test edge maps, and serves
//! stratified minibatches to the inference loop.

/// Canonicalised undirected edges and hash containers over them
pub mod edge;

/// Immutable adjacency store with O(1) edge-membership tests
pub mod graph;

/// Edge-list reader and the compact binary graph format
pub mod dataset;

/// Held-out/test partition and the four minibatch sampling strategies
pub mod network;

/// Per-worker subgraph unmarshalled from a master scatter
pub mod local_graph;

pub use edge::{Edge, EdgeMap, EdgeSet, Vertex};
pub use graph::Graph;
pub use network::{Network, NetworkError, Strategy};
