//! Per-worker subgraph for non-replicated runs.
//!
//! When the full graph lives only at the master, each worker receives the
//! adjacency of its minibatch node slice as a flat scatter and unmarshalls
//! it here. Lookups are by node-in-slice index, not vertex id.

use crate::edge::{Vertex, VertexSet};

#[derive(Debug, Default)]
pub struct LocalGraph {
    linked: Vec<VertexSet>,
}

impl LocalGraph {
    pub fn new() -> Self {
        LocalGraph { linked: Vec::new() }
    }

    /// Drop all slices from the previous minibatch.
    pub fn reset(&mut self) {
        self.linked.clear();
    }

    /// Install the neighbour set of the `index`-th node in this worker's
    /// slice from a marshalled adjacency run.
    pub fn unmarshall(&mut self, index: usize, neighbours: &[Vertex]) {
        if self.linked.len() <= index {
            self.linked.resize_with(index + 1, VertexSet::default);
        }
        let set = &mut self.linked[index];
        set.clear();
        set.extend(neighbours.iter().copied());
    }

    /// Is `neighbour` linked to the `index`-th node of the slice?
    pub fn find(&self, index: usize, neighbour: Vertex) -> bool {
        self.linked[index].contains(&neighbour)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmarshall_and_find() {
        let mut lg = LocalGraph::new();
        lg.unmarshall(0, &[1, 4, 9]);
        lg.unmarshall(1, &[0]);
        assert!(lg.find(0, 4));
        assert!(!lg.find(0, 5));
        assert!(lg.find(1, 0));

        lg.reset();
        lg.unmarshall(0, &[2]);
        assert!(lg.find(0, 2));
        assert!(!lg.find(0, 4));
    }
}
