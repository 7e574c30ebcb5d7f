use std::fmt;

use fnv::{FnvHashMap, FnvHashSet};

/// Dense vertex id in `[0, N)`. Also the key type of the distributed pi store.
pub type Vertex = i32;

/// Undirected edge, canonicalised so that `u < v`.
///
/// Equality and hashing are defined on the ordered pair, so `(3, 7)` and
/// `(7, 3)` are the same edge. Self-loops are never representable; call
/// sites reject `a == b` before construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub u: Vertex,
    pub v: Vertex,
}

impl Edge {
    pub fn new(a: Vertex, b: Vertex) -> Self {
        debug_assert_ne!(a, b, "self-loop edge ({a},{b})");
        if a < b {
            Edge { u: a, v: b }
        } else {
            Edge { u: b, v: a }
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.u, self.v)
    }
}

/// The linked-edge set E, and minibatch draws.
pub type EdgeSet = FnvHashSet<Edge>;

/// Held-out / test map: the value is true iff the entry is a real link.
pub type EdgeMap = FnvHashMap<Edge, bool>;

/// Per-vertex neighbour set, as used by the train link map.
pub type VertexSet = FnvHashSet<Vertex>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_canonicalises() {
        assert_eq!(Edge::new(7, 3), Edge::new(3, 7));
        assert_eq!(Edge::new(3, 7).u, 3);
        assert_eq!(Edge::new(3, 7).v, 7);
    }

    #[test]
    fn edge_set_membership_ignores_order() {
        let mut set = EdgeSet::default();
        set.insert(Edge::new(0, 5));
        assert!(set.contains(&Edge::new(5, 0)));
        assert!(!set.contains(&Edge::new(0, 4)));
    }
}
