//! Minibatch node partitioning across the cohort.
//!
//! The master extracts the unique node set of a sampled minibatch and
//! splits it over the worker ranks. Slice sizes differ by at most one and
//! never exceed `ceil(|nodes| / workers)`; within that balance, a node
//! goes to the rank that hosts its pi row so the subsequent loads stay
//! local.

use dkv_store::owner_of;
use sbm_net::{EdgeSet, Vertex};

/// Unique nodes of a minibatch, in ascending order.
pub fn nodes_in_batch(batch: &EdgeSet) -> Vec<Vertex> {
    let mut nodes: Vec<Vertex> = batch.iter().flat_map(|e| [e.u, e.v]).collect();
    nodes.sort_unstable();
    nodes.dedup();
    nodes
}

/// Worker ranks in slice-filling order.
fn worker_ranks(cohort_size: usize, master_is_worker: bool) -> Vec<usize> {
    if master_is_worker {
        (0..cohort_size).collect()
    } else {
        (1..cohort_size).collect()
    }
}

/// Even split of `total` items over the workers; surplus goes to the
/// lowest ranks. Non-workers receive zero.
pub fn even_counts(total: usize, cohort_size: usize, master_is_worker: bool) -> Vec<usize> {
    let workers = worker_ranks(cohort_size, master_is_worker);
    let base = total / workers.len();
    let surplus = total % workers.len();
    let mut counts = vec![0usize; cohort_size];
    for (i, &r) in workers.iter().enumerate() {
        counts[r] = base + usize::from(i < surplus);
    }
    counts
}

/// Partition `nodes` into per-rank slices, preferring pi ownership.
///
/// Capacity bookkeeping: with `w` workers, every slice gets at least
/// `floor(n/w)` slots and exactly `n mod w` slices may grow to
/// `ceil(n/w)`; a node claims its owner's slot while that allowance
/// lasts, and spills into the least-filled slice otherwise.
pub fn partition_nodes(
    nodes: &[Vertex],
    cohort_size: usize,
    master_is_worker: bool,
    master_hosts_pi: bool,
) -> Vec<Vec<Vertex>> {
    let workers = worker_ranks(cohort_size, master_is_worker);
    let w = workers.len();
    let base = nodes.len() / w;
    let mut extra = nodes.len() % w;

    let mut slices: Vec<Vec<Vertex>> = vec![Vec::new(); cohort_size];
    let mut spill = Vec::new();

    let try_push = |slices: &mut Vec<Vec<Vertex>>, extra: &mut usize, r: usize, n: Vertex| {
        let len = slices[r].len();
        if len < base {
            slices[r].push(n);
            true
        } else if len == base && *extra > 0 {
            *extra -= 1;
            slices[r].push(n);
            true
        } else {
            false
        }
    };

    for &node in nodes {
        let owner = owner_of(node, cohort_size, master_hosts_pi);
        let eligible = master_is_worker || owner != 0;
        if !(eligible && try_push(&mut slices, &mut extra, owner, node)) {
            spill.push(node);
        }
    }

    for node in spill {
        let target = *workers
            .iter()
            .min_by_key(|&&r| slices[r].len())
            .expect("at least one worker");
        let pushed = try_push(&mut slices, &mut extra, target, node);
        debug_assert!(pushed, "capacity bookkeeping exhausted early");
    }

    slices
}
