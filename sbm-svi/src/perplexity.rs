//! Chunked held-out perplexity evaluation.
//!
//! Held-out entries are scattered over the cohort once at start-up. Each
//! worker walks its slice in chunks sized to the pi cache, reads the two
//! rows per edge, smooths the per-edge likelihood with a running average
//! over evaluations, and accumulates `(count, sum log p)` separately for
//! links and non-links. An all-reduce folds both pairs; perplexity is
//! `exp(-avg log p)` over everything.

use dkv_store::{Cohort, DkvClient, RwMode};
use log::warn;
use rayon::prelude::*;
use sbm_net::Vertex;

use crate::learner::edge_likelihood;
use crate::par::{split_mut, split_ranges};

/// One held-out entry: endpoints and whether it is a real link.
pub type HeldOutEdge = (Vertex, Vertex, bool);

#[derive(Debug, Default, Clone, Copy)]
struct Accu {
    count: u64,
    log_likelihood: f64,
}

/// This rank's share of the held-out set, with smoothing state.
pub struct PerpData {
    edges: Vec<HeldOutEdge>,
    /// Running-average likelihood per local edge across evaluations.
    ppx_per_edge: Vec<f64>,
    /// Evaluations so far; incremented exactly once per call.
    evaluation_count: u64,
    /// Edges per chunk, sized so 2 * chunk pi rows fit the cache.
    chunk: usize,
}

impl PerpData {
    pub fn new(edges: Vec<HeldOutEdge>, chunk: usize) -> Self {
        let ppx_per_edge = vec![0.0; edges.len()];
        PerpData {
            edges,
            ppx_per_edge,
            evaluation_count: 0,
            chunk: chunk.max(1),
        }
    }

    pub fn local_len(&self) -> usize {
        self.edges.len()
    }

    /// Evaluate perplexity over the whole held-out set. Collective: every
    /// rank must call this in the same iteration. The all-reduce inside
    /// doubles as a barrier, so the caller reads a consistent pi snapshot
    /// as long as no rank has started mutating pi this iteration.
    pub fn evaluate(
        &mut self,
        dkv: &mut DkvClient,
        cohort: &dyn Cohort,
        beta: &[f64],
        epsilon: f64,
        threads: usize,
    ) -> anyhow::Result<f64> {
        self.evaluation_count += 1;
        let c = self.evaluation_count as f64;

        let mut link = Accu::default();
        let mut non_link = Accu::default();

        for chunk_start in (0..self.edges.len()).step_by(self.chunk) {
            let chunk_len = self.chunk.min(self.edges.len() - chunk_start);
            let chunk_edges = &self.edges[chunk_start..chunk_start + chunk_len];

            let keys: Vec<Vertex> = chunk_edges.iter().flat_map(|&(a, b, _)| [a, b]).collect();
            let rows = dkv.read(&keys, RwMode::ReadOnly)?;
            let row_refs: Vec<&[f64]> = rows.clone().map(|r| dkv.row(r)).collect();

            let ranges = split_ranges(chunk_len, threads);
            let ppx_slices = split_mut(
                &mut self.ppx_per_edge[chunk_start..chunk_start + chunk_len],
                &ranges,
                1,
            );

            let partials: Vec<(Accu, Accu)> = ranges
                .par_iter()
                .zip(ppx_slices.into_par_iter())
                .map(|(range, ppx)| {
                    let mut link = Accu::default();
                    let mut non_link = Accu::default();
                    for (slot, i) in range.clone().enumerate() {
                        let (_, _, y) = chunk_edges[i];
                        let pi_a = row_refs[2 * i];
                        let pi_b = row_refs[2 * i + 1];
                        let likelihood = edge_likelihood(pi_a, pi_b, y, beta, epsilon);
                        if !likelihood.is_finite() || likelihood <= 0.0 {
                            let (a, b, _) = chunk_edges[i];
                            warn!("edge likelihood of ({a},{b}) is {likelihood}; skipped");
                            continue;
                        }
                        ppx[slot] = (ppx[slot] * (c - 1.0) + likelihood) / c;
                        debug_assert!(ppx[slot] > 0.0, "negative smoothed likelihood");
                        let accu = if y { &mut link } else { &mut non_link };
                        accu.count += 1;
                        accu.log_likelihood += ppx[slot].ln();
                    }
                    (link, non_link)
                })
                .collect();

            for (l, nl) in partials {
                link.count += l.count;
                link.log_likelihood += l.log_likelihood;
                non_link.count += nl.count;
                non_link.log_likelihood += nl.log_likelihood;
            }

            dkv.purge();
        }

        let mut counts = [link.count, non_link.count];
        let mut sums = [link.log_likelihood, non_link.log_likelihood];
        cohort.all_reduce_sum_u64(&mut counts)?;
        cohort.all_reduce_sum_f64(&mut sums)?;

        let total = counts[0] + counts[1];
        let avg = if total == 0 {
            0.0
        } else {
            (sums[0] + sums[1]) / total as f64
        };
        Ok((-avg).exp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use dkv_store::cohort::local_cohort;
    use dkv_store::shared_store::shared_family;

    fn store_with_pi(pi: &[(Vertex, Vec<f64>)], k: usize) -> DkvClient {
        let mut family = shared_family(1, true);
        let mut client = DkvClient::new(Box::new(family.remove(0)));
        client.init(k + 1, 64, 16, 16).unwrap();
        for (v, row) in pi {
            client.write(&[*v], row).unwrap();
        }
        client.purge();
        client
    }

    /// Four held-out edges with hand-chosen pi and beta reduce to a
    /// reference scalar.
    #[test]
    fn perplexity_matches_reference() {
        let k = 2;
        let beta = vec![0.8, 0.3];
        let epsilon = 0.05;
        let pi = vec![
            (0, vec![0.9, 0.1, 1.0]),
            (1, vec![0.2, 0.8, 1.0]),
            (2, vec![0.5, 0.5, 1.0]),
            (3, vec![0.6, 0.4, 1.0]),
        ];
        let edges: Vec<HeldOutEdge> =
            vec![(0, 1, true), (2, 3, true), (0, 2, false), (1, 3, false)];

        let mut dkv = store_with_pi(&pi, k);
        let cohort = local_cohort(1).remove(0);
        let mut perp = PerpData::new(edges.clone(), 2);

        let got = perp
            .evaluate(&mut dkv, &cohort, &beta, epsilon, 1)
            .unwrap();

        let rows: Vec<&Vec<f64>> = pi.iter().map(|(_, r)| r).collect();
        let mut sum_log = 0.0;
        for &(a, b, y) in &edges {
            sum_log += edge_likelihood(rows[a as usize], rows[b as usize], y, &beta, epsilon).ln();
        }
        let want = (-sum_log / 4.0).exp();
        assert_relative_eq!(got, want, max_relative = 1e-9);
    }

    /// The running average divides by the per-call counter, so evaluating
    /// twice on unchanged pi returns the same perplexity.
    #[test]
    fn repeated_evaluation_is_stable() {
        let k = 1;
        let beta = vec![0.6];
        let pi = vec![(0, vec![1.0, 1.0]), (1, vec![1.0, 1.0])];
        let edges = vec![(0, 1, true)];

        let mut dkv = store_with_pi(&pi, k);
        let cohort = local_cohort(1).remove(0);
        let mut perp = PerpData::new(edges, 4);

        let p1 = perp.evaluate(&mut dkv, &cohort, &beta, 0.05, 1).unwrap();
        let p2 = perp.evaluate(&mut dkv, &cohort, &beta, 0.05, 1).unwrap();
        assert_relative_eq!(p1, p2, max_relative = 1e-12);
        assert_eq!(perp.evaluation_count, 2);
    }

    /// An empty held-out set reduces to exp(0) = 1.
    #[test]
    fn empty_held_out_gives_unit_perplexity() {
        let mut dkv = store_with_pi(&[], 1);
        let cohort = local_cohort(1).remove(0);
        let mut perp = PerpData::new(Vec::new(), 4);
        let p = perp.evaluate(&mut dkv, &cohort, &[0.5], 0.05, 1).unwrap();
        assert_eq!(p, 1.0);
    }
}
