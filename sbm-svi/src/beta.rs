//! Beta/theta update from reduced minibatch gradients.
//!
//! Each worker walks its slice of the minibatch edges, accumulates theta
//! gradients in per-thread buffers, and sums them in thread order. The
//! cohort reduces the buffers to the master, which applies the
//! noise-injected theta step and clamps to the positive floor.

use rayon::prelude::*;
use sbm_net::Vertex;

use crate::error::SviError;
use crate::learner::MCMC_NONZERO_GUARD;
use crate::par::split_ranges;
use crate::rng::SviRng;

/// One scattered minibatch edge with its observation bit.
pub type ObservedEdge = (Vertex, Vertex, bool);

/// Accumulate theta gradients over the local edge slice.
///
/// `pi_of` resolves a node to its cached pi row (the caller bulk-reads the
/// rows of all slice nodes beforehand). Returns a flat K x 2 buffer.
pub fn gradients<F>(
    edges: &[ObservedEdge],
    pi_of: F,
    rows: &[&[f64]],
    theta: &[f64],
    beta: &[f64],
    epsilon: f64,
    threads: usize,
) -> Vec<f64>
where
    F: Fn(Vertex) -> usize + Sync,
{
    let k = beta.len();
    let theta_sum: Vec<f64> = (0..k).map(|i| theta[2 * i] + theta[2 * i + 1]).collect();

    let ranges = split_ranges(edges.len(), threads);
    let mut buffers: Vec<Vec<f64>> = ranges
        .into_par_iter()
        .map(|range| {
            let mut g = vec![0.0; 2 * k];
            let mut probs = vec![0.0; k];
            for e in &edges[range] {
                let (a, b, y) = *e;
                let pi_a = rows[pi_of(a)];
                let pi_b = rows[pi_of(b)];

                let mut pi_sum = 0.0;
                for i in 0..k {
                    let f = pi_a[i] * pi_b[i];
                    pi_sum += f;
                    probs[i] = f * (if y { beta[i] } else { 1.0 - beta[i] });
                }
                let prob_0 = (if y { epsilon } else { 1.0 - epsilon }) * (1.0 - pi_sum);
                let prob_sum: f64 = probs.iter().sum::<f64>() + prob_0;

                let y_f = if y { 1.0 } else { 0.0 };
                for i in 0..k {
                    let f = probs[i] / prob_sum;
                    let inv_sum = 1.0 / theta_sum[i];
                    g[2 * i] += f * ((1.0 - y_f) / theta[2 * i] - inv_sum);
                    g[2 * i + 1] += f * (y_f / theta[2 * i + 1] - inv_sum);
                }
            }
            g
        })
        .collect();

    // fold the per-thread buffers in thread order
    let mut out = buffers.remove(0);
    for g in buffers {
        for (acc, x) in out.iter_mut().zip(g) {
            *acc += x;
        }
    }
    out
}

/// Apply the theta step at the master:
/// `theta = |theta + eps_t/2 (eta - theta + scale * grads) + sqrt(eps_t theta) noise|`.
pub fn update_theta(
    theta: &mut [f64],
    grads: &[f64],
    scale: f64,
    eps_t: f64,
    eta: [f64; 2],
    no_noise: bool,
    rng: &mut SviRng,
) -> Result<(), SviError> {
    let k = theta.len() / 2;
    let noise = rng.normal_matrix(k, 2);
    for i in 0..k {
        for j in 0..2 {
            let ix = 2 * i + j;
            let t = theta[ix];
            let drift = eps_t / 2.0 * (eta[j] - t + scale * grads[ix]);
            let n = if no_noise {
                0.0
            } else {
                (eps_t * t).sqrt() * noise[ix]
            };
            let next = (t + drift + n).abs().max(MCMC_NONZERO_GUARD);
            if !next.is_finite() {
                return Err(SviError::Numeric(format!(
                    "theta update diverged at [{i}][{j}]"
                )));
            }
            theta[ix] = next;
        }
    }
    Ok(())
}
