//! Per-node phi update with stochastic-gradient noise.
//!
//! For a minibatch node `n` and its sampled neighbours, the gradient of
//! the variational objective is accumulated in O(K) per neighbour, then a
//! preconditioned Langevin step with Gaussian noise produces the new phi
//! vector. New values are clamped to a positive floor so later
//! divisions and logs stay finite.

use log::warn;
use sbm_net::Vertex;

use crate::error::SviError;
use crate::learner::MCMC_NONZERO_GUARD;
use crate::rng::SviRng;

/// Inputs shared by every node of one minibatch chunk.
pub struct PhiContext<'a> {
    pub k: usize,
    pub alpha: f64,
    pub epsilon: f64,
    pub beta: &'a [f64],
    pub n_total: usize,
    pub num_node_sample: usize,
    pub eps_t: f64,
    pub no_noise: bool,
}

/// Update phi for one node from its sampled neighbours.
///
/// `pi_node` is the node's K+1 record (membership plus phi_sum);
/// `pi_neighbours[j]` is the record of `neighbours[j]`. `is_link` answers
/// whether the (node, neighbour) pair is a linked edge. The result lands
/// in `phi_out` (length K).
pub fn update_phi_node(
    ctx: &PhiContext,
    node: Vertex,
    pi_node: &[f64],
    neighbours: &[Vertex],
    pi_neighbours: &[&[f64]],
    is_link: impl Fn(Vertex) -> bool,
    rng: &mut SviRng,
    phi_out: &mut [f64],
) -> Result<(), SviError> {
    let k = ctx.k;
    let phi_sum = pi_node[k];
    if !(phi_sum > 0.0) {
        return Err(SviError::Numeric(format!(
            "phi_sum of node {node} is {phi_sum}"
        )));
    }

    let mut grads = vec![0.0; k];
    let mut probs = vec![0.0; k];

    for (ix, &neighbour) in neighbours.iter().enumerate() {
        if neighbour == node {
            warn!("skipping self-loop neighbour draw <{node},{neighbour}>");
            continue;
        }
        let y = is_link(neighbour);
        let pi_nbr = pi_neighbours[ix];

        let e = if y { ctx.epsilon } else { 1.0 - ctx.epsilon };
        let mut prob_sum = 0.0;
        for i in 0..k {
            let f = if y {
                ctx.beta[i] - ctx.epsilon
            } else {
                ctx.epsilon - ctx.beta[i]
            };
            probs[i] = pi_node[i] * (pi_nbr[i] * f + e);
            prob_sum += probs[i];
        }

        for i in 0..k {
            grads[i] += (probs[i] / prob_sum / pi_node[i] - 1.0) / phi_sum;
        }
    }

    // scale to the full graph; a zero sample count degenerates the update
    // to prior drift plus noise
    let nn = if ctx.num_node_sample == 0 {
        0.0
    } else {
        ctx.n_total as f64 / ctx.num_node_sample as f64
    };

    for i in 0..k {
        let phi_k = pi_node[i] * phi_sum;
        let drift = ctx.eps_t / 2.0 * (ctx.alpha - phi_k + nn * grads[i]);
        let noise = if ctx.no_noise {
            0.0
        } else {
            (ctx.eps_t * phi_k).sqrt() * rng.normal()
        };
        let next = (phi_k + drift + noise).abs().max(MCMC_NONZERO_GUARD);
        if !next.is_finite() {
            return Err(SviError::Numeric(format!(
                "phi update of node {node} diverged (component {i})"
            )));
        }
        phi_out[i] = next;
    }

    Ok(())
}

/// Fill a K+1 pi record from a phi vector: normalised memberships followed
/// by the phi sum.
pub fn pi_from_phi(phi: &[f64], record: &mut [f64]) {
    let k = phi.len();
    let phi_sum: f64 = phi.iter().sum();
    for i in 0..k {
        record[i] = phi[i] / phi_sum;
    }
    record[k] = phi_sum;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::RngPurpose;
    use approx::assert_relative_eq;

    fn test_rng() -> SviRng {
        SviRng::new(99, RngPurpose::PhiUpdate, 0, 0, 1)
    }

    fn ctx<'a>(beta: &'a [f64], no_noise: bool, num_node_sample: usize) -> PhiContext<'a> {
        PhiContext {
            k: beta.len(),
            alpha: 0.01,
            epsilon: 0.05,
            beta,
            n_total: 100,
            num_node_sample,
            eps_t: 0.01,
            no_noise,
        }
    }

    #[test]
    fn pi_from_phi_normalises_and_keeps_sum() {
        let phi = [1.0, 3.0];
        let mut record = [0.0; 3];
        pi_from_phi(&phi, &mut record);
        assert_relative_eq!(record[0], 0.25, max_relative = 1e-15);
        assert_relative_eq!(record[1], 0.75, max_relative = 1e-15);
        assert_relative_eq!(record[2], 4.0, max_relative = 1e-15);
    }

    #[test]
    fn noise_free_update_matches_hand_computation() {
        let beta = [0.8, 0.4];
        let c = ctx(&beta, true, 1);
        let pi_node = [0.6, 0.4, 2.0];
        let pi_nbr: &[f64] = &[0.5, 0.5, 1.0];

        let mut phi_out = [0.0; 2];
        update_phi_node(
            &c,
            0,
            &pi_node,
            &[5],
            &[pi_nbr],
            |_| true,
            &mut test_rng(),
            &mut phi_out,
        )
        .unwrap();

        // y = 1: probs[k] = pi_n[k] * (pi_m[k] * (beta[k] - eps) + eps)
        let p0 = 0.6 * (0.5 * (0.8 - 0.05) + 0.05);
        let p1 = 0.4 * (0.5 * (0.4 - 0.05) + 0.05);
        let ps = p0 + p1;
        let g0 = (p0 / ps / 0.6 - 1.0) / 2.0;
        let g1 = (p1 / ps / 0.4 - 1.0) / 2.0;
        let nn: f64 = 100.0;
        let expect0 = (0.6 * 2.0 + 0.005 * (0.01 - 1.2 + nn * g0)).abs();
        let expect1 = (0.4 * 2.0 + 0.005 * (0.01 - 0.8 + nn * g1)).abs();

        assert_relative_eq!(phi_out[0], expect0, max_relative = 1e-12);
        assert_relative_eq!(phi_out[1], expect1, max_relative = 1e-12);
    }

    #[test]
    fn self_neighbour_is_skipped() {
        let beta = [0.5];
        let c = ctx(&beta, true, 1);
        let pi_node = [1.0, 1.5];
        let pi_nbr: &[f64] = &[1.0, 1.5];

        let mut with_self = [0.0; 1];
        update_phi_node(
            &c,
            3,
            &pi_node,
            &[3],
            &[pi_nbr],
            |_| true,
            &mut test_rng(),
            &mut with_self,
        )
        .unwrap();

        // skipped draw leaves only prior drift
        let phi_k: f64 = 1.5;
        let expect = (phi_k + 0.005 * (0.01 - phi_k)).abs();
        assert_relative_eq!(with_self[0], expect, max_relative = 1e-12);
    }

    #[test]
    fn zero_node_sample_does_not_nan() {
        let beta = [0.7, 0.3];
        let c = ctx(&beta, false, 0);
        let pi_node = [0.5, 0.5, 1.0];
        let pi_nbr: &[f64] = &[0.5, 0.5, 1.0];

        let mut phi_out = [0.0; 2];
        update_phi_node(
            &c,
            0,
            &pi_node,
            &[1],
            &[pi_nbr],
            |_| false,
            &mut test_rng(),
            &mut phi_out,
        )
        .unwrap();
        assert!(phi_out.iter().all(|x| x.is_finite() && *x >= MCMC_NONZERO_GUARD));
    }

    #[test]
    fn vanished_phi_sum_is_a_numeric_error() {
        let beta = [0.5];
        let c = ctx(&beta, true, 1);
        let pi_node = [1.0, 0.0];
        let err = update_phi_node(
            &c,
            0,
            &pi_node,
            &[],
            &[],
            |_| false,
            &mut test_rng(),
            &mut [0.0],
        )
        .unwrap_err();
        assert!(matches!(err, SviError::Numeric(_)));
    }
}
