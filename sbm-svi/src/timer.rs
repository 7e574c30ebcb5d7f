//! Accumulating wall-clock timers for the pipeline phases.

use std::time::{Duration, Instant};

use log::info;

#[derive(Debug)]
pub struct Timer {
    label: &'static str,
    total: Duration,
    count: u64,
    t0: Option<Instant>,
}

impl Timer {
    pub fn new(label: &'static str) -> Self {
        Timer {
            label,
            total: Duration::ZERO,
            count: 0,
            t0: None,
        }
    }

    pub fn start(&mut self) {
        self.t0 = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        if let Some(t0) = self.t0.take() {
            self.total += t0.elapsed();
            self.count += 1;
        }
    }

    pub fn total_secs(&self) -> f64 {
        self.total.as_secs_f64()
    }

    fn report(&self) {
        let mean_ms = if self.count == 0 {
            0.0
        } else {
            1000.0 * self.total.as_secs_f64() / self.count as f64
        };
        info!(
            "{:<28} total {:>10.3}s  calls {:>8}  mean {:>9.3}ms",
            self.label,
            self.total.as_secs_f64(),
            self.count,
            mean_ms
        );
    }
}

/// One timer per pipeline phase of the iteration loop.
#[derive(Debug)]
pub struct Timers {
    pub populate_pi: Timer,
    pub outer: Timer,
    pub deploy_minibatch: Timer,
    pub sample_minibatch: Timer,
    pub scatter_subgraph: Timer,
    pub sample_neighbours: Timer,
    pub load_pi_minibatch: Timer,
    pub load_pi_neighbour: Timer,
    pub update_phi: Timer,
    pub barrier_phi: Timer,
    pub update_pi: Timer,
    pub barrier_pi: Timer,
    pub update_beta: Timer,
    pub perplexity: Timer,
}

impl Timers {
    pub fn new() -> Self {
        Timers {
            populate_pi: Timer::new("populate pi"),
            outer: Timer::new("iteration"),
            deploy_minibatch: Timer::new("  deploy minibatch"),
            sample_minibatch: Timer::new("    sample_mini_batch"),
            scatter_subgraph: Timer::new("    scatter subgraph"),
            sample_neighbours: Timer::new("    sample neighbours"),
            load_pi_minibatch: Timer::new("    load minibatch pi"),
            load_pi_neighbour: Timer::new("    load neighbour pi"),
            update_phi: Timer::new("    update_phi"),
            barrier_phi: Timer::new("  barrier (phi)"),
            update_pi: Timer::new("  update_pi"),
            barrier_pi: Timer::new("  barrier (pi)"),
            update_beta: Timer::new("  update_beta"),
            perplexity: Timer::new("  perplexity"),
        }
    }

    pub fn report(&self) {
        info!("timing report:");
        for t in [
            &self.populate_pi,
            &self.outer,
            &self.deploy_minibatch,
            &self.sample_minibatch,
            &self.scatter_subgraph,
            &self.sample_neighbours,
            &self.load_pi_minibatch,
            &self.load_pi_neighbour,
            &self.update_phi,
            &self.barrier_phi,
            &self.update_pi,
            &self.barrier_pi,
            &self.update_beta,
            &self.perplexity,
        ] {
            t.report();
        }
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_accumulates_across_starts() {
        let mut t = Timer::new("test");
        t.start();
        t.stop();
        t.start();
        t.stop();
        assert!(t.total_secs() >= 0.0);
        assert_eq!(t.count, 2);
    }

    #[test]
    fn stop_without_start_is_ignored() {
        let mut t = Timer::new("test");
        t.stop();
        assert_eq!(t.count, 0);
    }
}
