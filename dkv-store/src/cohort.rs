//! MPI-style collectives over the worker cohort.
//!
//! Rank 0 is the master. The [`LocalCohort`] emulates a cohort inside one
//! process: S threads share a mailbox of staging buffers and rendezvous on
//! a barrier, which keeps the core single-binary testable. Reductions sum
//! per-rank slots in rank order, so results are bit-deterministic for a
//! fixed cohort size.

use std::sync::{Arc, Barrier, Mutex};

use crate::error::{DkvError, Result};

/// Collectives available to the iteration loop. Failures surface as
/// [`DkvError::Transport`] and are fatal.
pub trait Cohort: Send {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn barrier(&self);

    /// Root's `buf` is copied into everyone's `buf`; lengths must agree.
    fn broadcast_f64(&self, buf: &mut [f64], root: usize) -> Result<()>;
    fn broadcast_u64(&self, buf: &mut [u64], root: usize) -> Result<()>;
    fn broadcast_i32(&self, buf: &mut [i32], root: usize) -> Result<()>;

    /// Fixed-size scatter: at the root, `send` holds `size * recv.len()`
    /// values; rank r receives block r.
    fn scatter_i32(&self, send: Option<&[i32]>, recv: &mut [i32], root: usize) -> Result<()>;

    /// Variable-size scatter: at the root, `send` is `(flat, counts)` with
    /// `counts.len() == size`. Receivers size `recv` beforehand (counts
    /// travel through a prior [`scatter_i32`]).
    fn scatterv_i32(
        &self,
        send: Option<(&[i32], &[usize])>,
        recv: &mut [i32],
        root: usize,
    ) -> Result<()>;

    /// Element-wise sum over the cohort, result at the root.
    fn reduce_sum_f64(&self, buf: &mut [f64], root: usize) -> Result<()>;

    /// Element-wise sum over the cohort, result at every rank.
    fn all_reduce_sum_f64(&self, buf: &mut [f64]) -> Result<()>;
    fn all_reduce_sum_u64(&self, buf: &mut [u64]) -> Result<()>;
}

struct Mailbox {
    barrier: Barrier,
    f64s: Mutex<Vec<f64>>,
    u64s: Mutex<Vec<u64>>,
    i32s: Mutex<Vec<i32>>,
    counts: Mutex<Vec<usize>>,
    slots_f64: Vec<Mutex<Vec<f64>>>,
    slots_u64: Vec<Mutex<Vec<u64>>>,
}

/// One handle per rank over a process-shared mailbox.
pub struct LocalCohort {
    shared: Arc<Mailbox>,
    rank: usize,
    size: usize,
}

/// Build the S connected cohort handles.
pub fn local_cohort(size: usize) -> Vec<LocalCohort> {
    assert!(size > 0, "cohort must have at least one rank");
    let shared = Arc::new(Mailbox {
        barrier: Barrier::new(size),
        f64s: Mutex::new(Vec::new()),
        u64s: Mutex::new(Vec::new()),
        i32s: Mutex::new(Vec::new()),
        counts: Mutex::new(Vec::new()),
        slots_f64: (0..size).map(|_| Mutex::new(Vec::new())).collect(),
        slots_u64: (0..size).map(|_| Mutex::new(Vec::new())).collect(),
    });
    (0..size)
        .map(|rank| LocalCohort {
            shared: Arc::clone(&shared),
            rank,
            size,
        })
        .collect()
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> Result<std::sync::MutexGuard<'a, T>> {
    m.lock()
        .map_err(|_| DkvError::Transport(format!("poisoned {what} buffer")))
}

impl Cohort for LocalCohort {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn broadcast_f64(&self, buf: &mut [f64], root: usize) -> Result<()> {
        if self.rank == root {
            let mut staged = lock(&self.shared.f64s, "broadcast")?;
            staged.clear();
            staged.extend_from_slice(buf);
        }
        self.barrier();
        if self.rank != root {
            let staged = lock(&self.shared.f64s, "broadcast")?;
            buf.copy_from_slice(&staged);
        }
        self.barrier();
        Ok(())
    }

    fn broadcast_u64(&self, buf: &mut [u64], root: usize) -> Result<()> {
        if self.rank == root {
            let mut staged = lock(&self.shared.u64s, "broadcast")?;
            staged.clear();
            staged.extend_from_slice(buf);
        }
        self.barrier();
        if self.rank != root {
            let staged = lock(&self.shared.u64s, "broadcast")?;
            buf.copy_from_slice(&staged);
        }
        self.barrier();
        Ok(())
    }

    fn broadcast_i32(&self, buf: &mut [i32], root: usize) -> Result<()> {
        if self.rank == root {
            let mut staged = lock(&self.shared.i32s, "broadcast")?;
            staged.clear();
            staged.extend_from_slice(buf);
        }
        self.barrier();
        if self.rank != root {
            let staged = lock(&self.shared.i32s, "broadcast")?;
            buf.copy_from_slice(&staged);
        }
        self.barrier();
        Ok(())
    }

    fn scatter_i32(&self, send: Option<&[i32]>, recv: &mut [i32], root: usize) -> Result<()> {
        if self.rank == root {
            let flat = send.ok_or_else(|| {
                DkvError::Transport("scatter root provided no send buffer".into())
            })?;
            if flat.len() != self.size * recv.len() {
                return Err(DkvError::Transport(format!(
                    "scatter length mismatch: {} != {} * {}",
                    flat.len(),
                    self.size,
                    recv.len()
                )));
            }
            let mut staged = lock(&self.shared.i32s, "scatter")?;
            staged.clear();
            staged.extend_from_slice(flat);
        }
        self.barrier();
        {
            let staged = lock(&self.shared.i32s, "scatter")?;
            let chunk = recv.len();
            recv.copy_from_slice(&staged[self.rank * chunk..(self.rank + 1) * chunk]);
        }
        self.barrier();
        Ok(())
    }

    fn scatterv_i32(
        &self,
        send: Option<(&[i32], &[usize])>,
        recv: &mut [i32],
        root: usize,
    ) -> Result<()> {
        if self.rank == root {
            let (flat, counts) = send.ok_or_else(|| {
                DkvError::Transport("scatterv root provided no send buffer".into())
            })?;
            if counts.len() != self.size || counts.iter().sum::<usize>() != flat.len() {
                return Err(DkvError::Transport("scatterv counts mismatch".into()));
            }
            let mut staged = lock(&self.shared.i32s, "scatterv")?;
            staged.clear();
            staged.extend_from_slice(flat);
            let mut c = lock(&self.shared.counts, "scatterv")?;
            c.clear();
            c.extend_from_slice(counts);
        }
        self.barrier();
        {
            let staged = lock(&self.shared.i32s, "scatterv")?;
            let counts = lock(&self.shared.counts, "scatterv")?;
            if recv.len() != counts[self.rank] {
                return Err(DkvError::Transport(format!(
                    "scatterv recv sized {} but count is {}",
                    recv.len(),
                    counts[self.rank]
                )));
            }
            let displ: usize = counts[..self.rank].iter().sum();
            recv.copy_from_slice(&staged[displ..displ + recv.len()]);
        }
        self.barrier();
        Ok(())
    }

    fn reduce_sum_f64(&self, buf: &mut [f64], root: usize) -> Result<()> {
        {
            let mut slot = lock(&self.shared.slots_f64[self.rank], "reduce slot")?;
            slot.clear();
            slot.extend_from_slice(buf);
        }
        self.barrier();
        if self.rank == root {
            sum_slots_f64(&self.shared, self.size, buf)?;
        }
        self.barrier();
        Ok(())
    }

    fn all_reduce_sum_f64(&self, buf: &mut [f64]) -> Result<()> {
        {
            let mut slot = lock(&self.shared.slots_f64[self.rank], "reduce slot")?;
            slot.clear();
            slot.extend_from_slice(buf);
        }
        self.barrier();
        sum_slots_f64(&self.shared, self.size, buf)?;
        self.barrier();
        Ok(())
    }

    fn all_reduce_sum_u64(&self, buf: &mut [u64]) -> Result<()> {
        {
            let mut slot = lock(&self.shared.slots_u64[self.rank], "reduce slot")?;
            slot.clear();
            slot.extend_from_slice(buf);
        }
        self.barrier();
        {
            buf.fill(0);
            for r in 0..self.size {
                let slot = lock(&self.shared.slots_u64[r], "reduce slot")?;
                for (acc, &x) in buf.iter_mut().zip(slot.iter()) {
                    *acc += x;
                }
            }
        }
        self.barrier();
        Ok(())
    }
}

/// Sum the per-rank slots in rank order; the fixed order keeps floating
/// point reductions identical run to run.
fn sum_slots_f64(shared: &Mailbox, size: usize, buf: &mut [f64]) -> Result<()> {
    buf.fill(0.0);
    for r in 0..size {
        let slot = lock(&shared.slots_f64[r], "reduce slot")?;
        for (acc, &x) in buf.iter_mut().zip(slot.iter()) {
            *acc += x;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_cohort<F>(size: usize, body: F)
    where
        F: Fn(LocalCohort) + Send + Sync + Clone + 'static,
    {
        let handles: Vec<_> = local_cohort(size)
            .into_iter()
            .map(|c| {
                let body = body.clone();
                std::thread::spawn(move || body(c))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn broadcast_reaches_all_ranks() {
        run_cohort(3, |c| {
            let mut buf = if c.rank() == 0 {
                vec![1.5, -2.5, 4.0]
            } else {
                vec![0.0; 3]
            };
            c.broadcast_f64(&mut buf, 0).unwrap();
            assert_eq!(buf, vec![1.5, -2.5, 4.0]);
        });
    }

    #[test]
    fn scatterv_delivers_per_rank_slices() {
        run_cohort(3, |c| {
            let counts = [2usize, 0, 3];
            let flat = [10, 11, 20, 21, 22];
            let mut recv = vec![0i32; counts[c.rank()]];
            let send = (c.rank() == 0).then_some((flat.as_slice(), counts.as_slice()));
            c.scatterv_i32(send, &mut recv, 0).unwrap();
            match c.rank() {
                0 => assert_eq!(recv, vec![10, 11]),
                1 => assert!(recv.is_empty()),
                _ => assert_eq!(recv, vec![20, 21, 22]),
            }
        });
    }

    #[test]
    fn reductions_sum_in_rank_order() {
        run_cohort(4, |c| {
            let mut buf = vec![c.rank() as f64 + 1.0, 10.0];
            c.all_reduce_sum_f64(&mut buf).unwrap();
            assert_eq!(buf, vec![10.0, 40.0]);

            let mut counts = vec![c.rank() as u64];
            c.all_reduce_sum_u64(&mut counts).unwrap();
            assert_eq!(counts, vec![6]);

            let mut g = vec![1.0f64];
            c.reduce_sum_f64(&mut g, 0).unwrap();
            if c.rank() == 0 {
                assert_eq!(g, vec![4.0]);
            }
        });
    }

    #[test]
    fn single_rank_cohort_is_degenerate() {
        run_cohort(1, |c| {
            let mut buf = vec![3.0];
            c.broadcast_f64(&mut buf, 0).unwrap();
            c.all_reduce_sum_f64(&mut buf).unwrap();
            assert_eq!(buf, vec![3.0]);

            let mut recv = vec![0i32; 2];
            c.scatter_i32(Some(&[7, 8]), &mut recv, 0).unwrap();
            assert_eq!(recv, vec![7, 8]);
        });
    }
}
