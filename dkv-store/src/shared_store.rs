//! In-process transport for the emulated cohort.
//!
//! All shards live in one address space, partitioned per hosting rank and
//! guarded by per-shard locks. Writers own disjoint key sets by protocol
//! (each worker writes only its own minibatch slice), so lock contention
//! is incidental, not structural. The transport-level barrier is a real
//! rendezvous across the cohort, which makes this the reference
//! implementation for the visibility contract.

use std::sync::{Arc, Barrier, Mutex, OnceLock};

use crate::error::{DkvError, Result};
use crate::store::{owner_of, shard_index, DkvTransport, Key};

struct SharedState {
    cohort_size: usize,
    master_hosts: bool,
    barrier: Barrier,
    /// One record vector per hosting rank, sized on first `init`.
    shards: OnceLock<Vec<Mutex<Vec<f64>>>>,
}

/// Build one connected transport per rank of the cohort.
pub fn shared_family(cohort_size: usize, master_hosts: bool) -> Vec<SharedTransport> {
    let state = Arc::new(SharedState {
        cohort_size,
        master_hosts,
        barrier: Barrier::new(cohort_size),
        shards: OnceLock::new(),
    });
    (0..cohort_size)
        .map(|rank| SharedTransport {
            state: Arc::clone(&state),
            rank,
            value_size: 0,
        })
        .collect()
}

pub struct SharedTransport {
    state: Arc<SharedState>,
    #[allow(dead_code)]
    rank: usize,
    value_size: usize,
}

impl SharedTransport {
    fn shards(&self) -> Result<&Vec<Mutex<Vec<f64>>>> {
        self.state
            .shards
            .get()
            .ok_or_else(|| DkvError::Transport("shared store used before init".into()))
    }

    fn locate(&self, key: Key) -> (usize, usize) {
        let owner = owner_of(key, self.state.cohort_size, self.state.master_hosts);
        let hosting_slot = if self.state.master_hosts {
            owner
        } else {
            owner - 1
        };
        (hosting_slot, shard_index(key, self.state.cohort_size, self.state.master_hosts))
    }
}

impl DkvTransport for SharedTransport {
    fn init(&mut self, value_size: usize, total_values: usize) -> Result<()> {
        self.value_size = value_size;
        let hosts = if self.state.master_hosts {
            self.state.cohort_size
        } else {
            self.state.cohort_size - 1
        };
        let per_shard = total_values.div_ceil(hosts) + 1;
        self.state.shards.get_or_init(|| {
            (0..hosts)
                .map(|_| Mutex::new(vec![0.0; per_shard * value_size]))
                .collect()
        });
        Ok(())
    }

    fn fetch(&mut self, keys: &[Key], out: &mut [f64]) -> Result<()> {
        let vs = self.value_size;
        let shards = self.shards()?;
        for (i, &k) in keys.iter().enumerate() {
            let (slot, ix) = self.locate(k);
            let shard = shards[slot]
                .lock()
                .map_err(|_| DkvError::Transport("poisoned shard lock".into()))?;
            out[i * vs..(i + 1) * vs].copy_from_slice(&shard[ix * vs..(ix + 1) * vs]);
        }
        Ok(())
    }

    fn store(&mut self, keys: &[Key], values: &[f64]) -> Result<()> {
        let vs = self.value_size;
        let shards = self.shards()?;
        for (i, &k) in keys.iter().enumerate() {
            let (slot, ix) = self.locate(k);
            let mut shard = shards[slot]
                .lock()
                .map_err(|_| DkvError::Transport("poisoned shard lock".into()))?;
            shard[ix * vs..(ix + 1) * vs].copy_from_slice(&values[i * vs..(i + 1) * vs]);
        }
        Ok(())
    }

    fn barrier(&mut self) -> Result<()> {
        self.state.barrier.wait();
        Ok(())
    }

    fn include_master(&self) -> bool {
        self.state.master_hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DkvClient, RwMode};

    #[test]
    fn keys_spread_over_hosting_ranks_without_master() {
        let family = shared_family(3, false);
        let t = &family[1];
        let mut slots = [false; 2];
        for k in 0..50 {
            let (slot, _) = t.locate(k);
            slots[slot] = true;
        }
        assert!(slots[0] && slots[1]);
    }

    /// Barrier visibility across two workers (one thread each): worker 0
    /// writes pi[17], both barrier, worker 1 reads the identical bits.
    #[test]
    fn write_barrier_read_is_bit_exact() {
        let mut family = shared_family(2, true);
        let t1 = family.pop().unwrap();
        let t0 = family.pop().unwrap();

        let value: Vec<f64> = vec![0.1, 0.7, 0.2, 5.0e-3];

        let writer = {
            let value = value.clone();
            std::thread::spawn(move || {
                let mut c0 = DkvClient::new(Box::new(t0));
                c0.init(4, 32, 8, 8).unwrap();
                c0.write(&[17], &value).unwrap();
                c0.barrier().unwrap();
            })
        };
        let reader = std::thread::spawn(move || {
            let mut c1 = DkvClient::new(Box::new(t1));
            c1.init(4, 32, 8, 8).unwrap();
            c1.barrier().unwrap();
            let rows = c1.read(&[17], RwMode::ReadOnly).unwrap();
            c1.row(rows.start).to_vec()
        });

        writer.join().unwrap();
        let got = reader.join().unwrap();
        assert!(got.iter().zip(&value).all(|(a, b)| a.to_bits() == b.to_bits()));
    }
}
