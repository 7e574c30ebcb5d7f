//! Generic cache-and-purge client over a pluggable transport.
//!
//! The surrounding iteration loop chunks its working set so that every
//! chunk fits the configured cache; overflowing it is therefore a logic
//! error and fails loudly instead of evicting.

use log::debug;

use crate::error::{DkvError, Result};

/// Store key: a dense vertex id.
pub type Key = i32;

/// Read mode. `ReadWrite` reserves the row for in-place mutation by
/// transports that support flush-back; the SVI loop only ever reads
/// `ReadOnly` and publishes through [`DkvClient::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwMode {
    ReadOnly,
    ReadWrite,
}

/// Which rank owns `key`. When the master hosts no shard, keys spread over
/// ranks `1..cohort_size`.
pub fn owner_of(key: Key, cohort_size: usize, master_hosts: bool) -> usize {
    if master_hosts {
        key as usize % cohort_size
    } else {
        1 + key as usize % (cohort_size - 1)
    }
}

/// Record index within its owner's shard.
pub fn shard_index(key: Key, cohort_size: usize, master_hosts: bool) -> usize {
    let hosts = if master_hosts {
        cohort_size
    } else {
        cohort_size - 1
    };
    key as usize / hosts
}

/// Byte mover for one transport variant. The client layers caching,
/// staging accounting and overflow checks on top.
pub trait DkvTransport: Send {
    fn init(&mut self, value_size: usize, total_values: usize) -> Result<()>;

    /// Fetch records for `keys`; record `i` lands at
    /// `out[i * value_size .. (i + 1) * value_size]`.
    fn fetch(&mut self, keys: &[Key], out: &mut [f64]) -> Result<()>;

    /// Publish records; record `i` is read from the same layout as `fetch`.
    fn store(&mut self, keys: &[Key], values: &[f64]) -> Result<()>;

    /// Global synchronisation: on return, every record stored before any
    /// rank entered the barrier is observable through `fetch`.
    fn barrier(&mut self) -> Result<()>;

    /// Whether rank 0 hosts a shard.
    fn include_master(&self) -> bool;
}

pub struct DkvClient {
    transport: Box<dyn DkvTransport>,
    value_size: usize,
    max_cache_entries: usize,
    max_write_entries: usize,
    cache: Vec<f64>,
    cached: usize,
    staged: usize,
}

impl DkvClient {
    pub fn new(transport: Box<dyn DkvTransport>) -> Self {
        DkvClient {
            transport,
            value_size: 0,
            max_cache_entries: 0,
            max_write_entries: 0,
            cache: Vec::new(),
            cached: 0,
            staged: 0,
        }
    }

    /// Allocate the read cache and write staging area.
    pub fn init(
        &mut self,
        value_size: usize,
        total_values: usize,
        max_cache_entries: usize,
        max_write_entries: usize,
    ) -> Result<()> {
        if value_size == 0 || max_cache_entries == 0 {
            return Err(DkvError::Config(
                "value size and cache capacity must be positive".into(),
            ));
        }
        self.value_size = value_size;
        self.max_cache_entries = max_cache_entries;
        self.max_write_entries = max_write_entries;
        self.cache = vec![0.0; max_cache_entries * value_size];
        self.cached = 0;
        self.staged = 0;
        self.transport.init(value_size, total_values)?;
        debug!(
            "dkv client: {} floats/record, cache {} records, staging {} records",
            value_size, max_cache_entries, max_write_entries
        );
        Ok(())
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    pub fn include_master(&self) -> bool {
        self.transport.include_master()
    }

    /// Resolve `keys` into cache rows. Returns the row index range; rows
    /// stay valid until the next [`purge`](Self::purge).
    pub fn read(&mut self, keys: &[Key], _mode: RwMode) -> Result<std::ops::Range<usize>> {
        if self.cached + keys.len() > self.max_cache_entries {
            return Err(DkvError::BufferOverflow {
                requested: self.cached + keys.len(),
                capacity: self.max_cache_entries,
            });
        }
        let start = self.cached;
        let vs = self.value_size;
        let out = &mut self.cache[start * vs..(start + keys.len()) * vs];
        self.transport.fetch(keys, out)?;
        self.cached += keys.len();
        Ok(start..self.cached)
    }

    /// Row view into the cache; `row` comes from a [`read`](Self::read)
    /// range issued since the last purge.
    pub fn row(&self, row: usize) -> &[f64] {
        debug_assert!(row < self.cached, "stale row handle {row}");
        let vs = self.value_size;
        &self.cache[row * vs..(row + 1) * vs]
    }

    /// Publish records; record `i` of `values` belongs to `keys[i]`.
    /// Visibility at other workers is guaranteed after the next barrier.
    pub fn write(&mut self, keys: &[Key], values: &[f64]) -> Result<()> {
        assert_eq!(values.len(), keys.len() * self.value_size);
        if self.staged + keys.len() > self.max_write_entries {
            return Err(DkvError::BufferOverflow {
                requested: self.staged + keys.len(),
                capacity: self.max_write_entries,
            });
        }
        self.staged += keys.len();
        self.transport.store(keys, values)
    }

    /// Invalidate all read rows and free the staging area.
    pub fn purge(&mut self) {
        self.cached = 0;
        self.staged = 0;
    }

    pub fn barrier(&mut self) -> Result<()> {
        self.transport.barrier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Loop-back transport over a single local vector.
    struct MemTransport {
        value_size: usize,
        data: Vec<f64>,
    }

    impl MemTransport {
        fn new() -> Self {
            MemTransport {
                value_size: 0,
                data: Vec::new(),
            }
        }
    }

    impl DkvTransport for MemTransport {
        fn init(&mut self, value_size: usize, total_values: usize) -> Result<()> {
            self.value_size = value_size;
            self.data = vec![0.0; value_size * total_values];
            Ok(())
        }

        fn fetch(&mut self, keys: &[Key], out: &mut [f64]) -> Result<()> {
            let vs = self.value_size;
            for (i, &k) in keys.iter().enumerate() {
                out[i * vs..(i + 1) * vs]
                    .copy_from_slice(&self.data[k as usize * vs..(k as usize + 1) * vs]);
            }
            Ok(())
        }

        fn store(&mut self, keys: &[Key], values: &[f64]) -> Result<()> {
            let vs = self.value_size;
            for (i, &k) in keys.iter().enumerate() {
                self.data[k as usize * vs..(k as usize + 1) * vs]
                    .copy_from_slice(&values[i * vs..(i + 1) * vs]);
            }
            Ok(())
        }

        fn barrier(&mut self) -> Result<()> {
            Ok(())
        }

        fn include_master(&self) -> bool {
            true
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut client = DkvClient::new(Box::new(MemTransport::new()));
        client.init(3, 10, 4, 4).unwrap();

        client.write(&[2, 5], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        client.purge();

        let rows = client.read(&[5, 2], RwMode::ReadOnly).unwrap();
        assert_eq!(rows, 0..2);
        assert_eq!(client.row(0), &[4.0, 5.0, 6.0]);
        assert_eq!(client.row(1), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn reads_accumulate_until_purge() {
        let mut client = DkvClient::new(Box::new(MemTransport::new()));
        client.init(2, 8, 4, 4).unwrap();

        let first = client.read(&[0, 1], RwMode::ReadOnly).unwrap();
        let second = client.read(&[2, 3], RwMode::ReadOnly).unwrap();
        assert_eq!(first, 0..2);
        assert_eq!(second, 2..4);

        client.purge();
        let again = client.read(&[4], RwMode::ReadOnly).unwrap();
        assert_eq!(again, 0..1);
    }

    #[test]
    fn cache_overflow_fails_loudly() {
        let mut client = DkvClient::new(Box::new(MemTransport::new()));
        client.init(2, 8, 3, 3).unwrap();

        client.read(&[0, 1], RwMode::ReadOnly).unwrap();
        let err = client.read(&[2, 3], RwMode::ReadOnly).unwrap_err();
        assert!(matches!(err, DkvError::BufferOverflow { requested: 4, capacity: 3 }));
    }

    #[test]
    fn write_staging_overflow_fails_loudly() {
        let mut client = DkvClient::new(Box::new(MemTransport::new()));
        client.init(1, 8, 4, 2).unwrap();

        client.write(&[0, 1], &[0.0, 1.0]).unwrap();
        let err = client.write(&[2], &[2.0]).unwrap_err();
        assert!(matches!(err, DkvError::BufferOverflow { .. }));
    }

    #[test]
    fn sharding_rule_with_and_without_master() {
        // master hosts: plain modulo
        assert_eq!(owner_of(17, 4, true), 1);
        assert_eq!(shard_index(17, 4, true), 4);
        // master excluded: ranks 1..4 host
        assert_eq!(owner_of(17, 4, false), 1 + 17 % 3);
        assert_eq!(shard_index(17, 4, false), 17 / 3);
        for k in 0..100 {
            assert_ne!(owner_of(k, 4, false), 0);
        }
    }
}
