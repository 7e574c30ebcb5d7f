//! File-backed transport: one record file per hosting rank under a shared
//! directory. Every rank reaches every shard through the filesystem, so
//! the master always hosts. Suited to single-process runs and tests; a
//! networked fabric replaces it at scale.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::debug;

use crate::error::{DkvError, Result};
use crate::store::{owner_of, shard_index, DkvTransport, Key};

pub struct FileTransport {
    dir: PathBuf,
    cohort_size: usize,
    rank: usize,
    value_size: usize,
    shards: Vec<Option<File>>,
    byte_buf: Vec<u8>,
}

impl FileTransport {
    pub fn new(dir: PathBuf, cohort_size: usize, rank: usize) -> Self {
        FileTransport {
            dir,
            cohort_size,
            rank,
            value_size: 0,
            shards: Vec::new(),
            byte_buf: Vec::new(),
        }
    }

    fn shard_path(&self, owner: usize) -> PathBuf {
        self.dir.join(format!("pi-shard-{owner}.bin"))
    }

    fn shard_file(&mut self, owner: usize) -> Result<&mut File> {
        if self.shards[owner].is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(self.shard_path(owner))
                .map_err(|e| DkvError::Transport(format!("open shard {owner}: {e}")))?;
            self.shards[owner] = Some(file);
        }
        Ok(self.shards[owner].as_mut().unwrap())
    }

    fn record_len(&self) -> usize {
        self.value_size * std::mem::size_of::<f64>()
    }
}

impl DkvTransport for FileTransport {
    fn init(&mut self, value_size: usize, total_values: usize) -> Result<()> {
        self.value_size = value_size;
        self.shards = (0..self.cohort_size).map(|_| None).collect();
        self.byte_buf = vec![0u8; self.record_len()];

        // every rank lays the files out; creation is idempotent and the
        // lengths agree, so concurrent initialisation is harmless
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| DkvError::Transport(format!("create {}: {e}", self.dir.display())))?;
        let per_shard = total_values.div_ceil(self.cohort_size) + 1;
        for owner in 0..self.cohort_size {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.shard_path(owner))
                .map_err(|e| DkvError::Transport(format!("create shard {owner}: {e}")))?;
            file.set_len((per_shard * self.record_len()) as u64)
                .map_err(|e| DkvError::Transport(format!("size shard {owner}: {e}")))?;
            self.shards[owner] = Some(file);
        }
        if self.rank == 0 {
            debug!(
                "file dkv: {} shards of {} records under {}",
                self.cohort_size,
                per_shard,
                self.dir.display()
            );
        }
        Ok(())
    }

    fn fetch(&mut self, keys: &[Key], out: &mut [f64]) -> Result<()> {
        let vs = self.value_size;
        let rec = self.record_len();
        for (i, &k) in keys.iter().enumerate() {
            let owner = owner_of(k, self.cohort_size, true);
            let offset = (shard_index(k, self.cohort_size, true) * rec) as u64;
            let mut buf = std::mem::take(&mut self.byte_buf);
            {
                let file = self.shard_file(owner)?;
                file.seek(SeekFrom::Start(offset))
                    .map_err(|e| DkvError::Transport(format!("seek key {k}: {e}")))?;
                file.read_exact(&mut buf)
                    .map_err(|e| DkvError::Transport(format!("read key {k}: {e}")))?;
            }
            for (j, chunk) in buf.chunks_exact(8).enumerate() {
                out[i * vs + j] = f64::from_le_bytes(chunk.try_into().unwrap());
            }
            self.byte_buf = buf;
        }
        Ok(())
    }

    fn store(&mut self, keys: &[Key], values: &[f64]) -> Result<()> {
        let vs = self.value_size;
        let rec = self.record_len();
        for (i, &k) in keys.iter().enumerate() {
            let owner = owner_of(k, self.cohort_size, true);
            let offset = (shard_index(k, self.cohort_size, true) * rec) as u64;
            let mut buf = std::mem::take(&mut self.byte_buf);
            for (j, &x) in values[i * vs..(i + 1) * vs].iter().enumerate() {
                buf[j * 8..(j + 1) * 8].copy_from_slice(&x.to_le_bytes());
            }
            {
                let file = self.shard_file(owner)?;
                file.seek(SeekFrom::Start(offset))
                    .map_err(|e| DkvError::Transport(format!("seek key {k}: {e}")))?;
                file.write_all(&buf)
                    .map_err(|e| DkvError::Transport(format!("write key {k}: {e}")))?;
            }
            self.byte_buf = buf;
        }
        Ok(())
    }

    fn barrier(&mut self) -> Result<()> {
        // durability stands in for visibility: a single process (or a
        // shared filesystem) observes flushed writes after this returns
        for file in self.shards.iter_mut().flatten() {
            file.flush()
                .map_err(|e| DkvError::Transport(format!("flush shard: {e}")))?;
            file.sync_data()
                .map_err(|e| DkvError::Transport(format!("sync shard: {e}")))?;
        }
        Ok(())
    }

    fn include_master(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DkvClient, RwMode};

    #[test]
    fn file_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = DkvClient::new(Box::new(FileTransport::new(
            dir.path().to_path_buf(),
            1,
            0,
        )));
        client.init(4, 16, 8, 8).unwrap();

        let record: Vec<f64> = vec![0.25, 0.5, 0.125, 8.0];
        client.write(&[11], &record).unwrap();
        client.barrier().unwrap();
        client.purge();

        let rows = client.read(&[11], RwMode::ReadOnly).unwrap();
        assert_eq!(client.row(rows.start), &record[..]);
    }

    #[test]
    fn file_store_shards_by_key() {
        let dir = tempfile::tempdir().unwrap();
        // two hosting ranks in one process: both clients see both files
        let mut c0 = DkvClient::new(Box::new(FileTransport::new(dir.path().to_path_buf(), 2, 0)));
        c0.init(2, 8, 8, 8).unwrap();
        let mut c1 = DkvClient::new(Box::new(FileTransport::new(dir.path().to_path_buf(), 2, 1)));
        c1.init(2, 8, 8, 8).unwrap();

        c0.write(&[3], &[3.0, 30.0]).unwrap();
        c0.barrier().unwrap();

        let rows = c1.read(&[3], RwMode::ReadOnly).unwrap();
        assert_eq!(c1.row(rows.start), &[3.0, 30.0]);
    }
}
