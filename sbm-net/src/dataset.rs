//! Dataset loading and the compact on-disk graph form.
//!
//! Two input shapes are accepted: a whitespace-separated edge list
//! (`u v` per line, `#`/`%` comment lines skipped), and a binary form that
//! round-trips byte-for-byte through [`dump_binary`]: a little-endian
//! `i32` vertex count followed, for each vertex, by a count-prefixed
//! sorted list of `i32` neighbour ids.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, Context};
use log::warn;

use crate::edge::{Edge, EdgeSet};
use crate::graph::Graph;

/// Owns the graph; [`crate::network::Network`] and the samplers borrow it.
#[derive(Debug)]
pub struct Dataset {
    pub graph: Graph,
    pub header: String,
}

/// Read a plain-text edge list; `N` is inferred as the largest id plus
/// one. Self-loops are dropped with a warning.
pub fn read_edge_list(path: &Path) -> anyhow::Result<Dataset> {
    let file = File::open(path).with_context(|| format!("open dataset {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut edges = EdgeSet::default();
    let mut max_id: i32 = -1;
    let mut self_loops = 0usize;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read dataset {}", path.display()))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('%') {
            continue;
        }
        let mut it = line.split_whitespace();
        let (a, b) = match (it.next(), it.next()) {
            (Some(a), Some(b)) => (a, b),
            _ => bail!("malformed input: line {} of {}", lineno + 1, path.display()),
        };
        let a: i32 = a
            .parse()
            .with_context(|| format!("malformed vertex id at line {}", lineno + 1))?;
        let b: i32 = b
            .parse()
            .with_context(|| format!("malformed vertex id at line {}", lineno + 1))?;
        if a < 0 || b < 0 {
            bail!("negative vertex id at line {}", lineno + 1);
        }
        if a == b {
            self_loops += 1;
            continue;
        }
        max_id = max_id.max(a).max(b);
        edges.insert(Edge::new(a, b));
    }

    if self_loops > 0 {
        warn!("dropped {} self-loop(s) from {}", self_loops, path.display());
    }
    if edges.is_empty() {
        bail!("dataset {} contains no edges", path.display());
    }

    let n = (max_id + 1) as usize;
    Ok(Dataset {
        graph: Graph::from_edges(n, edges),
        header: path.display().to_string(),
    })
}

fn read_i32<R: Read>(r: &mut R) -> std::io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

/// Load the compact binary form written by [`dump_binary`].
pub fn load_binary(path: &Path) -> anyhow::Result<Dataset> {
    let file = File::open(path).with_context(|| format!("open dump {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let n = read_i32(&mut reader).context("read vertex count")?;
    if n < 0 {
        bail!("malformed input: negative vertex count in {}", path.display());
    }
    let n = n as usize;

    let mut edges = EdgeSet::default();
    for u in 0..n as i32 {
        let count = read_i32(&mut reader)
            .with_context(|| format!("read neighbour count of vertex {u}"))?;
        if count < 0 {
            bail!("malformed input: negative fan-out for vertex {u}");
        }
        let mut prev: i32 = -1;
        for _ in 0..count {
            let v = read_i32(&mut reader)
                .with_context(|| format!("read neighbour of vertex {u}"))?;
            if v < 0 || v as usize >= n {
                bail!("malformed input: neighbour {v} of vertex {u} out of range");
            }
            if v <= prev {
                bail!("malformed input: neighbours of vertex {u} not sorted");
            }
            prev = v;
            if u < v {
                edges.insert(Edge::new(u, v));
            }
        }
    }

    Ok(Dataset {
        graph: Graph::from_edges(n, edges),
        header: path.display().to_string(),
    })
}

/// Dump the graph in the binary form accepted by [`load_binary`]. Dumps of
/// loaded dumps are byte-identical: both sides keep neighbour lists sorted.
pub fn dump_binary(graph: &Graph, path: &Path) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("create dump {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let n = graph.num_nodes();
    writer.write_all(&(n as i32).to_le_bytes())?;
    for v in 0..n as i32 {
        let nbrs = graph.neighbours(v);
        writer.write_all(&(nbrs.len() as i32).to_le_bytes())?;
        for &w in nbrs {
            writer.write_all(&w.to_le_bytes())?;
        }
    }
    writer.flush().context("flush dump")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn reads_edge_list_with_comments_and_self_loops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toy.txt");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "# toy graph").unwrap();
        writeln!(f, "0 1").unwrap();
        writeln!(f, "2 2").unwrap();
        writeln!(f, "1 2").unwrap();
        writeln!(f, "3 0").unwrap();
        drop(f);

        let ds = read_edge_list(&path).unwrap();
        assert_eq!(ds.graph.num_nodes(), 4);
        assert_eq!(ds.graph.num_linked_edges(), 3);
        assert!(ds.graph.contains(&Edge::new(0, 3)));
        assert!(!ds.graph.contains(&Edge::new(2, 3)));
    }

    #[test]
    fn binary_dump_round_trips_bytes() {
        let mut e = EdgeSet::default();
        e.insert(Edge::new(0, 1));
        e.insert(Edge::new(1, 2));
        e.insert(Edge::new(0, 3));
        let graph = Graph::from_edges(5, e);

        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("g1.bin");
        let p2 = dir.path().join("g2.bin");

        dump_binary(&graph, &p1).unwrap();
        let loaded = load_binary(&p1).unwrap();
        assert_eq!(loaded.graph.num_nodes(), 5);
        assert_eq!(loaded.graph.num_linked_edges(), 3);

        dump_binary(&loaded.graph, &p2).unwrap();
        let b1 = std::fs::read(&p1).unwrap();
        let b2 = std::fs::read(&p2).unwrap();
        assert_eq!(b1, b2);
    }

    #[test]
    fn rejects_truncated_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, 7i32.to_le_bytes()).unwrap();
        assert!(load_binary(&path).is_err());
    }
}
