//! Contiguous work splitting for the rayon loops.
//!
//! The inner loops pin one random stream per work-sharing thread, so items
//! are split into exactly `parts` contiguous ranges (sizes differing by at
//! most one) and range `t` always pairs with stream `t`. That keeps the
//! noise draws reproducible for a fixed thread count.

use std::ops::Range;

/// Split `0..len` into `parts` contiguous ranges; may include empty tails.
pub fn split_ranges(len: usize, parts: usize) -> Vec<Range<usize>> {
    assert!(parts > 0);
    let base = len / parts;
    let extra = len % parts;
    let mut out = Vec::with_capacity(parts);
    let mut start = 0;
    for p in 0..parts {
        let size = base + usize::from(p < extra);
        out.push(start..start + size);
        start += size;
    }
    out
}

/// Carve `data` into per-range mutable slices of `unit` elements per item.
pub fn split_mut<'a, T>(
    mut data: &'a mut [T],
    ranges: &[Range<usize>],
    unit: usize,
) -> Vec<&'a mut [T]> {
    let mut out = Vec::with_capacity(ranges.len());
    for r in ranges {
        let (head, tail) = data.split_at_mut(r.len() * unit);
        out.push(head);
        data = tail;
    }
    assert!(data.is_empty(), "ranges do not cover the buffer");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_cover_without_overlap() {
        let ranges = split_ranges(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
        let ranges = split_ranges(2, 4);
        assert_eq!(ranges, vec![0..1, 1..2, 2..2, 2..2]);
    }

    #[test]
    fn mut_split_matches_ranges() {
        let mut buf = vec![0u32; 20];
        let ranges = split_ranges(10, 3);
        let slices = split_mut(&mut buf, &ranges, 2);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].len(), 8);
        assert_eq!(slices[1].len(), 6);
        assert_eq!(slices[2].len(), 6);
    }
}
