//! Inclusive chunk index ranges.

/// An inclusive pair of 16-bit chunk indices. A single chunk is the
/// degenerate range `[i, i]`. Small enough to pass by value everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u16,
    pub end: u16,
}

impl ChunkRange {
    pub fn new(start: u16, end: u16) -> Self {
        ChunkRange { start, end }
    }

    /// Number of chunks covered.
    pub fn len(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        false // an inclusive range always covers at least one chunk
    }

    /// Flatten ranges into the wire form: [s0, e0, s1, e1, ...].
    pub fn flatten(ranges: &[ChunkRange]) -> Vec<u16> {
        let mut flat = Vec::with_capacity(ranges.len() * 2);
        for r in ranges {
            flat.push(r.start);
            flat.push(r.end);
        }
        flat
    }

    /// Rebuild ranges from the wire form. A trailing odd element is dropped.
    pub fn from_flat(flat: &[u16]) -> Vec<ChunkRange> {
        flat.chunks_exact(2)
            .map(|pair| ChunkRange::new(pair[0], pair[1]))
            .collect()
    }
}
