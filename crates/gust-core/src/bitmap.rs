//! Dense bit set backed by 64-bit words.
//!
//! Tracks a logical `size` alongside the backing words: `size` is the
//! number of addressable bits, and grows when an out-of-bounds index is
//! set. It never shrinks. The per-file chunk progress bitmaps are built
//! on this, so the serialized form is part of the on-disk format:
//! big-endian u64 size followed by big-endian u64 words.

use crate::range::ChunkRange;

const WORD_SIZE: u64 = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    size: u64,
}

impl Bitmap {
    /// A bitmap with `size` addressable bits, all unset.
    pub fn new(size: u64) -> Self {
        let word_count = if size == 0 {
            0
        } else {
            ((size - 1) / WORD_SIZE + 1) as usize
        };
        Bitmap {
            words: vec![0; word_count],
            size,
        }
    }

    /// Number of addressable bits, set and unset.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of set bits.
    pub fn count(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// True if bit `x` is set. Safely false past the end.
    pub fn get(&self, x: u64) -> bool {
        let word = (x / WORD_SIZE) as usize;
        match self.words.get(word) {
            Some(w) => w & (1 << (x % WORD_SIZE)) != 0,
            None => false,
        }
    }

    /// Set bit `x`, growing the bitmap to cover it if needed.
    pub fn set(&mut self, x: u64) {
        let word = (x / WORD_SIZE) as usize;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (x % WORD_SIZE);
        self.size = self.size.max(x + 1);
    }

    /// Clear bit `x`. Out-of-bounds indices are ignored; never shrinks.
    pub fn unset(&mut self, x: u64) {
        let word = (x / WORD_SIZE) as usize;
        if let Some(w) = self.words.get_mut(word) {
            *w &= !(1 << (x % WORD_SIZE));
        }
    }

    /// Set every bit in `[0, size)`.
    pub fn fill(&mut self) {
        if self.size == 0 {
            return;
        }
        let last = ((self.size - 1) / WORD_SIZE) as usize;
        for w in &mut self.words[..last] {
            *w = u64::MAX;
        }
        self.words[last] = Self::tail_mask(self.size);
    }

    /// True iff every bit in `[0, size)` is set. An empty bitmap is full.
    pub fn full(&self) -> bool {
        if self.size == 0 {
            return true;
        }
        let last = ((self.size - 1) / WORD_SIZE) as usize;
        if self.words[..last].iter().any(|w| *w != u64::MAX) {
            return false;
        }
        let mask = Self::tail_mask(self.size);
        self.words[last] & mask == mask
    }

    // Mask of the bits the final word contributes to [0, size).
    fn tail_mask(size: u64) -> u64 {
        let used = (size - 1) % WORD_SIZE + 1;
        if used == WORD_SIZE {
            u64::MAX
        } else {
            (1 << used) - 1
        }
    }

    /// Bitwise union. The result covers the larger of the two sizes.
    pub fn union(&self, other: &Bitmap) -> Bitmap {
        let (shorter, longer) = if self.words.len() < other.words.len() {
            (self, other)
        } else {
            (other, self)
        };
        let mut words = longer.words.clone();
        for (w, s) in words.iter_mut().zip(&shorter.words) {
            *w |= s;
        }
        Bitmap {
            words,
            size: self.size.max(other.size),
        }
    }

    /// Bitwise intersection. The result covers the smaller of the two sizes.
    pub fn intersect(&self, other: &Bitmap) -> Bitmap {
        let (shorter, longer) = if self.words.len() < other.words.len() {
            (self, other)
        } else {
            (other, self)
        };
        let words = shorter
            .words
            .iter()
            .zip(&longer.words)
            .map(|(a, b)| a & b)
            .collect();
        Bitmap {
            words,
            size: self.size.min(other.size),
        }
    }

    /// For each inclusive input range, the maximal runs of set bits within
    /// it, concatenated. Adjacent set bits coalesce; no empty ranges.
    pub fn overlap(&self, ranges: &[ChunkRange]) -> Vec<ChunkRange> {
        let mut result = Vec::new();
        for r in ranges {
            self.filled_runs(u64::from(r.start), u64::from(r.end), &mut result);
        }
        result
    }

    /// The maximal runs of set bits over `[0, size)`.
    pub fn ranges(&self) -> Vec<ChunkRange> {
        let mut result = Vec::new();
        if self.size > 0 {
            self.filled_runs(0, self.size - 1, &mut result);
        }
        result
    }

    // Push every maximal run of set bits within the inclusive window.
    fn filled_runs(&self, start: u64, end: u64, out: &mut Vec<ChunkRange>) {
        let mut run_start: Option<u64> = None;
        for i in start..=end {
            if self.get(i) {
                run_start.get_or_insert(i);
            } else if let Some(s) = run_start.take() {
                out.push(ChunkRange::new(s as u16, (i - 1) as u16));
            }
        }
        if let Some(s) = run_start {
            out.push(ChunkRange::new(s as u16, end as u16));
        }
    }

    /// The maximal runs of unset bits over `[0, size)`.
    pub fn unfilled_ranges(&self) -> Vec<ChunkRange> {
        let mut result = Vec::new();
        let mut run_start: Option<u64> = None;
        for i in 0..self.size {
            if !self.get(i) {
                run_start.get_or_insert(i);
            } else if let Some(s) = run_start.take() {
                result.push(ChunkRange::new(s as u16, (i - 1) as u16));
            }
        }
        if let Some(s) = run_start {
            result.push(ChunkRange::new(s as u16, (self.size - 1) as u16));
        }
        result
    }

    /// The first `count` unset indices, fewer if the bitmap runs out.
    pub fn unfilled_items(&self, count: usize) -> Vec<u16> {
        let mut result = Vec::with_capacity(count);
        for i in 0..self.size {
            if result.len() == count {
                break;
            }
            if !self.get(i) {
                result.push(i as u16);
            }
        }
        result
    }

    /// Big-endian u64 size followed by big-endian u64 words.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.words.len() * 8);
        out.extend_from_slice(&self.size.to_be_bytes());
        for w in &self.words {
            out.extend_from_slice(&w.to_be_bytes());
        }
        out
    }

    /// Inverse of [`serialize`](Self::serialize).
    pub fn deserialize(data: &[u8]) -> Result<Bitmap, BitmapError> {
        if data.len() < 8 || (data.len() - 8) % 8 != 0 {
            return Err(BitmapError::BadLength(data.len()));
        }
        let size = u64::from_be_bytes(data[..8].try_into().unwrap());
        let words = data[8..]
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect();
        Ok(Bitmap { words, size })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BitmapError {
    #[error("bitmap payload must be 8 + 8n bytes, got {0}")]
    BadLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_allocation() {
        assert_eq!(Bitmap::new(128).words.len(), 2);
        assert_eq!(Bitmap::new(129).words.len(), 3);
        assert_eq!(Bitmap::new(0).words.len(), 0);
    }

    #[test]
    fn set_get_unset() {
        let mut b = Bitmap::new(0);
        for x in [0u64, 1, 63, 64, 65, 1000, 99_999] {
            b.set(x);
            assert!(b.get(x), "bit {x} should be set");
            b.unset(x);
            assert!(!b.get(x), "bit {x} should be clear");
        }
    }

    #[test]
    fn set_tracks_size() {
        let mut b = Bitmap::new(0);
        b.set(9);
        assert_eq!(b.size(), 10);
        b.set(3);
        assert_eq!(b.size(), 10, "size never shrinks");
        b.set(200);
        assert_eq!(b.size(), 201);
    }

    #[test]
    fn get_past_end_is_false() {
        let b = Bitmap::new(10);
        assert!(!b.get(10));
        assert!(!b.get(1 << 32));
    }

    #[test]
    fn fill_and_full() {
        // empty bitmap is vacuously full
        let mut b = Bitmap::new(0);
        assert!(b.full());
        b.fill();
        assert!(b.full());

        for size in [1u64, 63, 64, 65, 128, 129] {
            let mut b = Bitmap::new(size);
            assert!(!b.full(), "fresh bitmap of size {size} is not full");
            b.fill();
            assert!(b.full(), "filled bitmap of size {size} is full");
            assert_eq!(b.count(), size);
            for i in 0..size {
                assert!(b.get(i));
            }
            b.unset(size - 1);
            assert!(!b.full());
        }
    }

    #[test]
    fn full_after_growth() {
        let mut b = Bitmap::new(1);
        b.set(0);
        assert!(b.full());
        b.set(15); // grows; bits 1..15 now unset
        assert!(!b.full());
        b.fill();
        assert!(b.full());
    }

    #[test]
    fn union_and_intersect() {
        let mut a = Bitmap::new(0);
        let mut b = Bitmap::new(0);
        for x in [1u64, 5, 70, 200] {
            a.set(x);
        }
        for x in [5u64, 70, 300] {
            b.set(x);
        }

        let union = a.union(&b);
        let intersect = a.intersect(&b);
        for x in 0..=360u64 {
            assert_eq!(union.get(x), a.get(x) || b.get(x), "union bit {x}");
            assert_eq!(intersect.get(x), a.get(x) && b.get(x), "intersect bit {x}");
        }
        assert_eq!(union.size(), 301);
    }

    #[test]
    fn serialize_round_trip() {
        let mut b = Bitmap::new(130);
        for x in [0u64, 64, 65, 129] {
            b.set(x);
        }
        let recovered = Bitmap::deserialize(&b.serialize()).unwrap();
        assert_eq!(recovered.size(), b.size());
        assert_eq!(recovered, b);
    }

    #[test]
    fn serialize_empty_round_trip() {
        let b = Bitmap::new(0);
        let bytes = b.serialize();
        assert_eq!(bytes.len(), 8);
        assert_eq!(Bitmap::deserialize(&bytes).unwrap(), b);
    }

    #[test]
    fn deserialize_rejects_bad_lengths() {
        assert!(matches!(
            Bitmap::deserialize(&[0u8; 7]),
            Err(BitmapError::BadLength(7))
        ));
        assert!(matches!(
            Bitmap::deserialize(&[0u8; 13]),
            Err(BitmapError::BadLength(13))
        ));
    }

    #[test]
    fn ranges_coalesce_adjacent_bits() {
        let mut b = Bitmap::new(10);
        for x in [0u64, 1, 2, 4, 7, 8] {
            b.set(x);
        }
        assert_eq!(
            b.ranges(),
            vec![
                ChunkRange::new(0, 2),
                ChunkRange::new(4, 4),
                ChunkRange::new(7, 8),
            ]
        );
    }

    #[test]
    fn ranges_of_full_bitmap_is_one_run() {
        let mut b = Bitmap::new(200);
        b.fill();
        assert_eq!(b.ranges(), vec![ChunkRange::new(0, 199)]);
    }

    #[test]
    fn overlap_clips_to_requested_windows() {
        let mut b = Bitmap::new(20);
        for x in [2u64, 3, 4, 10, 11, 18] {
            b.set(x);
        }
        let got = b.overlap(&[ChunkRange::new(3, 10), ChunkRange::new(15, 19)]);
        assert_eq!(
            got,
            vec![
                ChunkRange::new(3, 4),
                ChunkRange::new(10, 10),
                ChunkRange::new(18, 18),
            ]
        );
    }

    #[test]
    fn unfilled_ranges_and_items() {
        let mut b = Bitmap::new(8);
        for x in [0u64, 1, 4] {
            b.set(x);
        }
        assert_eq!(
            b.unfilled_ranges(),
            vec![ChunkRange::new(2, 3), ChunkRange::new(5, 7)]
        );
        assert_eq!(b.unfilled_items(3), vec![2, 3, 5]);
        assert_eq!(b.unfilled_items(10), vec![2, 3, 5, 6, 7]);

        let mut full = Bitmap::new(4);
        full.fill();
        assert!(full.unfilled_ranges().is_empty());
        assert!(full.unfilled_items(4).is_empty());
    }
}
