//! Present-range bookkeeping for cache items.

use serde::{Deserialize, Serialize};

/// Half-open byte interval `[pos, pos + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub pos: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn new(pos: u64, len: u64) -> Self {
        Self { pos, len }
    }

    pub fn end(&self) -> u64 {
        self.pos.saturating_add(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Normalised union of byte ranges: sorted, non-overlapping, non-adjacent.
/// Serialises as the ascending sequence of `{pos, len}` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RangeSet(Vec<ByteRange>);

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// True iff every byte of `r` lies in some stored range. The empty
    /// range is always present.
    pub fn present(&self, r: ByteRange) -> bool {
        if r.is_empty() {
            return true;
        }
        // Normalised ranges never touch, so a contained interval sits
        // inside a single entry.
        self.0.iter().any(|s| s.pos <= r.pos && r.end() <= s.end())
    }

    /// Union with `r`, merging overlapping and adjacent entries.
    pub fn insert(&mut self, r: ByteRange) {
        if r.is_empty() {
            return;
        }
        let mut merged = r;
        let mut out = Vec::with_capacity(self.0.len() + 1);
        for &s in &self.0 {
            if s.end() < merged.pos || merged.end() < s.pos {
                out.push(s);
            } else {
                let pos = merged.pos.min(s.pos);
                let end = merged.end().max(s.end());
                merged = ByteRange::new(pos, end - pos);
            }
        }
        out.push(merged);
        out.sort_by_key(|s| s.pos);
        self.0 = out;
    }

    /// New set containing only the parts of each stored range that fall
    /// within `clip`.
    pub fn intersection(&self, clip: ByteRange) -> RangeSet {
        let mut out = Vec::new();
        for &s in &self.0 {
            let pos = s.pos.max(clip.pos);
            let end = s.end().min(clip.end());
            if pos < end {
                out.push(ByteRange::new(pos, end - pos));
            }
        }
        RangeSet(out)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.0.iter()
    }
}
