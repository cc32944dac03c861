//! # Keys, Ranges, and Scan Direction
//!
//! Keys are opaque, totally ordered byte sequences. A [`KeyRange`] is a pair
//! of [`Bound`]s over them; the traversal walks qualifying keys ascending for
//! [`Direction::Forward`] and descending for [`Direction::Backward`].
//!
//! ## Truncated Keys
//!
//! Secondary-index keys may be truncated representations of a richer value.
//! A key of exactly [`MAX_TRUNCATED_KEY_LEN`] bytes must be treated as a
//! *prefix*: every key it is a prefix of compares as potentially equal for
//! range-boundary purposes. Producers truncate with [`truncate_key`];
//! consumers check [`is_truncated`] before trusting an exact boundary
//! comparison.

use std::ops::Bound;

/// Continuation signal returned by every per-row callback and propagated up
/// through the traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Abort,
}

impl Flow {
    pub fn is_abort(self) -> bool {
        self == Flow::Abort
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Maximum length of a truncated secondary-index key. A key of exactly this
/// length is assumed truncated and compares as a prefix.
pub const MAX_TRUNCATED_KEY_LEN: usize = 125;

pub fn truncate_key(key: &[u8]) -> &[u8] {
    &key[..key.len().min(MAX_TRUNCATED_KEY_LEN)]
}

pub fn is_truncated(key: &[u8]) -> bool {
    key.len() >= MAX_TRUNCATED_KEY_LEN
}

/// Half-open, closed, or unbounded range over byte keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
}

impl KeyRange {
    pub fn new(start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Self {
        Self { start, end }
    }

    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// Both endpoints included.
    pub fn closed(left: impl Into<Vec<u8>>, right: impl Into<Vec<u8>>) -> Self {
        Self {
            start: Bound::Included(left.into()),
            end: Bound::Included(right.into()),
        }
    }

    /// Left included, right excluded.
    pub fn half_open(left: impl Into<Vec<u8>>, right: impl Into<Vec<u8>>) -> Self {
        Self {
            start: Bound::Included(left.into()),
            end: Bound::Excluded(right.into()),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = match &self.start {
            Bound::Included(k) => key >= k.as_slice(),
            Bound::Excluded(k) => key > k.as_slice(),
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(k) => key <= k.as_slice(),
            Bound::Excluded(k) => key < k.as_slice(),
            Bound::Unbounded => true,
        };
        after_start && before_end
    }

    /// Whether any key can fall in both ranges. Conservative for adjacent
    /// exclusive bounds: may report an overlap where the gap holds no key.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        fn starts_before_end(start: &Bound<Vec<u8>>, end: &Bound<Vec<u8>>) -> bool {
            match (start, end) {
                (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
                (Bound::Included(s), Bound::Included(e)) => s <= e,
                (Bound::Included(s), Bound::Excluded(e))
                | (Bound::Excluded(s), Bound::Included(e))
                | (Bound::Excluded(s), Bound::Excluded(e)) => s < e,
            }
        }
        starts_before_end(&self.start, &other.end) && starts_before_end(&other.start, &self.end)
    }

    /// The sub-range left to scan after a batch stopped at `watermark`:
    /// everything strictly past the watermark in scan direction, keeping the
    /// far boundary. This is the resumption range for a fresh accumulator.
    pub fn resume_after(&self, watermark: &[u8], dir: Direction) -> KeyRange {
        match dir {
            Direction::Forward => KeyRange {
                start: Bound::Excluded(watermark.to_vec()),
                end: self.end.clone(),
            },
            Direction::Backward => KeyRange {
                start: self.start.clone(),
                end: Bound::Excluded(watermark.to_vec()),
            },
        }
    }

    /// The boundary key a completed scan's watermark advances to: the far
    /// end of the range in scan direction, or `None` when unbounded (the
    /// watermark then stays at the last key actually folded).
    pub fn far_boundary(&self, dir: Direction) -> Option<&[u8]> {
        let bound = match dir {
            Direction::Forward => &self.end,
            Direction::Backward => &self.start,
        };
        match bound {
            Bound::Included(k) | Bound::Excluded(k) => Some(k.as_slice()),
            Bound::Unbounded => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_respects_bounds() {
        let range = KeyRange::half_open(*b"b", *b"d");
        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c"));
        assert!(!range.contains(b"d"));

        let range = KeyRange::new(Bound::Excluded(b"b".to_vec()), Bound::Unbounded);
        assert!(!range.contains(b"b"));
        assert!(range.contains(b"ba"));
    }

    #[test]
    fn intersects_matches_shared_keys() {
        let left = KeyRange::closed(*b"a", *b"m");
        let right = KeyRange::half_open(*b"m", *b"z");
        assert!(left.intersects(&right));
        assert!(right.intersects(&left));

        let disjoint = KeyRange::closed(*b"n", *b"z");
        assert!(!left.intersects(&disjoint));
        assert!(KeyRange::all().intersects(&disjoint));
    }

    #[test]
    fn resume_excludes_the_watermark_key() {
        let range = KeyRange::closed(*b"a", *b"z");
        let resumed = range.resume_after(b"m", Direction::Forward);
        assert!(!resumed.contains(b"m"));
        assert!(resumed.contains(b"n"));
        assert!(resumed.contains(b"z"));

        let resumed = range.resume_after(b"m", Direction::Backward);
        assert!(!resumed.contains(b"m"));
        assert!(resumed.contains(b"l"));
        assert!(resumed.contains(b"a"));
    }

    #[test]
    fn truncation_is_idempotent_at_the_cap() {
        let long = vec![7u8; 300];
        let t = truncate_key(&long);
        assert_eq!(t.len(), MAX_TRUNCATED_KEY_LEN);
        assert!(is_truncated(t));
        assert_eq!(truncate_key(t), t);
        assert!(!is_truncated(b"short"));
    }
}
