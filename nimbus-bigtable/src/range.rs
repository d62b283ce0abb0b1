//! # Row Ranges
//!
//! Normalizes the row-set portion of a read request (explicit keys plus
//! closed/open ranges) into a sorted, disjoint list of half-open byte
//! intervals for the scan streamer.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The rows targeted by a read: explicit keys and/or ranges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowSet {
    #[serde(default)]
    pub row_keys: Vec<Vec<u8>>,
    #[serde(default)]
    pub row_ranges: Vec<RowRange>,
}

impl RowSet {
    pub fn is_unbounded(&self) -> bool {
        self.row_keys.is_empty() && self.row_ranges.is_empty()
    }
}

/// A single range with optional open/closed endpoints. `None` means
/// unbounded on that side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowRange {
    #[serde(default)]
    pub start_key_closed: Option<Vec<u8>>,
    #[serde(default)]
    pub start_key_open: Option<Vec<u8>>,
    #[serde(default)]
    pub end_key_open: Option<Vec<u8>>,
    #[serde(default)]
    pub end_key_closed: Option<Vec<u8>>,
}

/// A normalized half-open interval `[start, end)`. An empty `start` means
/// unbounded below; an empty `end` means unbounded above.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimpleRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl SimpleRange {
    /// The full-table range.
    pub fn unbounded() -> Self {
        Self::default()
    }
}

/// The immediate successor of `key` in byte-lexicographic order.
pub fn successor(key: &[u8]) -> Vec<u8> {
    let mut s = key.to_vec();
    s.push(0);
    s
}

/// Compare two range ends where the empty end sorts above every non-empty
/// end.
fn end_cmp(a: &[u8], b: &[u8]) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        (false, false) => a.cmp(b),
    }
}

/// Normalize explicit keys and wire ranges into sorted, disjoint
/// half-open intervals.
pub fn merge_row_ranges(explicit: &[Vec<u8>], ranges: &[RowRange]) -> Vec<SimpleRange> {
    let mut srs = Vec::with_capacity(explicit.len() + ranges.len());
    for key in explicit {
        srs.push(SimpleRange { start: key.clone(), end: successor(key) });
    }
    for rr in ranges {
        let start = match (&rr.start_key_closed, &rr.start_key_open) {
            (Some(closed), _) => closed.clone(),
            (None, Some(open)) => successor(open),
            (None, None) => Vec::new(),
        };
        let end = match (&rr.end_key_open, &rr.end_key_closed) {
            (Some(open), _) => open.clone(),
            (None, Some(closed)) => successor(closed),
            (None, None) => Vec::new(),
        };
        srs.push(SimpleRange { start, end });
    }
    merge_simple_ranges(srs)
}

/// Sort ranges by start (then end), merging every overlapping or touching
/// pair. An infinite end absorbs everything beyond it.
pub fn merge_simple_ranges(mut srs: Vec<SimpleRange>) -> Vec<SimpleRange> {
    // A bounded range covering no keys contributes nothing.
    srs.retain(|sr| sr.end.is_empty() || sr.start < sr.end);
    if srs.is_empty() {
        return srs;
    }

    srs.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| end_cmp(&a.end, &b.end)));

    let mut merged: Vec<SimpleRange> = Vec::with_capacity(srs.len());
    for sr in srs {
        match merged.last_mut() {
            // Disjoint iff the previous range is finite and ends before the
            // next one starts.
            Some(last) if last.end.is_empty() || last.end >= sr.start => {
                if end_cmp(&last.end, &sr.end) == Ordering::Less {
                    last.end = sr.end;
                }
            }
            _ => merged.push(sr),
        }
    }
    merged
}
