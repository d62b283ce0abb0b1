//! # Filter Evaluator
//!
//! A recursive evaluator over the tagged filter tree. The evaluator receives
//! a mutable copy of a row: cell-level filters rewrite the row in place,
//! row-level filters inspect or short-circuit. The return value says whether
//! the (possibly rewritten) row should be emitted.
//!
//! All regex filters operate on raw bytes, require the pattern to match the
//! entire target, and escape non-ASCII bytes as `\xHH` so matching behaves
//! as it does on the real service.

use crate::data::{sort_cells_desc, Cell, Row};
use nimbus_core::{Error, Result};
use rand::Rng;
use regex::bytes::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// A row filter node. Composite nodes nest arbitrarily.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowFilter {
    /// Matches nothing. The payload must be `true` if set at all.
    BlockAll(bool),
    /// Matches everything. The payload must be `true` if set at all.
    PassAll(bool),
    /// Applies sub-filters left to right; stops at the first non-match.
    Chain(Vec<RowFilter>),
    /// Applies each sub-filter to an independent copy and merges the
    /// matching copies.
    Interleave(Vec<RowFilter>),
    /// Evaluates the predicate on a copy, then runs the true or false
    /// branch on the real row. A missing branch drops the row.
    Condition {
        predicate: Box<RowFilter>,
        #[serde(default)]
        true_filter: Option<Box<RowFilter>>,
        #[serde(default)]
        false_filter: Option<Box<RowFilter>>,
    },
    /// Full-match regex against the row key.
    RowKeyRegex(Vec<u8>),
    /// Full-match regex against the family name, per cell.
    FamilyNameRegex(String),
    /// Full-match regex against the column qualifier, per cell.
    ColumnQualifierRegex(Vec<u8>),
    /// Full-match regex against the cell value, per cell.
    ValueRegex(Vec<u8>),
    /// Qualifier range within a single family.
    ColumnRange {
        family: String,
        #[serde(default)]
        start_qualifier_closed: Option<Vec<u8>>,
        #[serde(default)]
        start_qualifier_open: Option<Vec<u8>>,
        #[serde(default)]
        end_qualifier_closed: Option<Vec<u8>>,
        #[serde(default)]
        end_qualifier_open: Option<Vec<u8>>,
    },
    /// `[start, end)` in microseconds; both must be millisecond-granular;
    /// `end = 0` means unbounded.
    TimestampRange { start_micros: i64, end_micros: i64 },
    /// Cell-value range, analogous to `ColumnRange`.
    ValueRange {
        #[serde(default)]
        start_value_closed: Option<Vec<u8>>,
        #[serde(default)]
        start_value_open: Option<Vec<u8>>,
        #[serde(default)]
        end_value_closed: Option<Vec<u8>>,
        #[serde(default)]
        end_value_open: Option<Vec<u8>>,
    },
    /// Keep the first N cells of each column.
    CellsPerColumnLimit(i32),
    /// Keep the first N cells of the whole row, in row order.
    CellsPerRowLimit(i32),
    /// Skip the first N cells of the whole row.
    CellsPerRowOffset(i32),
    /// Replace every cell value with the empty string.
    StripValue(bool),
    /// Attach a label to every cell. Labels match `[a-z0-9\-]{1,15}`.
    ApplyLabel(String),
    /// Emit the row with the given probability, `0 < p < 1`.
    RowSample(f64),
}

/// Evaluate `filter` against `row`, rewriting it in place. Returns whether
/// the row should be emitted. Invalid filters yield an error.
pub fn filter_row(filter: &RowFilter, row: &mut Row) -> Result<bool> {
    match filter {
        RowFilter::BlockAll(set) => {
            if !set {
                return Err(Error::invalid("block_all_filter must be true if set"));
            }
            return Ok(false);
        }
        RowFilter::PassAll(set) => {
            if !set {
                return Err(Error::invalid("pass_all_filter must be true if set"));
            }
            return Ok(true);
        }
        RowFilter::Chain(filters) => {
            if filters.len() < 2 {
                return Err(Error::invalid("chain must contain at least two filters"));
            }
            for sub in filters {
                if !filter_row(sub, row)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        RowFilter::Interleave(filters) => {
            if filters.len() < 2 {
                return Err(Error::invalid("interleave must contain at least two filters"));
            }
            let mut matched = Vec::with_capacity(filters.len());
            for sub in filters {
                let mut copy = row.clone();
                if filter_row(sub, &mut copy)? {
                    matched.push(copy);
                }
            }
            row.families.clear();
            for sub_row in matched {
                for fam in sub_row.families {
                    let merged_fam = row.ensure_family(&fam.name);
                    for col in fam.columns {
                        merged_fam.ensure_column(&col.qualifier).cells.extend(col.cells);
                    }
                }
            }
            let mut count = 0;
            for fam in &mut row.families {
                for col in &mut fam.columns {
                    sort_cells_desc(&mut col.cells);
                    count += col.cells.len();
                }
            }
            return Ok(count > 0);
        }
        RowFilter::Condition { predicate, true_filter, false_filter } => {
            let mut copy = row.clone();
            let matched = filter_row(predicate, &mut copy)?;
            let branch = if matched { true_filter } else { false_filter };
            return match branch {
                Some(sub) => filter_row(sub, row),
                None => Ok(false),
            };
        }
        RowFilter::CellsPerColumnLimit(limit) => {
            let limit = (*limit).max(0) as usize;
            for fam in &mut row.families {
                for col in &mut fam.columns {
                    col.cells.truncate(limit);
                }
            }
            return Ok(true);
        }
        RowFilter::CellsPerRowLimit(limit) => {
            let mut remaining = (*limit).max(0) as usize;
            for fam in &mut row.families {
                for col in &mut fam.columns {
                    if col.cells.len() > remaining {
                        col.cells.truncate(remaining);
                        remaining = 0;
                    } else {
                        remaining -= col.cells.len();
                    }
                }
            }
            return Ok(true);
        }
        RowFilter::CellsPerRowOffset(offset) => {
            // Matches observed service behavior: a column with at most
            // `offset` cells is emptied without consuming the offset; the
            // first larger column is sliced by the full offset.
            let offset = (*offset).max(0) as usize;
            for fam in &mut row.families {
                for col in &mut fam.columns {
                    if col.cells.len() > offset {
                        col.cells.drain(..offset);
                        return Ok(true);
                    }
                    col.cells.clear();
                }
            }
            return Ok(true);
        }
        RowFilter::RowSample(p) => {
            if *p <= 0.0 || *p >= 1.0 {
                return Err(Error::invalid(
                    "row_sample_filter argument must be between 0.0 and 1.0",
                ));
            }
            return Ok(rand::thread_rng().gen::<f64>() < *p);
        }
        RowFilter::RowKeyRegex(pattern) => {
            let re = new_regex(pattern)
                .map_err(|e| Error::invalid(format!("bad row key regex: {e}")))?;
            if !re.is_match(&row.key) {
                return Ok(false);
            }
            // fall through to the per-cell pass below
        }
        _ => {}
    }

    // Everything else operates on a per-cell basis.
    let mut cell_count = 0;
    for fam in &mut row.families {
        let fam_name = fam.name.clone();
        for col in &mut fam.columns {
            let mut kept = Vec::with_capacity(col.cells.len());
            for cell in &col.cells {
                if include_cell(filter, &fam_name, &col.qualifier, cell)? {
                    kept.push(modify_cell(filter, cell)?);
                }
            }
            col.cells = kept;
            cell_count += col.cells.len();
        }
    }
    Ok(cell_count > 0)
}

/// Whether a cell survives a cell-level filter. Row-level and cell-modifying
/// nodes pass everything through here.
fn include_cell(filter: &RowFilter, fam: &str, qualifier: &[u8], cell: &Cell) -> Result<bool> {
    match filter {
        RowFilter::FamilyNameRegex(pattern) => {
            let re = new_regex(pattern.as_bytes())
                .map_err(|e| Error::invalid(format!("bad family name regex: {e}")))?;
            Ok(re.is_match(fam.as_bytes()))
        }
        RowFilter::ColumnQualifierRegex(pattern) => {
            let re = new_regex(pattern)
                .map_err(|e| Error::invalid(format!("bad column qualifier regex: {e}")))?;
            Ok(re.is_match(qualifier))
        }
        RowFilter::ValueRegex(pattern) => {
            let re = new_regex(pattern)
                .map_err(|e| Error::invalid(format!("bad value regex: {e}")))?;
            Ok(re.is_match(&cell.value))
        }
        RowFilter::ColumnRange {
            family,
            start_qualifier_closed,
            start_qualifier_open,
            end_qualifier_closed,
            end_qualifier_open,
        } => {
            if fam != family.as_str() {
                return Ok(false);
            }
            Ok(in_byte_range(
                qualifier,
                start_qualifier_closed.as_deref(),
                start_qualifier_open.as_deref(),
                end_qualifier_closed.as_deref(),
                end_qualifier_open.as_deref(),
            ))
        }
        RowFilter::TimestampRange { start_micros, end_micros } => {
            if start_micros % 1000 != 0 || end_micros % 1000 != 0 {
                return Err(Error::invalid(format!(
                    "timestamp_range_filter supports millisecond precision at most, got [{start_micros}, {end_micros})",
                )));
            }
            Ok(cell.timestamp_micros >= *start_micros
                && (*end_micros == 0 || cell.timestamp_micros < *end_micros))
        }
        RowFilter::ValueRange {
            start_value_closed,
            start_value_open,
            end_value_closed,
            end_value_open,
        } => Ok(in_byte_range(
            &cell.value,
            start_value_closed.as_deref(),
            start_value_open.as_deref(),
            end_value_closed.as_deref(),
            end_value_open.as_deref(),
        )),
        _ => Ok(true),
    }
}

/// Apply a cell-modifying filter, returning the replacement cell.
fn modify_cell(filter: &RowFilter, cell: &Cell) -> Result<Cell> {
    match filter {
        RowFilter::StripValue(_) => {
            Ok(Cell { timestamp_micros: cell.timestamp_micros, value: Vec::new(), labels: Vec::new() })
        }
        RowFilter::ApplyLabel(label) => {
            if !valid_label(label) {
                return Err(Error::invalid(format!(
                    "apply_label_transformer must match [a-z0-9\\-]{{1,15}}, got {label:?}",
                )));
            }
            Ok(Cell {
                timestamp_micros: cell.timestamp_micros,
                value: cell.value.clone(),
                labels: vec![label.clone()],
            })
        }
        _ => Ok(cell.clone()),
    }
}

/// Open/closed/unbounded endpoint test shared by column and value ranges.
/// A missing start defaults to closed-at-empty; a missing end is unbounded.
fn in_byte_range(
    v: &[u8],
    start_closed: Option<&[u8]>,
    start_open: Option<&[u8]>,
    end_closed: Option<&[u8]>,
    end_open: Option<&[u8]>,
) -> bool {
    let after_start = match (start_open, start_closed) {
        (Some(open), _) => v > open,
        (None, Some(closed)) => v >= closed,
        (None, None) => true,
    };
    let before_end = match (end_open, end_closed) {
        (Some(open), _) => v < open,
        (None, Some(closed)) => v <= closed,
        (None, None) => true,
    };
    after_start && before_end
}

fn valid_label(label: &str) -> bool {
    static LABEL_RE: OnceLock<regex::Regex> = OnceLock::new();
    LABEL_RE
        .get_or_init(|| regex::Regex::new(r"^[a-z0-9\-]{1,15}$").unwrap())
        .is_match(label)
}

/// Escape non-ASCII bytes as `\xHH` so byte patterns behave like the real
/// service's matcher.
fn escape_non_ascii(pattern: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(pattern.len());
    for &b in pattern {
        if b > 127 {
            out.push('\\');
            out.push('x');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0xF) as usize] as char);
        } else {
            out.push(b as char);
        }
    }
    out
}

/// Compile a byte pattern anchored to match the entire target.
fn new_regex(pattern: &[u8]) -> std::result::Result<Regex, regex::Error> {
    let anchored = format!("^(?:{})$", escape_non_ascii(pattern));
    RegexBuilder::new(&anchored).unicode(false).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_with(cells: &[(&str, &[u8], i64, &[u8])]) -> Row {
        let mut row = Row::new(b"row1".to_vec());
        for (fam, qual, ts, value) in cells {
            row.ensure_family(fam)
                .ensure_column(qual)
                .append_or_replace_cell(Cell::new(*ts, value.to_vec()));
        }
        row
    }

    #[test]
    fn test_block_and_pass() {
        let mut row = row_with(&[("cf", b"q", 1000, b"v")]);
        assert!(!filter_row(&RowFilter::BlockAll(true), &mut row).unwrap());
        assert!(filter_row(&RowFilter::PassAll(true), &mut row).unwrap());
        assert!(filter_row(&RowFilter::BlockAll(false), &mut row).is_err());
        assert!(filter_row(&RowFilter::PassAll(false), &mut row).is_err());
    }

    #[test]
    fn test_chain_requires_two() {
        let mut row = row_with(&[("cf", b"q", 1000, b"v")]);
        let f = RowFilter::Chain(vec![RowFilter::PassAll(true)]);
        assert!(filter_row(&f, &mut row).is_err());
    }

    #[test]
    fn test_chain_short_circuits() {
        let mut row = row_with(&[("cf", b"q", 1000, b"v")]);
        let f = RowFilter::Chain(vec![RowFilter::BlockAll(true), RowFilter::PassAll(true)]);
        assert!(!filter_row(&f, &mut row).unwrap());
    }

    #[test]
    fn test_chain_composes_like_sequential_application() {
        let build = || row_with(&[("cf", b"a", 1000, b"v"), ("cf", b"b", 1000, b"w")]);
        let f = RowFilter::ColumnQualifierRegex(b"a".to_vec());
        let g = RowFilter::StripValue(true);

        let mut chained = build();
        filter_row(&RowFilter::Chain(vec![f.clone(), g.clone()]), &mut chained).unwrap();

        let mut sequential = build();
        filter_row(&f, &mut sequential).unwrap();
        filter_row(&g, &mut sequential).unwrap();

        assert_eq!(chained, sequential);
    }

    #[test]
    fn test_interleave_merges_and_sorts() {
        let mut row = row_with(&[("cf", b"q", 1000, b"old"), ("cf", b"q", 2000, b"new")]);
        let f = RowFilter::Interleave(vec![
            RowFilter::TimestampRange { start_micros: 0, end_micros: 2000 },
            RowFilter::TimestampRange { start_micros: 2000, end_micros: 0 },
        ]);
        assert!(filter_row(&f, &mut row).unwrap());
        let cells = &row.families[0].columns[0].cells;
        let ts: Vec<i64> = cells.iter().map(|c| c.timestamp_micros).collect();
        assert_eq!(ts, vec![2000, 1000]);
    }

    #[test]
    fn test_interleave_no_match_drops_row() {
        let mut row = row_with(&[("cf", b"q", 1000, b"v")]);
        let f = RowFilter::Interleave(vec![RowFilter::BlockAll(true), RowFilter::BlockAll(true)]);
        assert!(!filter_row(&f, &mut row).unwrap());
    }

    #[test]
    fn test_condition_branches() {
        let pred = Box::new(RowFilter::ColumnQualifierRegex(b"q".to_vec()));

        let mut row = row_with(&[("cf", b"q", 1000, b"v")]);
        let f = RowFilter::Condition {
            predicate: pred.clone(),
            true_filter: Some(Box::new(RowFilter::StripValue(true))),
            false_filter: None,
        };
        assert!(filter_row(&f, &mut row).unwrap());
        assert!(row.families[0].columns[0].cells[0].value.is_empty());

        // Predicate matches but the true branch is missing: drop the row.
        let mut row = row_with(&[("cf", b"q", 1000, b"v")]);
        let f = RowFilter::Condition { predicate: pred, true_filter: None, false_filter: None };
        assert!(!filter_row(&f, &mut row).unwrap());
    }

    #[test]
    fn test_row_key_regex_full_match() {
        let mut row = row_with(&[("cf", b"q", 1000, b"v")]);
        assert!(filter_row(&RowFilter::RowKeyRegex(b"row1".to_vec()), &mut row).unwrap());
        assert!(!filter_row(&RowFilter::RowKeyRegex(b"row".to_vec()), &mut row).unwrap());
        assert!(filter_row(&RowFilter::RowKeyRegex(b"ro.*".to_vec()), &mut row).unwrap());
    }

    #[test]
    fn test_row_key_regex_binary_key() {
        let mut row = Row::new(vec![0x80, 0x40]);
        row.ensure_family("cf")
            .ensure_column(b"q")
            .append_or_replace_cell(Cell::new(1000, b"v".to_vec()));
        assert!(filter_row(&RowFilter::RowKeyRegex(vec![0x80, 0x40]), &mut row.clone()).unwrap());
        assert!(!filter_row(&RowFilter::RowKeyRegex(vec![0x80]), &mut row).unwrap());
    }

    #[test]
    fn test_bad_regex_is_invalid_argument() {
        let mut row = row_with(&[("cf", b"q", 1000, b"v")]);
        let err = filter_row(&RowFilter::RowKeyRegex(b"a[".to_vec()), &mut row).unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn test_value_regex_with_alternation() {
        let mut row = row_with(&[("cf", b"q", 1000, b"abc"), ("cf", b"r", 1000, b"xyz")]);
        let f = RowFilter::ValueRegex(b"abc|def".to_vec());
        assert!(filter_row(&f, &mut row).unwrap());
        assert_eq!(row.cell_count(), 1);
        assert_eq!(row.families[0].columns[0].qualifier, b"q");
    }

    #[test]
    fn test_column_range_endpoints() {
        let build = || {
            row_with(&[
                ("cf", b"a", 1000, b"1"),
                ("cf", b"b", 1000, b"2"),
                ("cf", b"c", 1000, b"3"),
            ])
        };

        let mut row = build();
        let f = RowFilter::ColumnRange {
            family: "cf".to_string(),
            start_qualifier_closed: Some(b"a".to_vec()),
            start_qualifier_open: None,
            end_qualifier_closed: None,
            end_qualifier_open: Some(b"c".to_vec()),
        };
        assert!(filter_row(&f, &mut row).unwrap());
        assert_eq!(row.cell_count(), 2);

        let mut row = build();
        let f = RowFilter::ColumnRange {
            family: "other".to_string(),
            start_qualifier_closed: None,
            start_qualifier_open: None,
            end_qualifier_closed: None,
            end_qualifier_open: None,
        };
        assert!(!filter_row(&f, &mut row).unwrap());
    }

    #[test]
    fn test_timestamp_range_granularity() {
        let mut row = row_with(&[("cf", b"q", 1000, b"v")]);
        let f = RowFilter::TimestampRange { start_micros: 1500, end_micros: 0 };
        assert!(filter_row(&f, &mut row).is_err());

        let mut row = row_with(&[("cf", b"q", 1000, b"v"), ("cf", b"q", 5000, b"w")]);
        let f = RowFilter::TimestampRange { start_micros: 2000, end_micros: 0 };
        assert!(filter_row(&f, &mut row).unwrap());
        assert_eq!(row.families[0].columns[0].cells[0].timestamp_micros, 5000);
        assert_eq!(row.cell_count(), 1);
    }

    #[test]
    fn test_cells_per_column_limit() {
        let mut row = row_with(&[
            ("cf", b"q", 1000, b"a"),
            ("cf", b"q", 2000, b"b"),
            ("cf", b"q", 3000, b"c"),
        ]);
        assert!(filter_row(&RowFilter::CellsPerColumnLimit(2), &mut row).unwrap());
        let ts: Vec<i64> =
            row.families[0].columns[0].cells.iter().map(|c| c.timestamp_micros).collect();
        assert_eq!(ts, vec![3000, 2000]);
    }

    #[test]
    fn test_cells_per_row_limit_spans_columns() {
        let mut row = row_with(&[
            ("cf", b"a", 1000, b"1"),
            ("cf", b"a", 2000, b"2"),
            ("cf", b"b", 1000, b"3"),
            ("cf", b"b", 2000, b"4"),
        ]);
        assert!(filter_row(&RowFilter::CellsPerRowLimit(3), &mut row).unwrap());
        assert_eq!(row.families[0].columns[0].cells.len(), 2);
        assert_eq!(row.families[0].columns[1].cells.len(), 1);
    }

    #[test]
    fn test_cells_per_row_offset_within_column() {
        let mut row = row_with(&[
            ("cf", b"a", 1000, b"1"),
            ("cf", b"a", 2000, b"2"),
            ("cf", b"a", 3000, b"3"),
        ]);
        assert!(filter_row(&RowFilter::CellsPerRowOffset(1), &mut row).unwrap());
        let ts: Vec<i64> =
            row.families[0].columns[0].cells.iter().map(|c| c.timestamp_micros).collect();
        assert_eq!(ts, vec![2000, 1000]);
    }

    #[test]
    fn test_cells_per_row_offset_exceeding_column() {
        // A column with at most `offset` cells is emptied without consuming
        // the offset.
        let mut row = row_with(&[
            ("cf", b"a", 1000, b"1"),
            ("cf", b"b", 1000, b"2"),
            ("cf", b"b", 2000, b"3"),
        ]);
        assert!(filter_row(&RowFilter::CellsPerRowOffset(1), &mut row).unwrap());
        assert!(row.families[0].columns[0].cells.is_empty());
        assert_eq!(row.families[0].columns[1].cells.len(), 1);
    }

    #[test]
    fn test_strip_value() {
        let mut row = row_with(&[("cf", b"q", 1000, b"value")]);
        assert!(filter_row(&RowFilter::StripValue(true), &mut row).unwrap());
        let cell = &row.families[0].columns[0].cells[0];
        assert_eq!(cell.timestamp_micros, 1000);
        assert!(cell.value.is_empty());
    }

    #[test]
    fn test_apply_label() {
        let mut row = row_with(&[("cf", b"q", 1000, b"v")]);
        assert!(filter_row(&RowFilter::ApplyLabel("lbl-1".to_string()), &mut row).unwrap());
        assert_eq!(row.families[0].columns[0].cells[0].labels, vec!["lbl-1"]);

        for bad in ["", "UPPER", "waytoolongforalabel", "has_underscore"] {
            let mut row = row_with(&[("cf", b"q", 1000, b"v")]);
            let err = filter_row(&RowFilter::ApplyLabel(bad.to_string()), &mut row).unwrap_err();
            assert_eq!(err.code(), "INVALID_ARGUMENT", "label {bad:?}");
        }
    }

    #[test]
    fn test_row_sample_bounds() {
        let mut row = row_with(&[("cf", b"q", 1000, b"v")]);
        assert!(filter_row(&RowFilter::RowSample(0.0), &mut row).is_err());
        assert!(filter_row(&RowFilter::RowSample(1.0), &mut row).is_err());
    }

    #[test]
    fn test_row_sample_distribution() {
        let mut hits = 0;
        for _ in 0..2000 {
            let mut row = row_with(&[("cf", b"q", 1000, b"v")]);
            if filter_row(&RowFilter::RowSample(0.5), &mut row).unwrap() {
                hits += 1;
            }
        }
        assert!((600..=1400).contains(&hits), "p=0.5 sampled {hits}/2000");
    }
}
