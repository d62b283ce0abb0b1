//! # Mutation Engine
//!
//! Applies an ordered batch of cell mutations to a row. The batch operates
//! on an owned row value; the caller persists the row only if the whole
//! batch succeeds, so a failed batch leaves no partial effects behind.

use crate::data::{valid_timestamp, Cell, Row, SERVER_TIME};
use nimbus_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// A single mutation within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    SetCell {
        family_name: String,
        column_qualifier: Vec<u8>,
        timestamp_micros: i64,
        value: Vec<u8>,
    },
    DeleteFromColumn {
        family_name: String,
        column_qualifier: Vec<u8>,
        #[serde(default)]
        time_range: Option<TimestampRange>,
    },
    DeleteFromFamily { family_name: String },
    DeleteFromRow,
}

/// Half-open `[start, end)` timestamp window; `end = 0` means unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimestampRange {
    #[serde(default)]
    pub start_timestamp_micros: i64,
    #[serde(default)]
    pub end_timestamp_micros: i64,
}

/// Apply `mutations` in order to `row`. `declared` reports whether a family
/// exists on the table; `now_micros` is the pre-rounded server timestamp
/// substituted for the server-time sentinel.
pub fn apply_mutations<F>(
    row: &mut Row,
    mutations: &[Mutation],
    declared: F,
    now_micros: i64,
) -> Result<()>
where
    F: Fn(&str) -> bool,
{
    for mutation in mutations {
        match mutation {
            Mutation::SetCell { family_name, column_qualifier, timestamp_micros, value } => {
                if !declared(family_name) {
                    return Err(Error::invalid(format!("unknown family {family_name:?}")));
                }
                let ts = if *timestamp_micros == SERVER_TIME {
                    now_micros
                } else {
                    *timestamp_micros
                };
                if !valid_timestamp(ts) {
                    return Err(Error::invalid(format!("invalid timestamp {ts}")));
                }
                row.ensure_family(family_name)
                    .ensure_column(column_qualifier)
                    .append_or_replace_cell(Cell::new(ts, value.clone()));
            }
            Mutation::DeleteFromColumn { family_name, column_qualifier, time_range } => {
                if !declared(family_name) {
                    return Err(Error::invalid(format!("unknown family {family_name:?}")));
                }
                let col = match row
                    .family_mut(family_name)
                    .and_then(|fam| fam.column_mut(column_qualifier))
                {
                    Some(col) => col,
                    None => continue,
                };
                match time_range {
                    Some(tr) => {
                        let (start, end) = (tr.start_timestamp_micros, tr.end_timestamp_micros);
                        if !valid_timestamp(start) {
                            return Err(Error::invalid(format!("invalid timestamp {start}")));
                        }
                        if !valid_timestamp(end) && end != 0 {
                            return Err(Error::invalid(format!("invalid timestamp {end}")));
                        }
                        if start >= end && end != 0 {
                            return Err(Error::invalid(format!(
                                "inverted or invalid timestamp range [{start}, {end})",
                            )));
                        }
                        col.cells.retain(|c| {
                            !(c.timestamp_micros >= start
                                && (end == 0 || c.timestamp_micros < end))
                        });
                    }
                    None => col.cells.clear(),
                }
            }
            Mutation::DeleteFromRow => row.families.clear(),
            Mutation::DeleteFromFamily { family_name } => {
                if let Some(fam) = row.family_mut(family_name) {
                    fam.columns.clear();
                }
            }
        }
    }
    Ok(())
}
