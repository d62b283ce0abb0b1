//! # Read-Modify-Write Engine
//!
//! Atomic per-row append and increment. Every rule writes a fresh cell whose
//! timestamp is the later of the server clock and the previous newest cell,
//! so the result always sorts first within its column.

use crate::data::{Cell, Row};
use byteorder::{BigEndian, ByteOrder};
use nimbus_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// A single read-modify-write rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadModifyWriteRule {
    Append {
        family_name: String,
        column_qualifier: Vec<u8>,
        append_value: Vec<u8>,
    },
    Increment {
        family_name: String,
        column_qualifier: Vec<u8>,
        increment_amount: i64,
    },
}

impl ReadModifyWriteRule {
    pub fn family_name(&self) -> &str {
        match self {
            ReadModifyWriteRule::Append { family_name, .. } => family_name,
            ReadModifyWriteRule::Increment { family_name, .. } => family_name,
        }
    }

    pub fn column_qualifier(&self) -> &[u8] {
        match self {
            ReadModifyWriteRule::Append { column_qualifier, .. } => column_qualifier,
            ReadModifyWriteRule::Increment { column_qualifier, .. } => column_qualifier,
        }
    }
}

/// Apply `rules` in order to `row`. Returns a row containing only the
/// newly-written cells. `declared` reports whether a family exists on the
/// table; `now_micros` is the pre-rounded server timestamp.
pub fn apply_read_modify_write<F>(
    row: &mut Row,
    rules: &[ReadModifyWriteRule],
    declared: F,
    now_micros: i64,
) -> Result<Row>
where
    F: Fn(&str) -> bool,
{
    let mut result = Row::new(row.key.clone());

    for rule in rules {
        let fam_name = rule.family_name();
        if !declared(fam_name) {
            return Err(Error::invalid(format!("unknown family {fam_name:?}")));
        }

        let col = row.ensure_family(fam_name).ensure_column(rule.column_qualifier());

        // All rules apply to the most recent version of the cell. The new
        // timestamp must not sort below a previous cell written in the
        // future.
        let mut ts = now_micros;
        let prev = col.cells.first().cloned();
        if let Some(prev) = &prev {
            ts = ts.max(prev.timestamp_micros);
        }

        let new_cell = match rule {
            ReadModifyWriteRule::Append { append_value, .. } => {
                let mut value = prev.map(|c| c.value).unwrap_or_default();
                value.extend_from_slice(append_value);
                Cell::new(ts, value)
            }
            ReadModifyWriteRule::Increment { increment_amount, .. } => {
                let mut v: i64 = 0;
                if let Some(prev) = &prev {
                    if prev.value.len() != 8 {
                        return Err(Error::invalid("increment on non-64-bit value"));
                    }
                    v = BigEndian::read_i64(&prev.value);
                }
                v = v.wrapping_add(*increment_amount);
                let mut buf = [0u8; 8];
                BigEndian::write_i64(&mut buf, v);
                Cell::new(ts, buf.to_vec())
            }
        };

        col.append_or_replace_cell(new_cell.clone());
        result
            .ensure_family(fam_name)
            .ensure_column(rule.column_qualifier())
            .cells = vec![new_cell];
    }

    Ok(result)
}
