//! # Row Data Model
//!
//! Rows, families, columns and cells as the data plane sees them.
//!
//! Ordering invariants, maintained by every mutation path:
//! - families appear in the order they were first populated
//! - columns within a family are sorted ascending by qualifier bytes
//! - cells within a column are sorted by descending timestamp, with at most
//!   one cell per timestamp

use serde::{Deserialize, Serialize};

/// Timestamp sentinel meaning "substitute the server clock at apply time".
pub const SERVER_TIME: i64 = -1;

/// Maximum valid cell timestamp: `i64::MAX` truncated to millisecond
/// granularity.
pub const MAX_VALID_TIMESTAMP: i64 = i64::MAX - i64::MAX % 1000;

/// A timestamp is valid iff it is in `[0, MAX_VALID_TIMESTAMP]` and an exact
/// multiple of 1000 (the service only supports millisecond granularity).
pub fn valid_timestamp(ts: i64) -> bool {
    (0..=MAX_VALID_TIMESTAMP).contains(&ts) && ts % 1000 == 0
}

/// A single cell: timestamp in microseconds, value bytes, filter labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub timestamp_micros: i64,
    pub value: Vec<u8>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl Cell {
    pub fn new(timestamp_micros: i64, value: Vec<u8>) -> Self {
        Self { timestamp_micros, value, labels: Vec::new() }
    }
}

/// A column: qualifier plus its cells in descending-timestamp order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub qualifier: Vec<u8>,
    pub cells: Vec<Cell>,
}

impl Column {
    /// Insert a cell, replacing any existing cell at the same timestamp, and
    /// restore descending-timestamp order.
    pub fn append_or_replace_cell(&mut self, new_cell: Cell) {
        match self
            .cells
            .iter_mut()
            .find(|c| c.timestamp_micros == new_cell.timestamp_micros)
        {
            Some(existing) => *existing = new_cell,
            None => self.cells.push(new_cell),
        }
        sort_cells_desc(&mut self.cells);
    }
}

/// Sort cells by descending timestamp (stable).
pub fn sort_cells_desc(cells: &mut [Cell]) {
    cells.sort_by(|a, b| b.timestamp_micros.cmp(&a.timestamp_micros));
}

/// A column family within a row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Family {
    pub fn column(&self, qualifier: &[u8]) -> Option<&Column> {
        self.columns.iter().find(|c| c.qualifier == qualifier)
    }

    pub fn column_mut(&mut self, qualifier: &[u8]) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.qualifier == qualifier)
    }

    /// The column with the given qualifier, created (appended) if absent.
    /// Column order is restored by the next scrub.
    pub fn ensure_column(&mut self, qualifier: &[u8]) -> &mut Column {
        if let Some(idx) = self.columns.iter().position(|c| c.qualifier == qualifier) {
            return &mut self.columns[idx];
        }
        self.columns.push(Column { qualifier: qualifier.to_vec(), cells: Vec::new() });
        self.columns.last_mut().unwrap()
    }

    /// Drop empty columns and sort the rest by qualifier. Returns whether
    /// anything was removed.
    fn scrub(&mut self) -> bool {
        let before = self.columns.len();
        self.columns.retain(|c| !c.cells.is_empty());
        self.columns.sort_by(|a, b| a.qualifier.cmp(&b.qualifier));
        before != self.columns.len()
    }
}

/// A table row: key plus families in first-populated order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: Vec<u8>,
    pub families: Vec<Family>,
}

impl Row {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into(), families: Vec::new() }
    }

    pub fn family(&self, name: &str) -> Option<&Family> {
        self.families.iter().find(|f| f.name == name)
    }

    pub fn family_mut(&mut self, name: &str) -> Option<&mut Family> {
        self.families.iter_mut().find(|f| f.name == name)
    }

    /// The family with the given name, created (appended) if absent.
    pub fn ensure_family(&mut self, name: &str) -> &mut Family {
        if let Some(idx) = self.families.iter().position(|f| f.name == name) {
            return &mut self.families[idx];
        }
        self.families.push(Family { name: name.to_string(), columns: Vec::new() });
        self.families.last_mut().unwrap()
    }

    /// True if the row holds no cells at all.
    pub fn is_empty(&self) -> bool {
        self.families
            .iter()
            .all(|f| f.columns.iter().all(|c| c.cells.is_empty()))
    }

    /// Total size of all cell values, used by sample-row-keys offsets.
    pub fn size(&self) -> usize {
        self.families
            .iter()
            .flat_map(|f| &f.columns)
            .flat_map(|c| &c.cells)
            .map(|cell| cell.value.len())
            .sum()
    }

    /// Total number of cells across the row.
    pub fn cell_count(&self) -> usize {
        self.families
            .iter()
            .flat_map(|f| &f.columns)
            .map(|c| c.cells.len())
            .sum()
    }

    /// Remove empty columns, empty families, and families that are no longer
    /// declared on the table; sort columns by qualifier. Returns whether the
    /// row changed.
    pub fn scrub<F>(&mut self, declared: F) -> bool
    where
        F: Fn(&str) -> bool,
    {
        let before = self.families.len();
        let mut changed = false;
        self.families.retain_mut(|fam| {
            if !declared(&fam.name) {
                return false;
            }
            changed |= fam.scrub();
            !fam.columns.is_empty()
        });
        changed || before != self.families.len()
    }
}
