//! # Tables
//!
//! A table owns its row-storage handle, the column-family metadata, a
//! read-write lock governing row-map traversal, and atomic activity
//! timestamps that drive the garbage-collection loop.

use crate::data::Row;
use crate::range::successor;
use crate::store::RowStore;
use nimbus_core::StopSignal;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Once};
use tracing::{debug, warn};

/// How long a table must be idle (no reads, no writes) before the GC loop
/// touches it.
const QUIESCE_NANOS: i64 = 5 * 60 * 1_000_000_000;

/// Rows processed per write-lock stint during a GC pass.
const GC_BATCH_ROWS: usize = 100;

/// Table metadata: fully qualified name plus the column-family map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    #[serde(default)]
    pub column_families: BTreeMap<String, FamilyDef>,
}

impl TableDef {
    pub fn has_family(&self, name: &str) -> bool {
        self.column_families.contains_key(name)
    }
}

/// Per-family metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FamilyDef {
    #[serde(default)]
    pub gc_rule: Option<GcRule>,
}

/// A garbage-collection rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcRule {
    /// Keep at most N cells per column.
    MaxNumVersions(i32),
    /// Drop cells older than the given age.
    MaxAge { seconds: i64, nanos: i32 },
    /// Apply each sub-rule in turn.
    Union(Vec<GcRule>),
    /// Reserved; parses but collects nothing.
    Intersection(Vec<GcRule>),
}

/// Apply a GC rule to a descending-timestamp cell list in place.
pub fn apply_gc_rule(cells: &mut Vec<crate::data::Cell>, rule: &GcRule, now_micros: i64) {
    static INTERSECTION_WARN: Once = Once::new();
    match rule {
        GcRule::Union(rules) => {
            for sub in rules {
                apply_gc_rule(cells, sub, now_micros);
            }
        }
        GcRule::MaxAge { seconds, nanos } => {
            let cutoff = now_micros - seconds * 1_000_000 - i64::from(*nanos) / 1000;
            let keep = cells.partition_point(|c| c.timestamp_micros >= cutoff);
            if keep < cells.len() {
                debug!("GC max-age dropped {} cells", cells.len() - keep);
            }
            cells.truncate(keep);
        }
        GcRule::MaxNumVersions(n) => {
            cells.truncate((*n).max(0) as usize);
        }
        GcRule::Intersection(_) => {
            INTERSECTION_WARN.call_once(|| warn!("intersection GC rules are not supported"));
        }
    }
}

/// A live table: metadata under the table lock, rows in the storage engine,
/// and atomic activity timestamps.
pub struct Table {
    /// Guards row-map traversal as well as the metadata it wraps. Scans
    /// take the read half; mutations, GC and clear take the write half.
    pub def: RwLock<TableDef>,
    pub rows: Arc<dyn RowStore>,
    last_read_nanos: AtomicI64,
    last_write_nanos: AtomicI64,
}

impl Table {
    pub fn new(def: TableDef, rows: Arc<dyn RowStore>) -> Self {
        let now = nimbus_core::time::unix_nanos();
        Self {
            def: RwLock::new(def),
            rows,
            last_read_nanos: AtomicI64::new(now),
            last_write_nanos: AtomicI64::new(now),
        }
    }

    /// Record read activity. Compare-and-set so a non-monotone clock never
    /// moves the timestamp backwards.
    pub fn read(&self) {
        bump(&self.last_read_nanos, nimbus_core::time::unix_nanos());
    }

    /// Record write activity.
    pub fn write(&self) {
        bump(&self.last_write_nanos, nimbus_core::time::unix_nanos());
    }

    pub fn last_write_nanos(&self) -> i64 {
        self.last_write_nanos.load(Ordering::Acquire)
    }

    /// Fetch the row for `key`, or a fresh empty row. Callers hold the
    /// table lock.
    pub fn get_or_create_row(&self, key: &[u8]) -> Row {
        self.rows.get(key).unwrap_or_else(|| Row::new(key.to_vec()))
    }

    /// Scrub and store the row, deleting it when nothing remains. Callers
    /// hold the table write lock.
    pub fn update_row(&self, mut row: Row, def: &TableDef) {
        row.scrub(|fam| def.has_family(fam));
        if row.families.is_empty() {
            self.rows.delete(&row.key);
        } else {
            self.rows.replace_or_insert(row);
        }
    }

    /// Run one GC pass over the table, applying every family's GC rule.
    ///
    /// Unless `force` is set the pass is skipped while the table has seen
    /// reads or writes within the quiescence window, or is already clean.
    /// The write lock is released and retaken every [`GC_BATCH_ROWS`] rows,
    /// and the pass exits promptly once `stop` trips.
    pub fn gc(&self, now_micros: i64, stop: &StopSignal, force: bool) {
        if !force {
            let now = nimbus_core::time::unix_nanos();
            let last_read = self.last_read_nanos.load(Ordering::Acquire);
            let last_write = self.last_write_nanos.load(Ordering::Acquire);
            if last_write == 0
                || now - last_write < QUIESCE_NANOS
                || now - last_read < QUIESCE_NANOS
            {
                return;
            }
        }

        let mut resume: Option<Vec<u8>> = None;
        loop {
            let def = self.def.write();

            let rules: BTreeMap<String, GcRule> = def
                .column_families
                .iter()
                .filter_map(|(name, fam)| {
                    fam.gc_rule.clone().map(|rule| (name.clone(), rule))
                })
                .collect();
            if rules.is_empty() {
                break;
            }

            let mut processed = 0usize;
            let mut last_key: Option<Vec<u8>> = None;
            let mut more = false;
            let mut visit = |mut row: Row| -> bool {
                let mut changed = false;
                for fam in &mut row.families {
                    if let Some(rule) = rules.get(&fam.name) {
                        for col in &mut fam.columns {
                            let before = col.cells.len();
                            apply_gc_rule(&mut col.cells, rule, now_micros);
                            changed |= before != col.cells.len();
                        }
                    }
                }
                let key = row.key.clone();
                if changed {
                    self.update_row(row, &def);
                }
                processed += 1;
                last_key = Some(key);
                if processed >= GC_BATCH_ROWS {
                    more = true;
                    return false;
                }
                true
            };
            match &resume {
                None => self.rows.ascend(&mut visit),
                Some(key) => self.rows.ascend_greater_or_equal(key, &mut visit),
            }
            drop(def);

            if !more || stop.is_stopped() {
                break;
            }
            resume = last_key.map(|k| successor(&k));
        }

        // Mark the table clean so the next cycle skips it.
        self.last_write_nanos.store(0, Ordering::Release);
    }
}

fn bump(slot: &AtomicI64, now: i64) {
    loop {
        let old = slot.load(Ordering::Acquire);
        if now < old {
            return;
        }
        if slot
            .compare_exchange(old, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Cell;
    use crate::store::{SkipListStorage, TableStorage};

    fn cells(ts: &[i64]) -> Vec<Cell> {
        ts.iter().map(|&t| Cell::new(t, b"v".to_vec())).collect()
    }

    #[test]
    fn test_max_versions() {
        let mut cs = cells(&[5000, 4000, 3000, 2000, 1000]);
        apply_gc_rule(&mut cs, &GcRule::MaxNumVersions(2), 0);
        assert_eq!(cs.len(), 2);
        assert_eq!(cs[0].timestamp_micros, 5000);
    }

    #[test]
    fn test_max_age() {
        let mut cs = cells(&[5000, 4000, 3000, 2000, 1000]);
        // now = 6000us, max age 2ms: cutoff 4000, keep ts >= 4000
        apply_gc_rule(&mut cs, &GcRule::MaxAge { seconds: 0, nanos: 2_000_000 }, 6000);
        let ts: Vec<i64> = cs.iter().map(|c| c.timestamp_micros).collect();
        assert_eq!(ts, vec![5000, 4000]);
    }

    #[test]
    fn test_union_applies_in_turn() {
        let mut cs = cells(&[5000, 4000, 3000, 2000, 1000]);
        let rule = GcRule::Union(vec![
            GcRule::MaxNumVersions(4),
            GcRule::MaxAge { seconds: 0, nanos: 3_000_000 },
        ]);
        apply_gc_rule(&mut cs, &rule, 6000);
        let ts: Vec<i64> = cs.iter().map(|c| c.timestamp_micros).collect();
        assert_eq!(ts, vec![5000, 4000, 3000]);
    }

    #[test]
    fn test_intersection_is_reserved() {
        let mut cs = cells(&[5000, 4000]);
        apply_gc_rule(&mut cs, &GcRule::Intersection(vec![GcRule::MaxNumVersions(1)]), 6000);
        assert_eq!(cs.len(), 2);
    }

    #[test]
    fn test_gc_pass_prunes_rows() {
        let mut def = TableDef { name: "t".to_string(), ..Default::default() };
        def.column_families
            .insert("cf".to_string(), FamilyDef { gc_rule: Some(GcRule::MaxNumVersions(1)) });
        let rows = SkipListStorage.create(&def);
        let table = Table::new(def, rows);

        for i in 0..250u32 {
            let mut row = Row::new(format!("row-{i:04}").into_bytes());
            let col = row.ensure_family("cf").ensure_column(b"q");
            col.append_or_replace_cell(Cell::new(1000, b"old".to_vec()));
            col.append_or_replace_cell(Cell::new(2000, b"new".to_vec()));
            table.rows.replace_or_insert(row);
        }

        table.gc(10_000, &StopSignal::new(), true);
        assert_eq!(table.last_write_nanos(), 0);

        let mut checked = 0;
        table.rows.ascend(&mut |row: Row| {
            assert_eq!(row.cell_count(), 1);
            assert_eq!(row.families[0].columns[0].cells[0].timestamp_micros, 2000);
            checked += 1;
            true
        });
        assert_eq!(checked, 250);
    }

    #[test]
    fn test_gc_skips_active_tables() {
        let mut def = TableDef { name: "t".to_string(), ..Default::default() };
        def.column_families
            .insert("cf".to_string(), FamilyDef { gc_rule: Some(GcRule::MaxNumVersions(1)) });
        let rows = SkipListStorage.create(&def);
        let table = Table::new(def, rows);

        let mut row = Row::new(b"r".to_vec());
        let col = row.ensure_family("cf").ensure_column(b"q");
        col.append_or_replace_cell(Cell::new(1000, b"a".to_vec()));
        col.append_or_replace_cell(Cell::new(2000, b"b".to_vec()));
        table.rows.replace_or_insert(row);
        table.write();

        // Recently written, not forced: nothing happens.
        table.gc(10_000, &StopSignal::new(), false);
        assert_eq!(table.rows.get(b"r").unwrap().cell_count(), 2);
    }

    #[test]
    fn test_activity_timestamps_never_regress() {
        let slot = AtomicI64::new(100);
        bump(&slot, 50);
        assert_eq!(slot.load(Ordering::Acquire), 100);
        bump(&slot, 200);
        assert_eq!(slot.load(Ordering::Acquire), 200);
    }
}
