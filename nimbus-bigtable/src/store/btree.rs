//! Balanced-tree row storage, retained for comparison.

use super::{decode_row, encode_row, RowStore, RowVisitor, TableStorage};
use crate::data::Row;
use crate::table::TableDef;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// Historical in-memory engine on an ordered tree.
///
/// Do not use this when row scans overlap with mutations: traversal takes a
/// snapshot of the key set and re-reads each row, so rows inserted mid-scan
/// are never visited and the scan's view is not the one the preferred engine
/// guarantees. Prefer [`SkipListStorage`](super::SkipListStorage).
#[derive(Debug, Default)]
pub struct BTreeStorage;

impl TableStorage for BTreeStorage {
    fn create(&self, _def: &TableDef) -> Arc<dyn RowStore> {
        Arc::new(BTreeRows::default())
    }

    fn get_tables(&self) -> Vec<TableDef> {
        Vec::new()
    }

    fn open(&self, _def: &TableDef) -> Arc<dyn RowStore> {
        unreachable!("in-memory storage enumerates no tables to open")
    }

    fn set_table_meta(&self, _def: &TableDef) {}
}

#[derive(Default)]
struct BTreeRows {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl BTreeRows {
    /// Snapshot the keys in `[lo, hi)`, then visit each row that still
    /// exists. The lock is not held across visitor calls.
    fn visit_snapshot(&self, lo: Bound<&[u8]>, hi: Bound<&[u8]>, visitor: &mut RowVisitor) {
        let keys: Vec<Vec<u8>> =
            self.map.lock().range::<[u8], _>((lo, hi)).map(|(k, _)| k.clone()).collect();
        for key in keys {
            let row = match self.map.lock().get(&key) {
                Some(buf) => decode_row(buf),
                None => continue,
            };
            if !visitor(row) {
                return;
            }
        }
    }
}

impl RowStore for BTreeRows {
    fn get(&self, key: &[u8]) -> Option<Row> {
        self.map.lock().get(key).map(|buf| decode_row(buf))
    }

    fn replace_or_insert(&self, row: Row) {
        let buf = encode_row(&row);
        self.map.lock().insert(row.key, buf);
    }

    fn delete(&self, key: &[u8]) {
        self.map.lock().remove(key);
    }

    fn clear(&self) {
        self.map.lock().clear();
    }

    fn ascend(&self, visitor: &mut RowVisitor) {
        self.visit_snapshot(Bound::Unbounded, Bound::Unbounded, visitor);
    }

    fn ascend_range(&self, greater_or_equal: &[u8], less_than: &[u8], visitor: &mut RowVisitor) {
        self.visit_snapshot(Bound::Included(greater_or_equal), Bound::Excluded(less_than), visitor);
    }

    fn ascend_less_than(&self, less_than: &[u8], visitor: &mut RowVisitor) {
        self.visit_snapshot(Bound::Unbounded, Bound::Excluded(less_than), visitor);
    }

    fn ascend_greater_or_equal(&self, greater_or_equal: &[u8], visitor: &mut RowVisitor) {
        self.visit_snapshot(Bound::Included(greater_or_equal), Bound::Unbounded, visitor);
    }

    fn close(&self) {}
}
