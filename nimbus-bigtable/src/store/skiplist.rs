//! In-memory row storage on a lock-free skip list.

use super::{decode_row, encode_row, RowStore, RowVisitor, TableStorage};
use crate::data::Row;
use crate::table::TableDef;
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::Arc;

/// The preferred in-memory storage engine.
///
/// Unlike [`BTreeStorage`](super::BTreeStorage), the skip list is resilient
/// against concurrent insertions and deletions during row scans: rows added
/// or removed mid-scan may or may not be visited (as with the real service),
/// while untouched rows are always visited in order.
#[derive(Debug, Default)]
pub struct SkipListStorage;

impl TableStorage for SkipListStorage {
    fn create(&self, _def: &TableDef) -> Arc<dyn RowStore> {
        Arc::new(SkipListRows::new())
    }

    fn get_tables(&self) -> Vec<TableDef> {
        Vec::new()
    }

    fn open(&self, _def: &TableDef) -> Arc<dyn RowStore> {
        unreachable!("in-memory storage enumerates no tables to open")
    }

    fn set_table_meta(&self, _def: &TableDef) {}
}

pub(crate) struct SkipListRows {
    map: SkipMap<Vec<u8>, Vec<u8>>,
}

impl SkipListRows {
    pub(crate) fn new() -> Self {
        Self { map: SkipMap::new() }
    }
}

impl RowStore for SkipListRows {
    fn get(&self, key: &[u8]) -> Option<Row> {
        self.map.get(key).map(|entry| decode_row(entry.value()))
    }

    fn replace_or_insert(&self, row: Row) {
        let buf = encode_row(&row);
        self.map.insert(row.key, buf);
    }

    fn delete(&self, key: &[u8]) {
        self.map.remove(key);
    }

    fn clear(&self) {
        while self.map.pop_front().is_some() {}
    }

    fn ascend(&self, visitor: &mut RowVisitor) {
        for entry in self.map.iter() {
            if !visitor(decode_row(entry.value())) {
                return;
            }
        }
    }

    fn ascend_range(&self, greater_or_equal: &[u8], less_than: &[u8], visitor: &mut RowVisitor) {
        let range =
            (Bound::Included(greater_or_equal), Bound::Excluded(less_than));
        for entry in self.map.range::<[u8], _>(range) {
            if !visitor(decode_row(entry.value())) {
                return;
            }
        }
    }

    fn ascend_less_than(&self, less_than: &[u8], visitor: &mut RowVisitor) {
        let range: (Bound<&[u8]>, Bound<&[u8]>) =
            (Bound::Unbounded, Bound::Excluded(less_than));
        for entry in self.map.range::<[u8], _>(range) {
            if !visitor(decode_row(entry.value())) {
                return;
            }
        }
    }

    fn ascend_greater_or_equal(&self, greater_or_equal: &[u8], visitor: &mut RowVisitor) {
        let range: (Bound<&[u8]>, Bound<&[u8]>) =
            (Bound::Included(greater_or_equal), Bound::Unbounded);
        for entry in self.map.range::<[u8], _>(range) {
            if !visitor(decode_row(entry.value())) {
                return;
            }
        }
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Cell;

    fn row(key: &[u8]) -> Row {
        let mut r = Row::new(key.to_vec());
        r.ensure_family("cf")
            .ensure_column(b"q")
            .append_or_replace_cell(Cell::new(1000, b"v".to_vec()));
        r
    }

    fn keys_in(store: &dyn RowStore) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        store.ascend(&mut |r: Row| {
            keys.push(r.key);
            true
        });
        keys
    }

    #[test]
    fn test_point_operations() {
        let store = SkipListRows::new();
        store.replace_or_insert(row(b"a"));
        assert!(store.get(b"a").is_some());
        assert!(store.get(b"b").is_none());
        store.delete(b"a");
        assert!(store.get(b"a").is_none());
    }

    #[test]
    fn test_traversal_bounds() {
        let store = SkipListRows::new();
        for key in [b"a", b"b", b"c", b"d"] {
            store.replace_or_insert(row(key));
        }

        assert_eq!(keys_in(&store).len(), 4);

        let mut keys = Vec::new();
        store.ascend_range(b"b", b"d", &mut |r: Row| {
            keys.push(r.key);
            true
        });
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

        let mut keys = Vec::new();
        store.ascend_less_than(b"c", &mut |r: Row| {
            keys.push(r.key);
            true
        });
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);

        let mut keys = Vec::new();
        store.ascend_greater_or_equal(b"c", &mut |r: Row| {
            keys.push(r.key);
            true
        });
        assert_eq!(keys, vec![b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_visitor_stops_iteration() {
        let store = SkipListRows::new();
        for key in [b"a", b"b", b"c"] {
            store.replace_or_insert(row(key));
        }
        let mut seen = 0;
        store.ascend(&mut |_| {
            seen += 1;
            false
        });
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_mutation_during_traversal_keeps_existing_rows() {
        let store = SkipListRows::new();
        for key in [b"a", b"c", b"e"] {
            store.replace_or_insert(row(key));
        }
        let mut seen = Vec::new();
        store.ascend(&mut |r: Row| {
            if r.key == b"a" {
                store.replace_or_insert(row(b"b"));
                store.delete(b"zz");
            }
            seen.push(r.key);
            true
        });
        // Pre-existing rows are all visited, in order.
        for want in [b"a".to_vec(), b"c".to_vec(), b"e".to_vec()] {
            assert!(seen.contains(&want));
        }
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[test]
    fn test_clear() {
        let store = SkipListRows::new();
        store.replace_or_insert(row(b"a"));
        store.clear();
        assert!(keys_in(&store).is_empty());
    }
}
