//! # Row Storage Engines
//!
//! The pluggable storage layer: an ordered map from row key to encoded row
//! with point operations and ordered traversal. Rows are serialized to bytes
//! on entry and deserialized on yield; the in-memory form held by an engine
//! is opaque to callers.
//!
//! Three engines:
//! - [`SkipListStorage`]: the preferred in-memory engine. Concurrent
//!   inserts and deletes during an in-progress traversal never corrupt the
//!   iterator: such rows may or may not be visited, but previously existing
//!   unaffected rows are always visited in order.
//! - [`DiskStorage`]: the skip-list engine backed by a per-table row log
//!   and a metadata sidecar, for persistence across restarts.
//! - [`BTreeStorage`]: a balanced-tree engine retained for comparison. It
//!   does not provide the traversal guarantee above and must not be used
//!   when scans and mutations overlap.

mod btree;
mod disk;
mod skiplist;

pub use btree::BTreeStorage;
pub use disk::DiskStorage;
pub use skiplist::SkipListStorage;

use crate::data::Row;
use crate::table::TableDef;
use std::sync::Arc;

/// Traversal callback; returns whether to keep iterating.
pub type RowVisitor<'a> = dyn FnMut(Row) -> bool + 'a;

/// Ordered row map for a single table.
pub trait RowStore: Send + Sync {
    /// Look up the row with the given key.
    fn get(&self, key: &[u8]) -> Option<Row>;

    /// Insert the row, replacing any row with an equal key.
    fn replace_or_insert(&self, row: Row);

    /// Remove the row with the given key, if present.
    fn delete(&self, key: &[u8]);

    /// Remove every row.
    fn clear(&self);

    /// Visit every row in key order until the visitor returns false.
    fn ascend(&self, visitor: &mut RowVisitor);

    /// Visit rows in `[greater_or_equal, less_than)` in key order.
    fn ascend_range(&self, greater_or_equal: &[u8], less_than: &[u8], visitor: &mut RowVisitor);

    /// Visit rows in `(-inf, less_than)` in key order.
    fn ascend_less_than(&self, less_than: &[u8], visitor: &mut RowVisitor);

    /// Visit rows in `[greater_or_equal, +inf)` in key order.
    fn ascend_greater_or_equal(&self, greater_or_equal: &[u8], visitor: &mut RowVisitor);

    /// Release backing resources.
    fn close(&self);
}

/// Storage for all emulator data: creates, enumerates and persists tables.
pub trait TableStorage: Send + Sync {
    /// Create a new table, destroying any existing table of the same name.
    fn create(&self, def: &TableDef) -> Arc<dyn RowStore>;

    /// Metadata for every stored table.
    fn get_tables(&self) -> Vec<TableDef>;

    /// Open a table previously returned by [`get_tables`].
    ///
    /// [`get_tables`]: TableStorage::get_tables
    fn open(&self, def: &TableDef) -> Arc<dyn RowStore>;

    /// Persist table metadata.
    fn set_table_meta(&self, def: &TableDef);
}

/// Encode a row for storage.
pub(crate) fn encode_row(row: &Row) -> Vec<u8> {
    bincode::serialize(row).expect("row encoding cannot fail")
}

/// Decode a stored row. Stored bytes were written by [`encode_row`].
pub(crate) fn decode_row(buf: &[u8]) -> Row {
    bincode::deserialize(buf).expect("corrupt row encoding")
}
