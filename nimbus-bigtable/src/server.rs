//! # Emulator Service
//!
//! The Bigtable emulator facade: the process-wide table map, the admin and
//! data planes, and the garbage-collection loop. Each operation consumes a
//! typed request value; streaming operations push frames through a
//! caller-supplied [`FrameSink`].

use crate::data::Row;
use crate::filter::{filter_row, RowFilter};
use crate::mutation::{apply_mutations, Mutation};
use crate::range::{merge_row_ranges, successor, RowSet, SimpleRange};
use crate::rmw::{apply_read_modify_write, ReadModifyWriteRule};
use crate::scan::{ChunkBuilder, FrameSink, ReadRowsResponse, SampleRowKeysResponse};
use crate::store::TableStorage;
use crate::table::{FamilyDef, Table, TableDef};
use nimbus_core::time::{micros_rounded, nanos_of, system_clock, Clock};
use nimbus_core::{Error, Result, StopSignal};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

// ========== Request / response messages ==========

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTableRequest {
    pub parent: String,
    pub table_id: String,
    #[serde(default)]
    pub table: Option<TableDef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListTablesRequest {
    pub parent: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListTablesResponse {
    pub tables: Vec<TableDef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifyColumnFamiliesRequest {
    pub name: String,
    pub modifications: Vec<FamilyModification>,
}

/// One modification within a modify-column-families call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FamilyModification {
    Create { id: String, family: FamilyDef },
    Update { id: String, family: FamilyDef },
    Drop { id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropRowRangeRequest {
    pub name: String,
    pub target: DropRowRangeTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropRowRangeTarget {
    RowKeyPrefix(Vec<u8>),
    DeleteAllDataFromTable(bool),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateConsistencyTokenResponse {
    pub consistency_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckConsistencyRequest {
    pub name: String,
    pub consistency_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckConsistencyResponse {
    pub consistent: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadRowsRequest {
    pub table_name: String,
    #[serde(default)]
    pub rows: Option<RowSet>,
    #[serde(default)]
    pub filter: Option<RowFilter>,
    #[serde(default)]
    pub rows_limit: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutateRowRequest {
    pub table_name: String,
    pub row_key: Vec<u8>,
    pub mutations: Vec<Mutation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutateRowsRequest {
    pub table_name: String,
    pub entries: Vec<MutateRowsEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutateRowsEntry {
    pub row_key: Vec<u8>,
    pub mutations: Vec<Mutation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutateRowsResponse {
    pub entries: Vec<MutateRowsResponseEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutateRowsResponseEntry {
    pub index: i64,
    pub status: EntryStatus,
}

/// Per-entry status; code 0 is OK, otherwise a gRPC status code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryStatus {
    pub code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckAndMutateRowRequest {
    pub table_name: String,
    pub row_key: Vec<u8>,
    #[serde(default)]
    pub predicate_filter: Option<RowFilter>,
    #[serde(default)]
    pub true_mutations: Vec<Mutation>,
    #[serde(default)]
    pub false_mutations: Vec<Mutation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckAndMutateRowResponse {
    pub predicate_matched: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadModifyWriteRowRequest {
    pub table_name: String,
    pub row_key: Vec<u8>,
    pub rules: Vec<ReadModifyWriteRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadModifyWriteRowResponse {
    pub row: Row,
}

// ========== Emulator ==========

const GC_MIN_WAIT_MS: u64 = 15_000;
const GC_MAX_WAIT_MS: u64 = 60_000;

/// An in-process Cloud Bigtable fake. It is unauthenticated and only a
/// rough approximation; the project/instance parts of table names are kept
/// verbatim and never validated.
pub struct BigtableEmulator {
    storage: Arc<dyn TableStorage>,
    clock: Clock,
    tables: Mutex<HashMap<String, Arc<Table>>>,
    stop: StopSignal,
}

impl BigtableEmulator {
    /// Create an emulator over the given storage, initializing tables the
    /// storage already knows about, and start the GC loop.
    pub fn new(storage: Arc<dyn TableStorage>) -> Arc<Self> {
        Self::with_clock(storage, system_clock)
    }

    /// Like [`new`], with an injectable clock for tests.
    ///
    /// [`new`]: BigtableEmulator::new
    pub fn with_clock(storage: Arc<dyn TableStorage>, clock: Clock) -> Arc<Self> {
        let mut tables = HashMap::new();
        for def in storage.get_tables() {
            let rows = storage.open(&def);
            info!("opened table {}", def.name);
            tables.insert(def.name.clone(), Arc::new(Table::new(def, rows)));
        }

        let emu = Arc::new(Self {
            storage,
            clock,
            tables: Mutex::new(tables),
            stop: StopSignal::new(),
        });

        let gc = Arc::clone(&emu);
        std::thread::spawn(move || gc.gc_loop());

        emu
    }

    /// Broadcast shutdown and close every table's rows under its write lock.
    pub fn shutdown(&self) {
        self.stop.trigger();
        let tables: Vec<Arc<Table>> = self.tables.lock().values().cloned().collect();
        for tbl in tables {
            let _def = tbl.def.write();
            tbl.rows.close();
        }
    }

    /// The shutdown/cancellation signal, for transport adapters.
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("table", name))
    }

    fn now_micros(&self) -> i64 {
        micros_rounded((self.clock)())
    }

    // ========== Admin plane ==========

    pub fn create_table(&self, req: &CreateTableRequest) -> Result<TableDef> {
        let name = format!("{}/tables/{}", req.parent, req.table_id);

        let mut tables = self.tables.lock();
        if tables.contains_key(&name) {
            return Err(Error::already_exists("table", name));
        }
        let mut def = req.table.clone().unwrap_or_default();
        def.name = name.clone();
        let rows = self.storage.create(&def);
        tables.insert(name, Arc::new(Table::new(def.clone(), rows)));
        Ok(def)
    }

    pub fn list_tables(&self, req: &ListTablesRequest) -> ListTablesResponse {
        let prefix = format!("{}/tables/", req.parent);
        let tables = self.tables.lock();
        let mut names: Vec<&String> =
            tables.keys().filter(|name| name.starts_with(&prefix)).collect();
        names.sort();
        ListTablesResponse {
            tables: names
                .into_iter()
                .map(|name| TableDef { name: name.clone(), ..Default::default() })
                .collect(),
        }
    }

    pub fn get_table(&self, name: &str) -> Result<TableDef> {
        let tbl = self.table(name)?;
        let def = tbl.def.read().clone();
        Ok(def)
    }

    pub fn delete_table(&self, name: &str) -> Result<()> {
        let tbl = self
            .tables
            .lock()
            .remove(name)
            .ok_or_else(|| Error::not_found("table", name))?;
        let _def = tbl.def.write();
        tbl.rows.close();
        Ok(())
    }

    pub fn modify_column_families(&self, req: &ModifyColumnFamiliesRequest) -> Result<TableDef> {
        let tbl = self.table(&req.name)?;
        let mut def = tbl.def.write();

        for modification in &req.modifications {
            match modification {
                FamilyModification::Create { id, family } => {
                    if def.column_families.contains_key(id) {
                        return Err(Error::already_exists("family", id.clone()));
                    }
                    def.column_families.insert(id.clone(), family.clone());
                }
                FamilyModification::Update { id, family } => {
                    let existing = def
                        .column_families
                        .get_mut(id)
                        .ok_or_else(|| Error::invalid(format!("no such family {id:?}")))?;
                    existing.gc_rule = family.gc_rule.clone();
                }
                FamilyModification::Drop { id } => {
                    if def.column_families.remove(id).is_none() {
                        return Err(Error::invalid(format!("can't delete unknown family {id:?}")));
                    }
                    // Purge the dropped family's data from every row.
                    tbl.rows.ascend(&mut |mut row: Row| {
                        if row.scrub(|fam| def.has_family(fam)) {
                            tbl.update_row(row, &def);
                        }
                        true
                    });
                }
            }
        }

        self.storage.set_table_meta(&def);
        Ok(def.clone())
    }

    pub fn drop_row_range(&self, req: &DropRowRangeRequest) -> Result<()> {
        let tbl = self.table(&req.name)?;
        let _def = tbl.def.write();

        match &req.target {
            DropRowRangeTarget::DeleteAllDataFromTable(_) => tbl.rows.clear(),
            DropRowRangeTarget::RowKeyPrefix(prefix) => {
                if prefix.is_empty() {
                    return Err(Error::invalid("missing row key prefix"));
                }
                // The storage contract does not define deletion during
                // traversal, so collect first, then delete.
                let mut doomed = Vec::new();
                tbl.rows.ascend_greater_or_equal(prefix, &mut |row: Row| {
                    if row.key.starts_with(prefix) {
                        doomed.push(row.key);
                        true
                    } else {
                        false
                    }
                });
                for key in doomed {
                    tbl.rows.delete(&key);
                }
            }
        }
        Ok(())
    }

    pub fn generate_consistency_token(
        &self,
        name: &str,
    ) -> Result<GenerateConsistencyTokenResponse> {
        self.table(name)?;
        Ok(GenerateConsistencyTokenResponse {
            consistency_token: format!("TokenFor-{name}"),
        })
    }

    pub fn check_consistency(
        &self,
        req: &CheckConsistencyRequest,
    ) -> Result<CheckConsistencyResponse> {
        self.table(&req.name)?;
        if req.consistency_token != format!("TokenFor-{}", req.name) {
            return Err(Error::invalid(format!(
                "token {:?} not valid",
                req.consistency_token
            )));
        }
        // A single-cluster instance is always consistent.
        Ok(CheckConsistencyResponse { consistent: true })
    }

    // ========== Data plane ==========

    pub fn read_rows(
        &self,
        req: &ReadRowsRequest,
        sink: &mut dyn FrameSink<ReadRowsResponse>,
        cancel: &StopSignal,
    ) -> Result<()> {
        let tbl = self.table(&req.table_name)?;
        let result = self.stream_rows(&tbl, req, sink, cancel);
        tbl.read();
        result
    }

    fn stream_rows(
        &self,
        tbl: &Table,
        req: &ReadRowsRequest,
        sink: &mut dyn FrameSink<ReadRowsResponse>,
        cancel: &StopSignal,
    ) -> Result<()> {
        if req.rows_limit < 0 {
            return Err(Error::invalid("rows_limit cannot be negative"));
        }

        let ranges = match &req.rows {
            Some(rows) if !rows.is_unbounded() => {
                validate_row_ranges(rows)?;
                merge_row_ranges(&rows.row_keys, &rows.row_ranges)
            }
            _ => vec![SimpleRange::unbounded()],
        };

        let limit = req.rows_limit as usize;
        let mut count = 0usize;
        let mut cb = ChunkBuilder::default();

        for sr in &ranges {
            let mut resume: Option<Vec<u8>> = None;
            loop {
                let def = tbl.def.read();
                let mut err: Option<Error> = None;
                let mut last_key: Option<Vec<u8>> = None;
                let mut flush = false;

                let mut visit = |mut row: Row| -> bool {
                    if limit > 0 && count >= limit {
                        return false;
                    }
                    if row.families.is_empty() {
                        return true;
                    }
                    if let Some(filter) = &req.filter {
                        match filter_row(filter, &mut row) {
                            Ok(true) => {}
                            Ok(false) => return true,
                            Err(e) => {
                                err = Some(e);
                                return false;
                            }
                        }
                    }
                    row.scrub(|fam| def.has_family(fam));
                    if cb.add(&row) {
                        count += 1;
                    }
                    last_key = Some(row.key);
                    if cb.should_flush() {
                        flush = true;
                        return false;
                    }
                    true
                };
                let start = resume.as_deref().unwrap_or(&sr.start);
                match (start.is_empty(), sr.end.is_empty()) {
                    (true, true) => tbl.rows.ascend(&mut visit),
                    (true, false) => tbl.rows.ascend_less_than(&sr.end, &mut visit),
                    (false, true) => tbl.rows.ascend_greater_or_equal(start, &mut visit),
                    (false, false) => tbl.rows.ascend_range(start, &sr.end, &mut visit),
                }
                drop(def);

                if let Some(e) = err {
                    return Err(e);
                }
                if !flush {
                    break;
                }
                // Send the frame with the read lock released so writers can
                // progress, then resume after the last emitted row.
                if cancel.is_stopped() {
                    return Err(Error::Cancelled);
                }
                sink.send(cb.take_frame())?;
                resume = last_key.map(|k| successor(&k));
            }
        }

        if !cb.chunks.is_empty() {
            if cancel.is_stopped() {
                return Err(Error::Cancelled);
            }
            sink.send(cb.take_frame())?;
        }
        Ok(())
    }

    pub fn mutate_row(&self, req: &MutateRowRequest) -> Result<()> {
        let tbl = self.table(&req.table_name)?;
        let result = {
            let def = tbl.def.write();
            let now = self.now_micros();
            let mut row = tbl.get_or_create_row(&req.row_key);
            // The batch mutates an owned row value; the store sees nothing
            // unless the whole batch succeeds.
            apply_mutations(&mut row, &req.mutations, |fam| def.has_family(fam), now)
                .map(|()| tbl.update_row(row, &def))
        };
        tbl.write();
        result
    }

    pub fn mutate_rows(
        &self,
        req: &MutateRowsRequest,
        sink: &mut dyn FrameSink<MutateRowsResponse>,
    ) -> Result<()> {
        let tbl = self.table(&req.table_name)?;
        let mut entries = Vec::with_capacity(req.entries.len());
        {
            let def = tbl.def.write();
            let now = self.now_micros();
            for (index, entry) in req.entries.iter().enumerate() {
                let mut row = tbl.get_or_create_row(&entry.row_key);
                let status = match apply_mutations(
                    &mut row,
                    &entry.mutations,
                    |fam| def.has_family(fam),
                    now,
                ) {
                    Ok(()) => {
                        tbl.update_row(row, &def);
                        EntryStatus::default()
                    }
                    Err(e) => EntryStatus { code: e.grpc_code(), message: e.to_string() },
                };
                entries.push(MutateRowsResponseEntry { index: index as i64, status });
            }
        }
        tbl.write();
        sink.send(MutateRowsResponse { entries })
    }

    pub fn check_and_mutate_row(
        &self,
        req: &CheckAndMutateRowRequest,
    ) -> Result<CheckAndMutateRowResponse> {
        let tbl = self.table(&req.table_name)?;
        let result = (|| {
            let def = tbl.def.write();
            let now = self.now_micros();
            let mut row = tbl.get_or_create_row(&req.row_key);

            let matched = match &req.predicate_filter {
                // No predicate: the true branch applies iff the row holds
                // any cells.
                None => !row.is_empty(),
                Some(filter) => {
                    let mut copy = row.clone();
                    filter_row(filter, &mut copy)? && !copy.is_empty()
                }
            };

            let mutations =
                if matched { &req.true_mutations } else { &req.false_mutations };
            apply_mutations(&mut row, mutations, |fam| def.has_family(fam), now)?;
            tbl.update_row(row, &def);
            Ok(CheckAndMutateRowResponse { predicate_matched: matched })
        })();
        tbl.write();
        result
    }

    pub fn read_modify_write_row(
        &self,
        req: &ReadModifyWriteRowRequest,
    ) -> Result<ReadModifyWriteRowResponse> {
        let tbl = self.table(&req.table_name)?;
        let result = (|| {
            let def = tbl.def.write();
            let now = self.now_micros();
            let mut row = tbl.get_or_create_row(&req.row_key);

            let mut written =
                apply_read_modify_write(&mut row, &req.rules, |fam| def.has_family(fam), now)?;
            tbl.update_row(row, &def);
            written.scrub(|fam| def.has_family(fam));
            Ok(ReadModifyWriteRowResponse { row: written })
        })();
        tbl.write();
        result
    }

    pub fn sample_row_keys(
        &self,
        table_name: &str,
        sink: &mut dyn FrameSink<SampleRowKeysResponse>,
        cancel: &StopSignal,
    ) -> Result<()> {
        let tbl = self.table(table_name)?;
        let _def = tbl.def.read();

        // Emit at least the final row key; sample the rest at 1%.
        let mut offset: i64 = 0;
        let mut pending: Option<(Vec<u8>, i64)> = None;
        let mut err: Option<Error> = None;
        let mut rng = rand::thread_rng();
        tbl.rows.ascend(&mut |row: Row| {
            if cancel.is_stopped() {
                err = Some(Error::Cancelled);
                return false;
            }
            let size = row.size() as i64;
            if rng.gen_range(0..100) == 0 {
                if let Err(e) =
                    sink.send(SampleRowKeysResponse { row_key: row.key, offset_bytes: offset })
                {
                    err = Some(e);
                    return false;
                }
                pending = None;
            } else {
                pending = Some((row.key, size));
            }
            offset += size;
            true
        });
        if let Some(e) = err {
            return Err(e);
        }
        if let Some((row_key, size)) = pending {
            sink.send(SampleRowKeysResponse { row_key, offset_bytes: offset - size })?;
        }
        Ok(())
    }

    // ========== GC loop ==========

    fn gc_loop(&self) {
        loop {
            let jitter =
                rand::thread_rng().gen_range(GC_MIN_WAIT_MS..GC_MAX_WAIT_MS);
            if self.stop.wait_timeout(Duration::from_millis(jitter)) {
                return;
            }

            // Oldest-modified tables first.
            let mut todos: Vec<(i64, Arc<Table>)> = self
                .tables
                .lock()
                .values()
                .map(|tbl| (tbl.last_write_nanos(), Arc::clone(tbl)))
                .collect();
            todos.sort_by_key(|(last_write, _)| *last_write);

            let now_micros = nanos_of((self.clock)()) / 1000;
            for (_, tbl) in todos {
                tbl.gc(now_micros, &self.stop, false);
                if self.stop.is_stopped() {
                    return;
                }
            }
        }
    }
}

fn validate_row_ranges(rows: &RowSet) -> Result<()> {
    for rr in &rows.row_ranges {
        let start = rr.start_key_closed.as_ref().or(rr.start_key_open.as_ref());
        let end = rr.end_key_open.as_ref().or(rr.end_key_closed.as_ref());
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(Error::invalid("inverted row range"));
            }
        }
    }
    Ok(())
}
