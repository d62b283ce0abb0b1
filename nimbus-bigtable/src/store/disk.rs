//! On-disk row storage: the skip-list engine backed by a per-table row log.
//!
//! Layout under the root directory:
//! - `<table-name>/rows.log`: length-prefixed put/delete records, replayed
//!   at open
//! - `<table-name>.table.json`: table metadata sidecar, written atomically
//!   via create-temp-then-rename

use super::{decode_row, encode_row, RowStore, RowVisitor, TableStorage};
use crate::data::Row;
use crate::table::TableDef;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

const META_SUFFIX: &str = ".table.json";
const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Persistent storage rooted at a directory, one subdirectory per table.
#[derive(Debug)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn table_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn collect_tables(dir: &Path, out: &mut Vec<TableDef>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("skipping unreadable directory {:?}: {}", dir, err);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                Self::collect_tables(&path, out);
            } else if path.to_string_lossy().ends_with(META_SUFFIX) {
                match fs::read(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|buf| serde_json::from_slice(&buf).map_err(|e| e.to_string()))
                {
                    Ok(def) => out.push(def),
                    Err(err) => warn!("skipping unreadable table sidecar {:?}: {}", path, err),
                }
            }
        }
    }
}

impl TableStorage for DiskStorage {
    fn create(&self, def: &TableDef) -> Arc<dyn RowStore> {
        self.set_table_meta(def);
        Arc::new(DiskRows::open(self.table_dir(&def.name), true))
    }

    fn get_tables(&self) -> Vec<TableDef> {
        let mut out = Vec::new();
        if self.root.exists() {
            Self::collect_tables(&self.root, &mut out);
        }
        out
    }

    fn open(&self, def: &TableDef) -> Arc<dyn RowStore> {
        Arc::new(DiskRows::open(self.table_dir(&def.name), false))
    }

    fn set_table_meta(&self, def: &TableDef) {
        let dir = self.table_dir(&def.name);
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!("could not create table directory {:?}: {}", dir, err);
            return;
        }

        let buf = serde_json::to_vec_pretty(def).expect("table metadata encoding cannot fail");
        let out_path = PathBuf::from(format!("{}{}", dir.display(), META_SUFFIX));
        let tmp_path = PathBuf::from(format!("{}{}.tmp", dir.display(), META_SUFFIX));
        if let Err(err) = fs::write(&tmp_path, &buf) {
            warn!("could not write table sidecar {:?}: {}", tmp_path, err);
            return;
        }
        if let Err(err) = fs::rename(&tmp_path, &out_path) {
            warn!("could not rename table sidecar into place {:?}: {}", out_path, err);
        }
    }
}

struct DiskRows {
    map: SkipMap<Vec<u8>, Vec<u8>>,
    log: Mutex<BufWriter<File>>,
}

impl DiskRows {
    fn open(dir: PathBuf, nuke: bool) -> Self {
        if nuke {
            let _ = fs::remove_dir_all(&dir);
        }
        fs::create_dir_all(&dir).expect("create table directory");

        let log_path = dir.join("rows.log");
        let map = SkipMap::new();
        if log_path.exists() {
            replay_log(&log_path, &map);
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .expect("open row log");
        Self { map, log: Mutex::new(BufWriter::new(file)) }
    }

    fn append(&self, op: u8, key: &[u8], value: Option<&[u8]>) {
        let mut log = self.log.lock();
        let result = (|| -> std::io::Result<()> {
            log.write_u8(op)?;
            log.write_u32::<LittleEndian>(key.len() as u32)?;
            log.write_all(key)?;
            if let Some(value) = value {
                log.write_u32::<LittleEndian>(value.len() as u32)?;
                log.write_all(value)?;
            }
            log.flush()
        })();
        if let Err(err) = result {
            warn!("row log append failed: {}", err);
        }
    }
}

fn replay_log(path: &Path, map: &SkipMap<Vec<u8>, Vec<u8>>) {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!("could not open row log {:?}: {}", path, err);
            return;
        }
    };
    let mut reader = BufReader::new(file);
    loop {
        let op = match reader.read_u8() {
            Ok(op) => op,
            Err(_) => return, // end of log
        };
        let result = (|| -> std::io::Result<()> {
            let klen = reader.read_u32::<LittleEndian>()? as usize;
            let mut key = vec![0u8; klen];
            reader.read_exact(&mut key)?;
            match op {
                OP_PUT => {
                    let vlen = reader.read_u32::<LittleEndian>()? as usize;
                    let mut value = vec![0u8; vlen];
                    reader.read_exact(&mut value)?;
                    map.insert(key, value);
                }
                OP_DELETE => {
                    map.remove(&key);
                }
                other => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("unknown row log op {other}"),
                    ));
                }
            }
            Ok(())
        })();
        if let Err(err) = result {
            warn!("row log {:?} truncated or corrupt: {}", path, err);
            return;
        }
    }
}

impl RowStore for DiskRows {
    fn get(&self, key: &[u8]) -> Option<Row> {
        self.map.get(key).map(|entry| decode_row(entry.value()))
    }

    fn replace_or_insert(&self, row: Row) {
        let buf = encode_row(&row);
        self.append(OP_PUT, &row.key, Some(&buf));
        self.map.insert(row.key, buf);
    }

    fn delete(&self, key: &[u8]) {
        self.append(OP_DELETE, key, None);
        self.map.remove(key);
    }

    fn clear(&self) {
        let mut log = self.log.lock();
        let result = (|| -> std::io::Result<()> {
            log.flush()?;
            log.get_mut().set_len(0)?;
            log.get_mut().seek(SeekFrom::Start(0))?;
            Ok(())
        })();
        if let Err(err) = result {
            warn!("row log truncate failed: {}", err);
        }
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
        let range = (Bound::Included(greater_or_equal), Bound::Excluded(less_than));
        for entry in self.map.range::<[u8], _>(range) {
            if !visitor(decode_row(entry.value())) {
                return;
            }
        }
    }

    fn ascend_less_than(&self, less_than: &[u8], visitor: &mut RowVisitor) {
        let range: (Bound<&[u8]>, Bound<&[u8]>) = (Bound::Unbounded, Bound::Excluded(less_than));
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

    fn close(&self) {
        if let Err(err) = self.log.lock().flush() {
            warn!("row log flush on close failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Cell;

    fn row(key: &[u8], value: &[u8]) -> Row {
        let mut r = Row::new(key.to_vec());
        r.ensure_family("cf")
            .ensure_column(b"q")
            .append_or_replace_cell(Cell::new(1000, value.to_vec()));
        r
    }

    fn def(name: &str) -> TableDef {
        TableDef { name: name.to_string(), ..Default::default() }
    }

    #[test]
    fn test_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path());

        let table = def("projects/p/instances/i/tables/t");
        let rows = storage.create(&table);
        rows.replace_or_insert(row(b"a", b"1"));
        rows.replace_or_insert(row(b"b", b"2"));
        rows.delete(b"a");
        rows.close();

        let tables = storage.get_tables();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, table.name);

        let rows = storage.open(&tables[0]);
        assert!(rows.get(b"a").is_none());
        let b = rows.get(b"b").unwrap();
        assert_eq!(b.families[0].columns[0].cells[0].value, b"2");
    }

    #[test]
    fn test_create_nukes_existing_data() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path());

        let table = def("projects/p/instances/i/tables/t");
        let rows = storage.create(&table);
        rows.replace_or_insert(row(b"a", b"1"));
        rows.close();

        let rows = storage.create(&table);
        assert!(rows.get(b"a").is_none());
    }

    #[test]
    fn test_unreadable_sidecar_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path());
        storage.create(&def("projects/p/instances/i/tables/good")).close();

        fs::write(
            dir.path().join("projects/p/instances/i/tables/bad.table.json"),
            b"not json",
        )
        .unwrap();

        let tables = storage.get_tables();
        assert_eq!(tables.len(), 1);
        assert!(tables[0].name.ends_with("good"));
    }

    #[test]
    fn test_clear_truncates_log() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path());
        let table = def("projects/p/instances/i/tables/t");

        let rows = storage.create(&table);
        rows.replace_or_insert(row(b"a", b"1"));
        rows.clear();
        rows.replace_or_insert(row(b"b", b"2"));
        rows.close();

        let rows = storage.open(&table);
        assert!(rows.get(b"a").is_none());
        assert!(rows.get(b"b").is_some());
    }

    #[test]
    fn test_truncated_log_tail_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path());
        let table = def("projects/p/instances/i/tables/t");

        let rows = storage.create(&table);
        rows.replace_or_insert(row(b"a", b"1"));
        rows.close();

        let log_path = dir.path().join(&table.name).join("rows.log");
        let full = fs::read(&log_path).unwrap();
        let mut cut = full.clone();
        cut.extend_from_slice(&[OP_PUT, 200]); // half a record
        fs::write(&log_path, &cut).unwrap();

        let rows = storage.open(&table);
        assert!(rows.get(b"a").is_some());
    }
}
