//! # Object Store Backends
//!
//! The mapping (bucket, object-name) → (metadata, content bytes), backed by
//! in-memory ordered maps or an on-disk tree in which each object is a pair
//! of files: the payload at its own path and a `.emumeta` sidecar holding
//! the pretty-printed metadata.

use crate::meta::{self, Bucket, Object};
use bytes::Bytes;
use nimbus_core::time::{rfc3339_from_nanos, rfc3339_nanos, unix_nanos};
use nimbus_core::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Sidecar suffix for on-disk object metadata.
pub const META_EXTENSION: &str = ".emumeta";

/// Storage backend for the emulator. Object names are yielded by `walk` in
/// byte-lexicographic order, skipping metadata sidecars.
pub trait ObjectStore: Send + Sync {
    /// Create a bucket; creating an existing bucket is a no-op.
    fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Bucket metadata, or `None` when the bucket does not exist.
    fn get_bucket_meta(&self, base_url: &str, bucket: &str) -> Result<Option<Bucket>>;

    /// Object metadata and content, or `None` when absent.
    fn get(&self, base_url: &str, bucket: &str, name: &str) -> Result<Option<(Object, Bytes)>>;

    /// Object metadata alone, or `None` when absent.
    fn get_meta(&self, base_url: &str, bucket: &str, name: &str) -> Result<Option<Object>>;

    /// Write payload and metadata. `meta` is scrubbed and completed in
    /// place; generation derives from the write time and metageneration
    /// restarts at 1.
    fn add(&self, bucket: &str, name: &str, content: Bytes, meta: &mut Object) -> Result<()>;

    /// Replace an existing object's metadata with the given metageneration.
    fn update_meta(&self, bucket: &str, name: &str, meta: &mut Object, metageneration: i64)
        -> Result<()>;

    /// Server-side copy preserving metadata except creation time. Returns
    /// false when the source does not exist.
    fn copy(&self, src_bucket: &str, src: &str, dst_bucket: &str, dst: &str) -> Result<bool>;

    /// Delete an object (payload and sidecar), or the whole bucket when
    /// `name` is empty. Not-found is an error.
    fn delete(&self, bucket: &str, name: &str) -> Result<()>;

    /// Visit object names in byte order until the visitor returns false.
    fn walk(&self, bucket: &str, visit: &mut dyn FnMut(&str) -> bool) -> Result<()>;
}

// ========== Memory store ==========

#[derive(Debug, Clone)]
struct MemObject {
    meta: Object,
    content: Bytes,
    generation_nanos: i64,
    updated_nanos: i64,
}

#[derive(Debug, Default)]
struct MemBucket {
    created_nanos: i64,
    updated_nanos: i64,
    objects: BTreeMap<String, MemObject>,
}

/// In-memory backend: nested ordered maps under a read-write lock.
#[derive(Debug, Default)]
pub struct MemStore {
    buckets: RwLock<BTreeMap<String, MemBucket>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemStore {
    fn create_bucket(&self, bucket: &str) -> Result<()> {
        let mut buckets = self.buckets.write();
        buckets.entry(bucket.to_string()).or_insert_with(|| {
            let now = unix_nanos();
            MemBucket { created_nanos: now, updated_nanos: now, objects: BTreeMap::new() }
        });
        Ok(())
    }

    fn get_bucket_meta(&self, base_url: &str, bucket: &str) -> Result<Option<Bucket>> {
        let buckets = self.buckets.read();
        let Some(mb) = buckets.get(bucket) else {
            return Ok(None);
        };
        let mut out = meta::bucket_meta(base_url, bucket);
        out.metageneration = mb.created_nanos;
        out.time_created = rfc3339_from_nanos(mb.created_nanos);
        out.updated = rfc3339_from_nanos(mb.updated_nanos);
        Ok(Some(out))
    }

    fn get(&self, base_url: &str, bucket: &str, name: &str) -> Result<Option<(Object, Bytes)>> {
        let buckets = self.buckets.read();
        let Some(obj) = buckets.get(bucket).and_then(|mb| mb.objects.get(name)) else {
            return Ok(None);
        };
        Ok(Some((mem_meta(base_url, bucket, name, obj), obj.content.clone())))
    }

    fn get_meta(&self, base_url: &str, bucket: &str, name: &str) -> Result<Option<Object>> {
        let buckets = self.buckets.read();
        let Some(obj) = buckets.get(bucket).and_then(|mb| mb.objects.get(name)) else {
            return Ok(None);
        };
        Ok(Some(mem_meta(base_url, bucket, name, obj)))
    }

    fn add(&self, bucket: &str, name: &str, content: Bytes, meta: &mut Object) -> Result<()> {
        let now = unix_nanos();
        meta::init_scrubbed_meta(meta, name);
        meta.metageneration = 1;
        if meta.time_created.is_empty() {
            meta.time_created = rfc3339_from_nanos(now);
        }

        let mut buckets = self.buckets.write();
        let mb = buckets.entry(bucket.to_string()).or_default();
        mb.updated_nanos = now;
        mb.objects.insert(
            name.to_string(),
            MemObject { meta: meta.clone(), content, generation_nanos: now, updated_nanos: now },
        );
        Ok(())
    }

    fn update_meta(
        &self,
        bucket: &str,
        name: &str,
        meta: &mut Object,
        metageneration: i64,
    ) -> Result<()> {
        meta::init_scrubbed_meta(meta, name);
        meta.metageneration = metageneration;

        let mut buckets = self.buckets.write();
        let obj = buckets
            .get_mut(bucket)
            .and_then(|mb| mb.objects.get_mut(name))
            .ok_or_else(|| Error::not_found("object", format!("{bucket}/{name}")))?;
        obj.meta = meta.clone();
        obj.updated_nanos = unix_nanos();
        Ok(())
    }

    fn copy(&self, src_bucket: &str, src: &str, dst_bucket: &str, dst: &str) -> Result<bool> {
        let (mut meta, content) = {
            let buckets = self.buckets.read();
            match buckets.get(src_bucket).and_then(|mb| mb.objects.get(src)) {
                Some(obj) => (obj.meta.clone(), obj.content.clone()),
                None => return Ok(false),
            }
        };
        meta.time_created = String::new(); // reset creation time on the copy
        self.add(dst_bucket, dst, content, &mut meta)?;
        Ok(true)
    }

    fn delete(&self, bucket: &str, name: &str) -> Result<()> {
        let mut buckets = self.buckets.write();
        if name.is_empty() {
            buckets
                .remove(bucket)
                .map(|_| ())
                .ok_or_else(|| Error::not_found("bucket", bucket))
        } else {
            buckets
                .get_mut(bucket)
                .and_then(|mb| mb.objects.remove(name))
                .map(|_| ())
                .ok_or_else(|| Error::not_found("object", format!("{bucket}/{name}")))
        }
    }

    fn walk(&self, bucket: &str, visit: &mut dyn FnMut(&str) -> bool) -> Result<()> {
        let buckets = self.buckets.read();
        let Some(mb) = buckets.get(bucket) else {
            return Err(Error::not_found("bucket", bucket));
        };
        for name in mb.objects.keys() {
            if !visit(name) {
                break;
            }
        }
        Ok(())
    }
}

fn mem_meta(base_url: &str, bucket: &str, name: &str, obj: &MemObject) -> Object {
    let mut out = obj.meta.clone();
    meta::init_meta_with_urls(base_url, &mut out, bucket, name, obj.content.len() as u64);
    out.generation = obj.generation_nanos;
    out.updated = rfc3339_from_nanos(obj.updated_nanos);
    meta::finalize_meta(&mut out, bucket, name);
    out
}

// ========== File store ==========

/// On-disk backend rooted at a directory: one directory per bucket, each
/// object stored at its path with a `.emumeta` sidecar. The object's
/// generation is the payload's mtime in nanoseconds. A payload without a
/// sidecar (a legacy file) is still readable.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, bucket: &str, name: &str) -> PathBuf {
        if name.is_empty() {
            self.root.join(bucket)
        } else {
            self.root.join(bucket).join(name)
        }
    }

    fn read_sidecar(path: &Path) -> Result<Object> {
        let meta_path = meta_filename(path);
        match fs::read(&meta_path) {
            Ok(buf) => serde_json::from_slice(&buf).map_err(|e| {
                Error::internal(format!("could not parse sidecar {meta_path:?}: {e}"))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Object::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn read_meta(
        &self,
        base_url: &str,
        bucket: &str,
        name: &str,
        info: &fs::Metadata,
    ) -> Result<Object> {
        let path = self.path_of(bucket, name);
        let mut obj = Self::read_sidecar(&path)?;

        init_with_info(base_url, &mut obj, bucket, name, info);
        meta::finalize_meta(&mut obj, bucket, name);
        Ok(obj)
    }

    fn stat_object(&self, bucket: &str, name: &str) -> Result<Option<fs::Metadata>> {
        let path = self.path_of(bucket, name);
        let info = match fs::metadata(&path) {
            Ok(info) => info,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        // A directory is only an object when named with a trailing slash
        // (a directory marker), and vice versa.
        if info.is_dir() != name.ends_with('/') {
            return Ok(None);
        }
        Ok(Some(info))
    }
}

impl ObjectStore for FileStore {
    fn create_bucket(&self, bucket: &str) -> Result<()> {
        let dir = self.root.join(bucket);
        fs::create_dir_all(&dir)?;

        let now = unix_nanos();
        let mut bucket_meta = Bucket { metageneration: now, ..Default::default() };
        if bucket_meta.time_created.is_empty() {
            bucket_meta.time_created = rfc3339_from_nanos(now);
        }
        fs::write(meta_filename(&dir), to_pretty_json(&bucket_meta))?;
        Ok(())
    }

    fn get_bucket_meta(&self, base_url: &str, bucket: &str) -> Result<Option<Bucket>> {
        let dir = self.root.join(bucket);
        let info = match fs::metadata(&dir) {
            Ok(info) => info,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut out = meta::bucket_meta(base_url, bucket);
        if let Ok(buf) = fs::read(meta_filename(&dir)) {
            if let Ok(stored) = serde_json::from_slice::<Bucket>(&buf) {
                out.metageneration = stored.metageneration;
                out.time_created = stored.time_created;
            }
        }
        out.updated = rfc3339_of(info.modified());
        Ok(Some(out))
    }

    fn get(&self, base_url: &str, bucket: &str, name: &str) -> Result<Option<(Object, Bytes)>> {
        let Some(info) = self.stat_object(bucket, name)? else {
            return Ok(None);
        };
        let obj = self.read_meta(base_url, bucket, name, &info)?;
        let content = if info.is_dir() {
            Bytes::new()
        } else {
            Bytes::from(fs::read(self.path_of(bucket, name))?)
        };
        Ok(Some((obj, content)))
    }

    fn get_meta(&self, base_url: &str, bucket: &str, name: &str) -> Result<Option<Object>> {
        let Some(info) = self.stat_object(bucket, name)? else {
            return Ok(None);
        };
        Ok(Some(self.read_meta(base_url, bucket, name, &info)?))
    }

    fn add(&self, bucket: &str, name: &str, content: Bytes, meta: &mut Object) -> Result<()> {
        let path = self.path_of(bucket, name);
        if name.ends_with('/') {
            if !content.is_empty() {
                return Err(Error::invalid(format!(
                    "directory marker {name:?} must be zero-length"
                )));
            }
            fs::create_dir_all(&path)?;
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &content)?;
        }

        meta::init_scrubbed_meta(meta, name);
        meta.metageneration = 1;
        if meta.time_created.is_empty() {
            meta.time_created = rfc3339_from_nanos(unix_nanos());
        }
        fs::write(meta_filename(&path), to_pretty_json(meta))?;
        Ok(())
    }

    fn update_meta(
        &self,
        bucket: &str,
        name: &str,
        meta: &mut Object,
        metageneration: i64,
    ) -> Result<()> {
        meta::init_scrubbed_meta(meta, name);
        meta.metageneration = metageneration;
        let path = self.path_of(bucket, name);
        fs::write(meta_filename(&path), to_pretty_json(meta))?;
        Ok(())
    }

    fn copy(&self, src_bucket: &str, src: &str, dst_bucket: &str, dst: &str) -> Result<bool> {
        let Some(info) = self.stat_object(src_bucket, src)? else {
            return Ok(false);
        };
        let mut meta = self.read_meta("", src_bucket, src, &info)?;
        meta::scrub_meta(&mut meta);
        meta.generation = 0;
        meta.updated = String::new();
        meta.time_created = String::new(); // reset creation time on the copy

        let content = if info.is_dir() {
            Bytes::new()
        } else {
            Bytes::from(fs::read(self.path_of(src_bucket, src))?)
        };
        self.add(dst_bucket, dst, content, &mut meta)?;
        Ok(true)
    }

    fn delete(&self, bucket: &str, name: &str) -> Result<()> {
        let path = self.path_of(bucket, name);
        if name.is_empty() {
            if !path.exists() {
                return Err(Error::not_found("bucket", bucket));
            }
            fs::remove_dir_all(&path)?;
            let _ = fs::remove_file(meta_filename(&path));
            return Ok(());
        }

        let result = if name.ends_with('/') {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("object", format!("{bucket}/{name}")));
            }
            Err(err) => return Err(err.into()),
        }
        // Legacy payloads have no sidecar.
        let _ = fs::remove_file(meta_filename(&path));
        Ok(())
    }

    fn walk(&self, bucket: &str, visit: &mut dyn FnMut(&str) -> bool) -> Result<()> {
        let root = self.root.join(bucket);
        if !root.exists() {
            return Err(Error::not_found("bucket", bucket));
        }
        let mut names = Vec::new();
        collect_files(&root, &root, &mut names)?;
        names.sort();
        for name in names {
            if !visit(&name) {
                break;
            }
        }
        Ok(())
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if !path.to_string_lossy().ends_with(META_EXTENSION) {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    Ok(())
}

fn init_with_info(base_url: &str, obj: &mut Object, bucket: &str, name: &str, info: &fs::Metadata) {
    let size = if info.is_dir() { 0 } else { info.len() };
    meta::init_meta_with_urls(base_url, obj, bucket, name, size);
    if info.is_dir() {
        // Directory markers are never modified, only created or deleted, so
        // their generation derives from the stored creation time.
        obj.generation = nimbus_core::time::parse_rfc3339_nanos(&obj.time_created).unwrap_or(1);
        obj.size = Some(0);
    } else {
        obj.generation = mtime_nanos(info);
    }
    obj.updated = rfc3339_of(info.modified());
}

fn mtime_nanos(info: &fs::Metadata) -> i64 {
    info.modified().map(nimbus_core::time::nanos_of).unwrap_or(0)
}

fn rfc3339_of(modified: std::io::Result<SystemTime>) -> String {
    modified.map(rfc3339_nanos).unwrap_or_default()
}

fn meta_filename(path: &Path) -> PathBuf {
    let mut s = path.to_string_lossy().into_owned();
    // A directory marker's sidecar sits next to the directory, not in it.
    if s.ends_with('/') {
        s.pop();
    }
    s.push_str(META_EXTENSION);
    PathBuf::from(s)
}

fn to_pretty_json<T: serde::Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec_pretty(value).unwrap_or_else(|_| b"{}".to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> Vec<(&'static str, Box<dyn ObjectStore>, Option<tempfile::TempDir>)> {
        let dir = tempfile::tempdir().unwrap();
        vec![
            ("mem", Box::new(MemStore::new()) as Box<dyn ObjectStore>, None),
            ("file", Box::new(FileStore::new(dir.path())) as Box<dyn ObjectStore>, Some(dir)),
        ]
    }

    #[test]
    fn test_add_get_roundtrip() {
        for (kind, store, _guard) in stores() {
            store.create_bucket("bkt").unwrap();
            let mut meta = Object::default();
            store.add("bkt", "dir/data.txt", Bytes::from_static(b"hello"), &mut meta).unwrap();

            let (meta, content) = store.get("http://h/", "bkt", "dir/data.txt").unwrap().unwrap();
            assert_eq!(content, Bytes::from_static(b"hello"), "{kind}");
            assert_eq!(meta.name, "dir/data.txt", "{kind}");
            assert_eq!(meta.bucket, "bkt", "{kind}");
            assert_eq!(meta.content_type, "text/plain", "{kind}");
            assert_eq!(meta.size, Some(5), "{kind}");
            assert_eq!(meta.metageneration, 1, "{kind}");
            assert!(meta.generation > 0, "{kind}");
            assert!(meta.self_link.starts_with("http://h/storage/v1/b/bkt/o/"), "{kind}");
        }
    }

    #[test]
    fn test_get_absent_is_none() {
        for (kind, store, _guard) in stores() {
            store.create_bucket("bkt").unwrap();
            assert!(store.get("", "bkt", "nope").unwrap().is_none(), "{kind}");
            assert!(store.get_meta("", "bkt", "nope").unwrap().is_none(), "{kind}");
        }
    }

    #[test]
    fn test_bucket_meta() {
        for (kind, store, _guard) in stores() {
            assert!(store.get_bucket_meta("", "bkt").unwrap().is_none(), "{kind}");
            store.create_bucket("bkt").unwrap();
            let meta = store.get_bucket_meta("", "bkt").unwrap().unwrap();
            assert_eq!(meta.kind, "storage#bucket", "{kind}");
            assert_eq!(meta.name, "bkt", "{kind}");
            assert_eq!(meta.storage_class, "STANDARD", "{kind}");
            assert!(meta.metageneration > 0, "{kind}");
            // Idempotent re-create.
            store.create_bucket("bkt").unwrap();
        }
    }

    #[test]
    fn test_delete_object_and_bucket() {
        for (kind, store, _guard) in stores() {
            store.create_bucket("bkt").unwrap();
            let mut meta = Object::default();
            store.add("bkt", "f", Bytes::from_static(b"x"), &mut meta).unwrap();

            store.delete("bkt", "f").unwrap();
            assert!(store.get("", "bkt", "f").unwrap().is_none(), "{kind}");
            assert_eq!(store.delete("bkt", "f").unwrap_err().code(), "NOT_FOUND", "{kind}");

            store.delete("bkt", "").unwrap();
            assert!(store.get_bucket_meta("", "bkt").unwrap().is_none(), "{kind}");
        }
    }

    #[test]
    fn test_copy_resets_creation_time() {
        for (kind, store, _guard) in stores() {
            store.create_bucket("bkt").unwrap();
            let mut meta = Object { cache_control: "public".to_string(), ..Default::default() };
            store.add("bkt", "src.txt", Bytes::from_static(b"payload"), &mut meta).unwrap();

            assert!(store.copy("bkt", "src.txt", "bkt", "dst.txt").unwrap(), "{kind}");
            assert!(!store.copy("bkt", "missing", "bkt", "x").unwrap(), "{kind}");

            let (meta, content) = store.get("", "bkt", "dst.txt").unwrap().unwrap();
            assert_eq!(content, Bytes::from_static(b"payload"), "{kind}");
            assert_eq!(meta.cache_control, "public", "{kind}");
            assert!(!meta.time_created.is_empty(), "{kind}");
        }
    }

    #[test]
    fn test_walk_is_sorted() {
        for (kind, store, _guard) in stores() {
            store.create_bucket("bkt").unwrap();
            for name in ["b/2", "a", "b/1", "c"] {
                let mut meta = Object::default();
                store.add("bkt", name, Bytes::from_static(b"x"), &mut meta).unwrap();
            }
            let mut names = Vec::new();
            store
                .walk("bkt", &mut |name| {
                    names.push(name.to_string());
                    true
                })
                .unwrap();
            assert_eq!(names, vec!["a", "b/1", "b/2", "c"], "{kind}");
        }
    }

    #[test]
    fn test_walk_missing_bucket_is_not_found() {
        for (kind, store, _guard) in stores() {
            let err = store.walk("nope", &mut |_| true).unwrap_err();
            assert_eq!(err.code(), "NOT_FOUND", "{kind}");
        }
    }

    #[test]
    fn test_file_store_generation_matches_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.create_bucket("bkt").unwrap();
        let mut meta = Object::default();
        store.add("bkt", "f.bin", Bytes::from_static(b"data"), &mut meta).unwrap();

        let got = store.get_meta("", "bkt", "f.bin").unwrap().unwrap();
        let info = fs::metadata(dir.path().join("bkt/f.bin")).unwrap();
        assert_eq!(got.generation, mtime_nanos(&info));
    }

    #[test]
    fn test_file_store_legacy_payload_without_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.create_bucket("bkt").unwrap();
        fs::write(dir.path().join("bkt/legacy.txt"), b"old data").unwrap();

        let (meta, content) = store.get("", "bkt", "legacy.txt").unwrap().unwrap();
        assert_eq!(content, Bytes::from_static(b"old data"));
        assert_eq!(meta.content_type, "text/plain");
        assert!(meta.generation > 0);
    }

    #[test]
    fn test_file_store_sidecars_hidden_from_walk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.create_bucket("bkt").unwrap();
        let mut meta = Object::default();
        store.add("bkt", "f", Bytes::from_static(b"x"), &mut meta).unwrap();

        let mut names = Vec::new();
        store
            .walk("bkt", &mut |name| {
                names.push(name.to_string());
                true
            })
            .unwrap();
        assert_eq!(names, vec!["f"]);
    }

    #[test]
    fn test_file_store_directory_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.create_bucket("bkt").unwrap();
        let mut meta = Object::default();
        store.add("bkt", "folder/", Bytes::new(), &mut meta).unwrap();

        let got = store.get_meta("", "bkt", "folder/").unwrap().unwrap();
        assert_eq!(got.size, Some(0));
        assert!(got.generation > 0);

        // The bare directory name is not an object.
        assert!(store.get_meta("", "bkt", "folder").unwrap().is_none());

        let err = store.add("bkt", "folder2/", Bytes::from_static(b"data"), &mut meta).unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }
}
