//! # Request Dispatcher
//!
//! Maps URL paths and methods to bucket/object operations: listing with
//! prefixes and pagination, precondition-checked writes, multipart uploads,
//! server-driven copy/rewrite, composition, prefix drops, and batch
//! assembly. The HTTP adapter stays thin; everything observable lives here.

use crate::meta::{
    self, ComposeRequest, Object, Objects, RewriteResponse,
};
use crate::multipart::{self, read_multipart_insert};
use crate::store::ObjectStore;
use crate::token::{decode_page_token, encode_page_token};
use bytes::Bytes;
use nimbus_core::{Error, Result};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Default page size for listings.
const DEFAULT_MAX_RESULTS: usize = 1000;

/// Bytes copied per rewrite call.
const DEFAULT_REWRITE_CHUNK: usize = 16 * 1024 * 1024;

/// Emulator tuning knobs.
#[derive(Debug, Clone)]
pub struct GcsOptions {
    /// Base URL baked into self/media links; empty selects the canonical
    /// API host.
    pub base_url: String,
    /// Bytes copied per rewrite call before a continuation token is issued.
    pub rewrite_chunk: usize,
}

impl Default for GcsOptions {
    fn default() -> Self {
        Self { base_url: String::new(), rewrite_chunk: DEFAULT_REWRITE_CHUNK }
    }
}

/// A transport-independent request: the adapter fills this from the wire.
#[derive(Debug, Clone, Default)]
pub struct GcsRequest {
    pub method: String,
    /// Decoded-per-segment URL path.
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub content_type: String,
    pub range: Option<String>,
    pub body: Bytes,
}

impl GcsRequest {
    /// Build a request from a method and a `path?query` target.
    pub fn from_target(method: &str, target: &str, body: Bytes) -> Self {
        let target = strip_origin(target);
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), parse_query(q)),
            None => (target.to_string(), BTreeMap::new()),
        };
        Self { method: method.to_string(), path, query, ..Default::default() }
        .with_body(body)
    }

    fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }
}

/// A transport-independent response.
#[derive(Debug, Clone)]
pub struct GcsResponse {
    pub status: u16,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl GcsResponse {
    fn json<T: Serialize>(value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| Error::internal(format!("could not encode response: {e}")))?;
        Ok(Self {
            status: 200,
            content_type: "application/json; charset=utf-8".to_string(),
            headers: Vec::new(),
            body: Bytes::from(body),
        })
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: String::new(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// The error rendering every failure takes on the wire.
    pub fn from_error(err: &Error) -> Self {
        #[derive(Serialize)]
        struct ErrorBody<'a> {
            error: ErrorDetail<'a>,
        }
        #[derive(Serialize)]
        struct ErrorDetail<'a> {
            code: u16,
            message: &'a str,
        }
        let status = err.http_status();
        let message = err.to_string();
        let body = serde_json::to_vec(&ErrorBody {
            error: ErrorDetail { code: status, message: &message },
        })
        .unwrap_or_else(|_| b"{}".to_vec());
        Self {
            status,
            content_type: "application/json; charset=utf-8".to_string(),
            headers: Vec::new(),
            body: Bytes::from(body),
        }
    }
}

struct RewriteState {
    src_bucket: String,
    src_name: String,
    dst_bucket: String,
    dst_name: String,
    offset: usize,
}

/// The Cloud Storage emulator core.
pub struct GcsEmulator {
    store: Arc<dyn ObjectStore>,
    base_url: String,
    rewrite_chunk: usize,
    rewrites: Mutex<HashMap<String, RewriteState>>,
    /// Serializes check-then-write sequences so preconditions are atomic.
    write_lock: Mutex<()>,
}

impl GcsEmulator {
    pub fn new(store: Arc<dyn ObjectStore>, options: GcsOptions) -> Self {
        Self {
            store,
            base_url: meta::normalize_base_url(&options.base_url),
            rewrite_chunk: options.rewrite_chunk.max(1),
            rewrites: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Route a request; failures become the standard error rendering.
    pub fn handle(&self, req: &GcsRequest) -> GcsResponse {
        match self.dispatch(req) {
            Ok(resp) => resp,
            Err(err) => {
                if err.http_status() != 404 {
                    debug!("{} {} failed: {}", req.method, req.path, err);
                }
                GcsResponse::from_error(&err)
            }
        }
    }

    fn dispatch(&self, req: &GcsRequest) -> Result<GcsResponse> {
        let segments: Vec<String> = req
            .path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(percent_decode)
            .collect();
        let segs: Vec<&str> = segments.iter().map(String::as_str).collect();

        match (req.method.as_str(), &segs[..]) {
            ("POST", ["batch", "storage", "v1"]) => self.batch(req),

            ("POST", ["storage", "v1", "b"]) => self.create_bucket(req),
            ("GET", ["storage", "v1", "b", bucket]) => self.get_bucket(bucket),
            ("DELETE", ["storage", "v1", "b", bucket]) => self.delete_bucket(bucket, &req.query),

            ("GET", ["storage", "v1", "b", bucket, "o"]) => self.list_objects(bucket, &req.query),
            (_, ["storage", "v1", "b", bucket, "o", rest @ ..]) if !rest.is_empty() => {
                self.object_op(req, bucket, rest)
            }

            ("POST", ["upload", "storage", "v1", "b", bucket, "o"]) => self.insert(req, bucket),

            // Host-style access, e.g. PUT /bucket/path/to/object.
            ("PUT", [bucket, rest @ ..]) if !rest.is_empty() && is_plain_bucket(bucket) => self
                .insert_simple(
                    bucket,
                    &rest.join("/"),
                    &req.query,
                    &req.content_type,
                    req.body.clone(),
                ),
            ("GET", [bucket, rest @ ..]) if !rest.is_empty() && is_plain_bucket(bucket) => {
                self.get_media(bucket, &rest.join("/"), req.range.as_deref())
            }

            _ => Err(Error::not_found("resource", req.path.clone())),
        }
    }

    // ========== Buckets ==========

    fn create_bucket(&self, req: &GcsRequest) -> Result<GcsResponse> {
        #[derive(serde::Deserialize)]
        struct CreateBucket {
            name: String,
        }
        let body: CreateBucket = serde_json::from_slice(&req.body)
            .map_err(|e| Error::invalid(format!("could not parse bucket body: {e}")))?;
        if body.name.is_empty() {
            return Err(Error::invalid("bucket name is required"));
        }
        self.store.create_bucket(&body.name)?;
        let bucket = self
            .store
            .get_bucket_meta(&self.base_url, &body.name)?
            .ok_or_else(|| Error::internal("bucket vanished after create"))?;
        GcsResponse::json(&bucket)
    }

    fn get_bucket(&self, bucket: &str) -> Result<GcsResponse> {
        let meta = self
            .store
            .get_bucket_meta(&self.base_url, bucket)?
            .ok_or_else(|| Error::not_found("bucket", bucket))?;
        GcsResponse::json(&meta)
    }

    /// Delete every object sharing the given prefix, or the bucket wholesale
    /// when no prefix is supplied.
    fn delete_bucket(&self, bucket: &str, query: &BTreeMap<String, String>) -> Result<GcsResponse> {
        let _guard = self.write_lock.lock();
        match query.get("prefix") {
            Some(prefix) => {
                let mut doomed = Vec::new();
                self.store.walk(bucket, &mut |name| {
                    if name.starts_with(prefix.as_str()) {
                        doomed.push(name.to_string());
                    }
                    true
                })?;
                for name in doomed {
                    self.store.delete(bucket, &name)?;
                }
            }
            None => self.store.delete(bucket, "")?,
        }
        Ok(GcsResponse::empty(204))
    }

    // ========== Listing ==========

    fn list_objects(&self, bucket: &str, query: &BTreeMap<String, String>) -> Result<GcsResponse> {
        if self.store.get_bucket_meta(&self.base_url, bucket)?.is_none() {
            return Err(Error::not_found("bucket", bucket));
        }

        let prefix = query.get("prefix").map(String::as_str).unwrap_or("");
        let delimiter = query.get("delimiter").map(String::as_str).unwrap_or("");
        let max_results = match query.get("maxResults") {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| Error::invalid(format!("invalid maxResults {raw:?}")))?,
            None => DEFAULT_MAX_RESULTS,
        };
        let greater_than = match query.get("pageToken") {
            Some(token) if !token.is_empty() => decode_page_token(token)?,
            _ => String::new(),
        };

        let mut items: Vec<Object> = Vec::new();
        let mut prefixes: BTreeSet<String> = BTreeSet::new();
        let mut next_page_token = String::new();
        let mut walk_err: Option<Error> = None;
        self.store.walk(bucket, &mut |name| {
            if !name.starts_with(prefix) {
                return true;
            }
            // The cursor means strictly greater than the last emitted name.
            if !greater_than.is_empty() && name <= greater_than.as_str() {
                return true;
            }
            if !delimiter.is_empty() {
                if let Some(idx) = name[prefix.len()..].find(delimiter) {
                    let collapsed = &name[..prefix.len() + idx + delimiter.len()];
                    prefixes.insert(collapsed.to_string());
                    return true;
                }
            }
            if items.len() >= max_results {
                if let Some(last) = items.last() {
                    next_page_token = encode_page_token(&last.name);
                }
                return false;
            }
            match self.store.get_meta(&self.base_url, bucket, name) {
                Ok(Some(obj)) => items.push(obj),
                Ok(None) => {} // not an object (e.g. a bare directory)
                Err(e) => {
                    walk_err = Some(e);
                    return false;
                }
            }
            true
        })?;
        if let Some(e) = walk_err {
            return Err(e);
        }

        GcsResponse::json(&Objects {
            kind: "storage#objects".to_string(),
            items,
            prefixes: prefixes.into_iter().collect(),
            next_page_token,
        })
    }

    // ========== Objects ==========

    fn object_op(&self, req: &GcsRequest, bucket: &str, rest: &[&str]) -> Result<GcsResponse> {
        if let Some(idx) = rest.iter().position(|s| *s == "copyTo" || *s == "rewriteTo") {
            if req.method != "POST" {
                return Err(Error::invalid(format!("{} not supported on copy paths", req.method)));
            }
            let src = rest[..idx].join("/");
            let (dst_bucket, dst) = parse_copy_target(&rest[idx + 1..])?;
            return if rest[idx] == "copyTo" {
                self.copy(bucket, &src, &dst_bucket, &dst)
            } else {
                self.rewrite(bucket, &src, &dst_bucket, &dst, &req.query)
            };
        }

        if req.method == "POST" && rest.last() == Some(&"compose") {
            let dst = rest[..rest.len() - 1].join("/");
            return self.compose(bucket, &dst, &req.body);
        }

        let name = rest.join("/");
        match req.method.as_str() {
            "GET" if req.query.get("alt").map(String::as_str) == Some("media") => {
                self.get_media(bucket, &name, req.range.as_deref())
            }
            "GET" => self.get_object_meta(bucket, &name),
            "DELETE" => self.delete_object(bucket, &name, &req.query),
            "PATCH" | "PUT" => self.patch_object(bucket, &name, &req.query, &req.body),
            other => Err(Error::invalid(format!("method {other} not supported on objects"))),
        }
    }

    fn insert(&self, req: &GcsRequest, bucket: &str) -> Result<GcsResponse> {
        match req.query.get("uploadType").map(String::as_str) {
            Some("multipart") => {
                let (mut obj, content) = read_multipart_insert(&req.content_type, &req.body)?;
                let name = match req.query.get("name") {
                    Some(name) if !name.is_empty() => name.clone(),
                    _ => obj.name.clone(),
                };
                if name.is_empty() {
                    return Err(Error::invalid("object name is required"));
                }
                self.store_object(bucket, &name, content, &mut obj, &req.query)
            }
            _ => {
                let name = req
                    .query
                    .get("name")
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| Error::invalid("object name is required"))?
                    .clone();
                self.insert_simple(bucket, &name, &req.query, &req.content_type, req.body.clone())
            }
        }
    }

    fn insert_simple(
        &self,
        bucket: &str,
        name: &str,
        query: &BTreeMap<String, String>,
        content_type: &str,
        body: Bytes,
    ) -> Result<GcsResponse> {
        let mut obj = Object { content_type: content_type.to_string(), ..Default::default() };
        self.store_object(bucket, name, body, &mut obj, query)
    }

    fn store_object(
        &self,
        bucket: &str,
        name: &str,
        content: Bytes,
        obj: &mut Object,
        query: &BTreeMap<String, String>,
    ) -> Result<GcsResponse> {
        if self.store.get_bucket_meta(&self.base_url, bucket)?.is_none() {
            return Err(Error::not_found("bucket", bucket));
        }

        let _guard = self.write_lock.lock();
        let existing = self.store.get_meta(&self.base_url, bucket, name)?;
        check_preconditions(existing.as_ref(), query)?;
        self.store.add(bucket, name, content, obj)?;

        let stored = self
            .store
            .get_meta(&self.base_url, bucket, name)?
            .ok_or_else(|| Error::internal("object vanished after insert"))?;
        GcsResponse::json(&stored)
    }

    fn get_object_meta(&self, bucket: &str, name: &str) -> Result<GcsResponse> {
        let meta = self
            .store
            .get_meta(&self.base_url, bucket, name)?
            .ok_or_else(|| Error::not_found("object", format!("{bucket}/{name}")))?;
        GcsResponse::json(&meta)
    }

    fn get_media(&self, bucket: &str, name: &str, range: Option<&str>) -> Result<GcsResponse> {
        let (meta, content) = self
            .store
            .get(&self.base_url, bucket, name)?
            .ok_or_else(|| Error::not_found("object", format!("{bucket}/{name}")))?;

        let content_type = if meta.content_type.is_empty() {
            "application/octet-stream".to_string()
        } else {
            meta.content_type.clone()
        };

        if let Some(spec) = range {
            if let Some((start, end)) = parse_byte_range(spec, content.len()) {
                let total = content.len();
                return Ok(GcsResponse {
                    status: 206,
                    content_type,
                    headers: vec![(
                        "Content-Range".to_string(),
                        format!("bytes {start}-{end}/{total}"),
                    )],
                    body: content.slice(start..end + 1),
                });
            }
        }

        Ok(GcsResponse {
            status: 200,
            content_type,
            headers: Vec::new(),
            body: content,
        })
    }

    fn delete_object(
        &self,
        bucket: &str,
        name: &str,
        query: &BTreeMap<String, String>,
    ) -> Result<GcsResponse> {
        let _guard = self.write_lock.lock();
        let existing = self
            .store
            .get_meta(&self.base_url, bucket, name)?
            .ok_or_else(|| Error::not_found("object", format!("{bucket}/{name}")))?;
        check_preconditions(Some(&existing), query)?;
        self.store.delete(bucket, name)?;
        Ok(GcsResponse::empty(204))
    }

    fn patch_object(
        &self,
        bucket: &str,
        name: &str,
        query: &BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<GcsResponse> {
        let patch: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| Error::invalid(format!("could not parse metadata patch: {e}")))?;

        let _guard = self.write_lock.lock();
        let existing = self
            .store
            .get_meta(&self.base_url, bucket, name)?
            .ok_or_else(|| Error::not_found("object", format!("{bucket}/{name}")))?;
        check_preconditions(Some(&existing), query)?;

        let metageneration = existing.metageneration + 1;
        let mut merged = existing;
        apply_metadata_patch(&mut merged, &patch)?;
        self.store.update_meta(bucket, name, &mut merged, metageneration)?;

        let stored = self
            .store
            .get_meta(&self.base_url, bucket, name)?
            .ok_or_else(|| Error::internal("object vanished after patch"))?;
        GcsResponse::json(&stored)
    }

    fn copy(&self, src_bucket: &str, src: &str, dst_bucket: &str, dst: &str) -> Result<GcsResponse> {
        let _guard = self.write_lock.lock();
        if !self.store.copy(src_bucket, src, dst_bucket, dst)? {
            return Err(Error::not_found("object", format!("{src_bucket}/{src}")));
        }
        let stored = self
            .store
            .get_meta(&self.base_url, dst_bucket, dst)?
            .ok_or_else(|| Error::internal("object vanished after copy"))?;
        GcsResponse::json(&stored)
    }

    /// Chunked server-side copy. Progress is held in memory keyed by the
    /// continuation token; the destination appears only when the copy
    /// completes.
    fn rewrite(
        &self,
        src_bucket: &str,
        src: &str,
        dst_bucket: &str,
        dst: &str,
        query: &BTreeMap<String, String>,
    ) -> Result<GcsResponse> {
        let _guard = self.write_lock.lock();
        let src_meta = self
            .store
            .get_meta(&self.base_url, src_bucket, src)?
            .ok_or_else(|| Error::not_found("object", format!("{src_bucket}/{src}")))?;
        let total = src_meta.size.unwrap_or(0) as usize;

        let mut offset = 0usize;
        if let Some(token) = query.get("rewriteToken").filter(|t| !t.is_empty()) {
            let state = self
                .rewrites
                .lock()
                .remove(token.as_str())
                .ok_or_else(|| Error::invalid(format!("unknown rewrite token {token:?}")))?;
            if state.src_bucket != src_bucket
                || state.src_name != src
                || state.dst_bucket != dst_bucket
                || state.dst_name != dst
            {
                return Err(Error::invalid("rewrite token does not match this copy"));
            }
            offset = state.offset;
        }

        let remaining = total.saturating_sub(offset);
        if remaining <= self.rewrite_chunk {
            if !self.store.copy(src_bucket, src, dst_bucket, dst)? {
                return Err(Error::not_found("object", format!("{src_bucket}/{src}")));
            }
            let resource = self
                .store
                .get_meta(&self.base_url, dst_bucket, dst)?
                .ok_or_else(|| Error::internal("object vanished after rewrite"))?;
            return GcsResponse::json(&RewriteResponse {
                kind: "storage#rewriteResponse".to_string(),
                done: true,
                object_size: total as i64,
                total_bytes_rewritten: total as i64,
                resource: Some(resource),
                rewrite_token: String::new(),
            });
        }

        let offset = offset + self.rewrite_chunk;
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        self.rewrites.lock().insert(
            token.clone(),
            RewriteState {
                src_bucket: src_bucket.to_string(),
                src_name: src.to_string(),
                dst_bucket: dst_bucket.to_string(),
                dst_name: dst.to_string(),
                offset,
            },
        );
        GcsResponse::json(&RewriteResponse {
            kind: "storage#rewriteResponse".to_string(),
            done: false,
            object_size: total as i64,
            total_bytes_rewritten: offset as i64,
            resource: None,
            rewrite_token: token,
        })
    }

    /// Concatenate the sources, in order, into the destination.
    fn compose(&self, bucket: &str, dst: &str, body: &[u8]) -> Result<GcsResponse> {
        let req: ComposeRequest = serde_json::from_slice(body)
            .map_err(|e| Error::invalid(format!("could not parse compose body: {e}")))?;
        if req.source_objects.is_empty() {
            return Err(Error::invalid("compose requires at least one source object"));
        }

        let _guard = self.write_lock.lock();
        let mut combined = Vec::new();
        for source in &req.source_objects {
            let (src_meta, content) = self
                .store
                .get(&self.base_url, bucket, &source.name)?
                .ok_or_else(|| Error::not_found("object", format!("{bucket}/{}", source.name)))?;

            let want = source
                .object_preconditions
                .as_ref()
                .and_then(|p| p.if_generation_match)
                .or(source.generation);
            if let Some(want) = want {
                if src_meta.generation != want {
                    return Err(Error::precondition(format!(
                        "source {:?} generation {} does not match {}",
                        source.name, src_meta.generation, want
                    )));
                }
            }
            combined.extend_from_slice(&content);
        }

        let mut obj = req.destination.unwrap_or_default();
        obj.component_count = req.source_objects.len() as i64;
        self.store.add(bucket, dst, Bytes::from(combined), &mut obj)?;

        let stored = self
            .store
            .get_meta(&self.base_url, bucket, dst)?
            .ok_or_else(|| Error::internal("object vanished after compose"))?;
        GcsResponse::json(&stored)
    }

    // ========== Batch ==========

    /// Dispatch each sub-request of a multipart/mixed batch and wrap the
    /// responses in a multipart/mixed reply.
    fn batch(&self, req: &GcsRequest) -> Result<GcsResponse> {
        let boundary = multipart::boundary_of(&req.content_type)?;
        let parts = multipart::parse_parts(&req.body, &boundary)?;

        let reply_boundary: String = {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(16)
                .map(char::from)
                .collect();
            format!("batch_{suffix}")
        };

        let mut out = Vec::new();
        for (idx, part) in parts.iter().enumerate() {
            let sub = parse_http_request(&part.body)?;
            let resp = self.handle(&sub);

            out.extend_from_slice(format!("--{reply_boundary}\r\n").as_bytes());
            out.extend_from_slice(b"Content-Type: application/http\r\n");
            let content_id = part
                .header("Content-ID")
                .map(|id| id.trim_matches(|c| c == '<' || c == '>').to_string())
                .unwrap_or_else(|| format!("{}", idx + 1));
            out.extend_from_slice(format!("Content-ID: <response-{content_id}>\r\n\r\n").as_bytes());

            out.extend_from_slice(
                format!("HTTP/1.1 {} {}\r\n", resp.status, reason_phrase(resp.status)).as_bytes(),
            );
            if !resp.content_type.is_empty() {
                out.extend_from_slice(
                    format!("Content-Type: {}\r\n", resp.content_type).as_bytes(),
                );
            }
            out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", resp.body.len()).as_bytes());
            out.extend_from_slice(&resp.body);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{reply_boundary}--\r\n").as_bytes());

        Ok(GcsResponse {
            status: 200,
            content_type: format!("multipart/mixed; boundary={reply_boundary}"),
            headers: Vec::new(),
            body: Bytes::from(out),
        })
    }
}

/// Parse `["b", dst_bucket, "o", dst...]` from a copy/rewrite path tail.
fn parse_copy_target(rest: &[&str]) -> Result<(String, String)> {
    match rest {
        ["b", dst_bucket, "o", dst @ ..] if !dst.is_empty() => {
            Ok((dst_bucket.to_string(), dst.join("/")))
        }
        _ => Err(Error::invalid("malformed copy destination path")),
    }
}

/// Evaluate the standard write preconditions against the current object
/// state. An absent object has generation and metageneration zero, so
/// `ifGenerationMatch=0` means "must not exist".
fn check_preconditions(existing: Option<&Object>, query: &BTreeMap<String, String>) -> Result<()> {
    let generation = existing.map_or(0, |o| o.generation);
    let metageneration = existing.map_or(0, |o| o.metageneration);

    if let Some(want) = query_i64(query, "ifGenerationMatch")? {
        if generation != want {
            return Err(Error::precondition(format!(
                "generation {generation} does not match {want}"
            )));
        }
    }
    if let Some(want) = query_i64(query, "ifGenerationNotMatch")? {
        if generation == want {
            return Err(Error::precondition(format!("generation matches {want}")));
        }
    }
    if let Some(want) = query_i64(query, "ifMetagenerationMatch")? {
        if metageneration != want {
            return Err(Error::precondition(format!(
                "metageneration {metageneration} does not match {want}"
            )));
        }
    }
    if let Some(want) = query_i64(query, "ifMetagenerationNotMatch")? {
        if metageneration == want {
            return Err(Error::precondition(format!("metageneration matches {want}")));
        }
    }
    Ok(())
}

fn query_i64(query: &BTreeMap<String, String>, key: &str) -> Result<Option<i64>> {
    match query.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|_| Error::invalid(format!("invalid {key} value {raw:?}"))),
    }
}

/// Merge a partial metadata document into an object. String fields replace;
/// a JSON null clears. The custom metadata map merges key-wise, with null
/// removing a key.
fn apply_metadata_patch(obj: &mut Object, patch: &serde_json::Value) -> Result<()> {
    let map = patch
        .as_object()
        .ok_or_else(|| Error::invalid("metadata patch must be a JSON object"))?;

    for (key, value) in map {
        match key.as_str() {
            "contentType" => patch_string(&mut obj.content_type, value)?,
            "cacheControl" => patch_string(&mut obj.cache_control, value)?,
            "contentEncoding" => patch_string(&mut obj.content_encoding, value)?,
            "contentDisposition" => patch_string(&mut obj.content_disposition, value)?,
            "contentLanguage" => patch_string(&mut obj.content_language, value)?,
            "customTime" => patch_string(&mut obj.custom_time, value)?,
            "metadata" => match value {
                serde_json::Value::Null => obj.metadata = None,
                serde_json::Value::Object(entries) => {
                    let merged = obj.metadata.get_or_insert_with(BTreeMap::new);
                    for (k, v) in entries {
                        match v {
                            serde_json::Value::Null => {
                                merged.remove(k);
                            }
                            serde_json::Value::String(s) => {
                                merged.insert(k.clone(), s.clone());
                            }
                            other => {
                                return Err(Error::invalid(format!(
                                    "metadata value for {k:?} must be a string, got {other}"
                                )));
                            }
                        }
                    }
                    if merged.is_empty() {
                        obj.metadata = None;
                    }
                }
                other => {
                    return Err(Error::invalid(format!("metadata must be an object, got {other}")));
                }
            },
            // Intrinsic and unknown fields are ignored, as the service does.
            _ => {}
        }
    }
    Ok(())
}

fn patch_string(slot: &mut String, value: &serde_json::Value) -> Result<()> {
    match value {
        serde_json::Value::Null => {
            *slot = String::new();
            Ok(())
        }
        serde_json::Value::String(s) => {
            *slot = s.clone();
            Ok(())
        }
        other => Err(Error::invalid(format!("expected a string, got {other}"))),
    }
}

/// Parse a `Range: bytes=` header into an inclusive `[start, end]` pair.
fn parse_byte_range(spec: &str, len: usize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let spec = spec.trim().strip_prefix("bytes=")?;
    let (start_raw, end_raw) = spec.split_once('-')?;
    match (start_raw.is_empty(), end_raw.is_empty()) {
        // "-n": the final n bytes.
        (true, false) => {
            let n: usize = end_raw.parse().ok()?;
            if n == 0 {
                return None;
            }
            Some((len.saturating_sub(n), len - 1))
        }
        // "a-": from a to the end.
        (false, true) => {
            let start: usize = start_raw.parse().ok()?;
            (start < len).then_some((start, len - 1))
        }
        (false, false) => {
            let start: usize = start_raw.parse().ok()?;
            let end: usize = end_raw.parse().ok()?;
            (start <= end && start < len).then_some((start, end.min(len - 1)))
        }
        (true, true) => None,
    }
}

/// Parse one embedded HTTP request from a batch part.
fn parse_http_request(raw: &[u8]) -> Result<GcsRequest> {
    let text_end = raw.len();
    let header_end = find_double_newline(raw).unwrap_or(text_end);
    let head = String::from_utf8_lossy(&raw[..header_end.min(text_end)]).into_owned();
    let mut lines = head.lines();

    let request_line = lines
        .next()
        .ok_or_else(|| Error::invalid("empty batch sub-request"))?;
    let mut pieces = request_line.split_whitespace();
    let method = pieces
        .next()
        .ok_or_else(|| Error::invalid("batch sub-request is missing a method"))?;
    let target = pieces
        .next()
        .ok_or_else(|| Error::invalid("batch sub-request is missing a target"))?;

    let mut content_type = String::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-type") {
                content_type = value.trim().to_string();
            }
        }
    }

    let body_start = find_double_newline(raw)
        .map(|idx| idx + double_newline_len(raw, idx))
        .unwrap_or(text_end);
    let body = Bytes::copy_from_slice(&raw[body_start.min(text_end)..]);

    let mut sub = GcsRequest::from_target(method, target, body);
    sub.content_type = content_type;
    Ok(sub)
}

fn find_double_newline(raw: &[u8]) -> Option<usize> {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n"))
}

fn double_newline_len(raw: &[u8], idx: usize) -> usize {
    if raw[idx..].starts_with(b"\r\n\r\n") {
        4
    } else {
        2
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        206 => "Partial Content",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        412 => "Precondition Failed",
        499 => "Client Closed Request",
        _ => "Internal Server Error",
    }
}

/// Host-style paths must not shadow the API prefixes.
fn is_plain_bucket(bucket: &str) -> bool {
    !matches!(bucket, "storage" | "upload" | "batch")
}

/// Strip an absolute-URL origin, leaving the path and query.
fn strip_origin(target: &str) -> &str {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = target.strip_prefix(scheme) {
            return match rest.find('/') {
                Some(idx) => &rest[idx..],
                None => "/",
            };
        }
    }
    target
}

/// Percent-decode a path segment.
pub(crate) fn percent_decode(segment: &str) -> String {
    decode_impl(segment, false)
}

/// Parse an `application/x-www-form-urlencoded` query string.
pub(crate) fn parse_query(query: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        out.insert(decode_impl(key, true), decode_impl(value, true));
    }
    out
}

fn decode_impl(s: &str, plus_as_space: bool) -> String {
    fn hex(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
