//! # Object and Bucket Metadata
//!
//! The JSON-API view of buckets and objects. Int64 fields are string-encoded
//! on the wire, empty fields are omitted, and link fields are computed from
//! a configurable base URL.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The canonical API host, used when no base URL is configured.
pub const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/";

/// An object resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Object {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub bucket: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub self_link: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub media_link: String,
    #[serde(with = "int64_string", skip_serializing_if = "is_zero")]
    pub generation: i64,
    #[serde(with = "int64_string", skip_serializing_if = "is_zero")]
    pub metageneration: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub storage_class: String,
    /// Content length. Serialized even when zero, unlike the other numeric
    /// fields, so zero-length objects report their size.
    #[serde(with = "opt_uint64_string", skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub etag: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub time_created: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub updated: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cache_control: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_encoding: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_disposition: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_language: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub custom_time: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub component_count: i64,
    /// User-provided metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// A bucket resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Bucket {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub self_link: String,
    #[serde(with = "int64_string", skip_serializing_if = "is_zero")]
    pub metageneration: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub storage_class: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub time_created: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub updated: String,
}

/// A page of an object listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Objects {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Object>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prefixes: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub next_page_token: String,
}

/// A rewrite-call response. Progress counters serialize even when zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RewriteResponse {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub done: bool,
    #[serde(with = "int64_string")]
    pub object_size: i64,
    #[serde(with = "int64_string")]
    pub total_bytes_rewritten: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Object>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rewrite_token: String,
}

/// A compose-call request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComposeRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<Object>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub source_objects: Vec<ComposeSourceObject>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComposeSourceObject {
    pub name: String,
    #[serde(with = "opt_int64_string", skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_preconditions: Option<ObjectPreconditions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectPreconditions {
    #[serde(with = "opt_int64_string", skip_serializing_if = "Option::is_none")]
    pub if_generation_match: Option<i64>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Normalize a configured base URL: empty means the canonical host, and the
/// storage.googleapis.com alias hosts canonicalize to the corresponding
/// www.googleapis.com form.
pub fn normalize_base_url(base_url: &str) -> String {
    match base_url {
        "" => DEFAULT_BASE_URL.to_string(),
        "https://storage.googleapis.com/" => "https://www.googleapis.com/".to_string(),
        "http://storage.googleapis.com/" => "http://www.googleapis.com/".to_string(),
        other => {
            if other.ends_with('/') {
                other.to_string()
            } else {
                format!("{other}/")
            }
        }
    }
}

/// The URL for a bucket resource.
pub fn bucket_url(base_url: &str, bucket: &str) -> String {
    format!("{}storage/v1/b/{}", normalize_base_url(base_url), bucket)
}

/// The URL for an object resource.
pub fn object_url(base_url: &str, bucket: &str, name: &str) -> String {
    format!("{}storage/v1/b/{}/o/{}", normalize_base_url(base_url), bucket, name)
}

/// Fresh bucket metadata with computed fields.
pub fn bucket_meta(base_url: &str, bucket: &str) -> Bucket {
    Bucket {
        kind: "storage#bucket".to_string(),
        name: bucket.to_string(),
        self_link: bucket_url(base_url, bucket),
        storage_class: "STANDARD".to_string(),
        ..Default::default()
    }
}

/// Guess a content type from the name's extension; empty when unknown.
pub fn content_type_of(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "txt" | "text" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "xml" => "text/xml",
        "js" => "text/javascript",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "wasm" => "application/wasm",
        _ => "",
    }
}

/// Bake intrinsic values into metadata headed for storage and remove the
/// computed fields.
pub fn init_scrubbed_meta(meta: &mut Object, filename: &str) {
    if meta.content_type.is_empty() {
        meta.content_type = content_type_of(filename).to_string();
    }
    meta.name = filename.to_string();
    scrub_meta(meta);
}

/// Bake intrinsic values into metadata headed for a response, including the
/// computed links.
pub fn init_meta_with_urls(
    base_url: &str,
    meta: &mut Object,
    bucket: &str,
    filename: &str,
    size: u64,
) {
    meta.bucket = bucket.to_string();
    if meta.content_type.is_empty() {
        meta.content_type = content_type_of(filename).to_string();
    }
    meta.kind = "storage#object".to_string();
    meta.media_link = format!("{}?alt=media", object_url(base_url, bucket, filename));
    meta.name = filename.to_string();
    meta.self_link = object_url(base_url, bucket, filename);
    meta.size = Some(size);
    meta.storage_class = "STANDARD".to_string();
}

/// Compute the id and etag once the generation is known.
pub fn finalize_meta(meta: &mut Object, bucket: &str, filename: &str) {
    meta.id = format!("{}/{}/{}", bucket, filename, meta.generation);
    meta.etag = format!("{}/{}", meta.generation, meta.metageneration);
}

/// Remove computed fields for minimal storage.
pub fn scrub_meta(meta: &mut Object) {
    meta.bucket = String::new();
    meta.kind = String::new();
    meta.id = String::new();
    meta.etag = String::new();
    meta.media_link = String::new();
    meta.self_link = String::new();
    meta.size = None;
    meta.storage_class = String::new();
}

/// Int64 fields are string-encoded on the wire but tolerated as numbers on
/// the way in.
mod int64_string {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(v: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = i64;
            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an int64 as a string or number")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<i64, E> {
                v.parse().map_err(de::Error::custom)
            }
            fn visit_i64<E: de::Error>(self, v: i64) -> Result<i64, E> {
                Ok(v)
            }
            fn visit_u64<E: de::Error>(self, v: u64) -> Result<i64, E> {
                Ok(v as i64)
            }
        }
        deserializer.deserialize_any(V)
    }
}

mod opt_int64_string {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(v: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => serializer.serialize_str(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<i64>, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = Option<i64>;
            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an optional int64 as a string or number")
            }
            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }
            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }
            fn visit_some<D2: Deserializer<'de>>(self, d: D2) -> Result<Self::Value, D2::Error> {
                super::int64_string::deserialize(d).map(Some)
            }
        }
        deserializer.deserialize_option(V)
    }
}

mod opt_uint64_string {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(v: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => serializer.serialize_str(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = Option<u64>;
            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an optional uint64 as a string or number")
            }
            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }
            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }
            fn visit_some<D2: Deserializer<'de>>(self, d: D2) -> Result<Self::Value, D2::Error> {
                struct Inner;
                impl<'de> Visitor<'de> for Inner {
                    type Value = u64;
                    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("a uint64 as a string or number")
                    }
                    fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
                        v.parse().map_err(de::Error::custom)
                    }
                    fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
                        Ok(v)
                    }
                    fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
                        Ok(v as u64)
                    }
                }
                d.deserialize_any(Inner).map(Some)
            }
        }
        deserializer.deserialize_option(V)
    }
}
