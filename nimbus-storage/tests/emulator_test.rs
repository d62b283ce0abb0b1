//! End-to-end dispatcher scenarios against both backends: upload/download
//! round-trips, listing with prefixes and pagination, preconditions,
//! chunked rewrites, composition, prefix drops, and batching.

use bytes::Bytes;
use nimbus_storage::dispatch::{GcsEmulator, GcsOptions, GcsRequest, GcsResponse};
use nimbus_storage::{FileStore, MemStore, Object, Objects, ObjectStore};
use std::sync::Arc;

fn mem_emulator() -> GcsEmulator {
    GcsEmulator::new(Arc::new(MemStore::new()), GcsOptions::default())
}

fn do_request(emu: &GcsEmulator, method: &str, target: &str, body: &[u8]) -> GcsResponse {
    emu.handle(&GcsRequest::from_target(method, target, Bytes::copy_from_slice(body)))
}

fn json_of<T: serde::de::DeserializeOwned>(resp: &GcsResponse) -> T {
    assert_eq!(resp.status, 200, "body: {}", String::from_utf8_lossy(&resp.body));
    serde_json::from_slice(&resp.body).unwrap()
}

fn create_bucket(emu: &GcsEmulator, name: &str) {
    let resp = do_request(emu, "POST", "/storage/v1/b", format!(r#"{{"name":"{name}"}}"#).as_bytes());
    assert_eq!(resp.status, 200);
}

fn put_object(emu: &GcsEmulator, bucket: &str, name: &str, content: &[u8]) -> Object {
    let resp = do_request(
        emu,
        "POST",
        &format!("/upload/storage/v1/b/{bucket}/o?uploadType=media&name={name}"),
        content,
    );
    json_of(&resp)
}

#[test]
fn test_insert_read_roundtrip() {
    let emu = mem_emulator();
    create_bucket(&emu, "test");

    let payload = b"FullStory\nCloud Storage Emulator\nGophers!\n";
    let resp = do_request(&emu, "PUT", "/test/data/test.txt", payload);
    let meta: Object = json_of(&resp);
    assert_eq!(meta.name, "data/test.txt");
    assert_eq!(meta.content_type, "text/plain");
    assert_eq!(meta.size, Some(payload.len() as u64));
    assert_eq!(meta.metageneration, 1);
    assert!(meta.generation > 0);

    let resp = do_request(&emu, "GET", "/test/data/test.txt", b"");
    assert_eq!(resp.status, 200);
    assert_eq!(&resp.body[..], payload);
    assert_eq!(resp.content_type, "text/plain");

    // Same bytes through the API path.
    let resp = do_request(&emu, "GET", "/storage/v1/b/test/o/data%2Ftest.txt?alt=media", b"");
    assert_eq!(resp.status, 200);
    assert_eq!(&resp.body[..], payload);
}

#[test]
fn test_object_metadata_and_links() {
    let emu = GcsEmulator::new(
        Arc::new(MemStore::new()),
        GcsOptions { base_url: "http://localhost:9000/".to_string(), ..Default::default() },
    );
    create_bucket(&emu, "bkt");
    let meta = put_object(&emu, "bkt", "f.json", b"{}");

    assert_eq!(meta.kind, "storage#object");
    assert_eq!(meta.bucket, "bkt");
    assert_eq!(meta.self_link, "http://localhost:9000/storage/v1/b/bkt/o/f.json");
    assert_eq!(meta.media_link, "http://localhost:9000/storage/v1/b/bkt/o/f.json?alt=media");
    assert_eq!(meta.content_type, "application/json");
    assert!(!meta.id.is_empty());

    let resp = do_request(&emu, "GET", "/storage/v1/b/bkt/o/f.json", b"");
    let again: Object = json_of(&resp);
    assert_eq!(again.generation, meta.generation);
}

#[test]
fn test_multipart_insert() {
    let emu = mem_emulator();
    create_bucket(&emu, "bkt");

    let body = b"--sep\r\nContent-Type: application/json\r\n\r\n{\"name\":\"up.bin\",\"contentType\":\"application/octet-stream\",\"metadata\":{\"k\":\"v\"}}\r\n--sep\r\nContent-Type: application/octet-stream\r\n\r\npayload-bytes\r\n--sep--\r\n";
    let mut req = GcsRequest::from_target(
        "POST",
        "/upload/storage/v1/b/bkt/o?uploadType=multipart",
        Bytes::from_static(body),
    );
    req.content_type = "multipart/related; boundary=sep".to_string();
    let resp = emu.handle(&req);
    let meta: Object = json_of(&resp);
    assert_eq!(meta.name, "up.bin");
    assert_eq!(meta.metadata.unwrap().get("k").unwrap(), "v");

    let resp = do_request(&emu, "GET", "/storage/v1/b/bkt/o/up.bin?alt=media", b"");
    assert_eq!(&resp.body[..], b"payload-bytes");
}

#[test]
fn test_malformed_multipart_is_rejected() {
    let emu = mem_emulator();
    create_bucket(&emu, "bkt");
    let mut req = GcsRequest::from_target(
        "POST",
        "/upload/storage/v1/b/bkt/o?uploadType=multipart",
        Bytes::from_static(b"no boundaries here"),
    );
    req.content_type = "multipart/related; boundary=sep".to_string();
    assert_eq!(emu.handle(&req).status, 400);
}

#[test]
fn test_listing_with_prefix_delimiter_and_pagination() {
    let emu = mem_emulator();
    create_bucket(&emu, "bkt");
    for name in ["a.txt", "dir/one.txt", "dir/two.txt", "dir/sub/deep.txt", "z.txt"] {
        put_object(&emu, "bkt", name, b"x");
    }

    // Delimiter collapses shared prefixes.
    let resp = do_request(&emu, "GET", "/storage/v1/b/bkt/o?delimiter=%2F", b"");
    let page: Objects = json_of(&resp);
    let names: Vec<&str> = page.items.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "z.txt"]);
    assert_eq!(page.prefixes, vec!["dir/"]);

    // Prefix + delimiter descends one level.
    let resp = do_request(&emu, "GET", "/storage/v1/b/bkt/o?prefix=dir%2F&delimiter=%2F", b"");
    let page: Objects = json_of(&resp);
    let names: Vec<&str> = page.items.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["dir/one.txt", "dir/two.txt"]);
    assert_eq!(page.prefixes, vec!["dir/sub/"]);

    // Pagination in pages of two, strictly ordered, no repeats.
    let mut collected = Vec::new();
    let mut token = String::new();
    loop {
        let target = if token.is_empty() {
            "/storage/v1/b/bkt/o?maxResults=2".to_string()
        } else {
            format!("/storage/v1/b/bkt/o?maxResults=2&pageToken={token}")
        };
        let page: Objects = json_of(&do_request(&emu, "GET", &target, b""));
        assert!(page.items.len() <= 2);
        collected.extend(page.items.iter().map(|o| o.name.clone()));
        if page.next_page_token.is_empty() {
            break;
        }
        token = page.next_page_token;
    }
    assert_eq!(
        collected,
        vec!["a.txt", "dir/one.txt", "dir/sub/deep.txt", "dir/two.txt", "z.txt"]
    );
}

#[test]
fn test_listing_missing_bucket_is_404() {
    let emu = mem_emulator();
    assert_eq!(do_request(&emu, "GET", "/storage/v1/b/nope/o", b"").status, 404);
}

#[test]
fn test_bad_page_token_is_400() {
    let emu = mem_emulator();
    create_bucket(&emu, "bkt");
    let resp = do_request(&emu, "GET", "/storage/v1/b/bkt/o?pageToken=%25%25bogus", b"");
    assert_eq!(resp.status, 400);
}

#[test]
fn test_preconditions() {
    let emu = mem_emulator();
    create_bucket(&emu, "bkt");
    let meta = put_object(&emu, "bkt", "f", b"v1");

    // Must-not-exist fails once the object exists.
    let resp = do_request(
        &emu,
        "POST",
        "/upload/storage/v1/b/bkt/o?uploadType=media&name=f&ifGenerationMatch=0",
        b"v2",
    );
    assert_eq!(resp.status, 412);

    // Matching generation succeeds.
    let resp = do_request(
        &emu,
        "POST",
        &format!(
            "/upload/storage/v1/b/bkt/o?uploadType=media&name=f&ifGenerationMatch={}",
            meta.generation
        ),
        b"v2",
    );
    assert_eq!(resp.status, 200);

    // Delete with a stale generation fails; without preconditions it works.
    let resp = do_request(&emu, "DELETE", "/storage/v1/b/bkt/o/f?ifGenerationMatch=1", b"");
    assert_eq!(resp.status, 412);
    let resp = do_request(&emu, "DELETE", "/storage/v1/b/bkt/o/f", b"");
    assert_eq!(resp.status, 204);
    let resp = do_request(&emu, "DELETE", "/storage/v1/b/bkt/o/f", b"");
    assert_eq!(resp.status, 404);
}

#[test]
fn test_patch_metadata() {
    let emu = mem_emulator();
    create_bucket(&emu, "bkt");
    put_object(&emu, "bkt", "f.txt", b"data");

    let resp = do_request(
        &emu,
        "PATCH",
        "/storage/v1/b/bkt/o/f.txt",
        br#"{"contentType":"text/html","metadata":{"owner":"me"}}"#,
    );
    let meta: Object = json_of(&resp);
    assert_eq!(meta.content_type, "text/html");
    assert_eq!(meta.metageneration, 2);
    assert_eq!(meta.metadata.unwrap().get("owner").unwrap(), "me");

    // Metageneration precondition.
    let resp = do_request(
        &emu,
        "PATCH",
        "/storage/v1/b/bkt/o/f.txt?ifMetagenerationMatch=1",
        br#"{"contentType":"text/plain"}"#,
    );
    assert_eq!(resp.status, 412);
    let resp = do_request(
        &emu,
        "PATCH",
        "/storage/v1/b/bkt/o/f.txt?ifMetagenerationMatch=2",
        br#"{"metadata":{"owner":null}}"#,
    );
    let meta: Object = json_of(&resp);
    assert_eq!(meta.metageneration, 3);
    assert!(meta.metadata.is_none());
}

#[test]
fn test_copy() {
    let emu = mem_emulator();
    create_bucket(&emu, "bkt");
    put_object(&emu, "bkt", "src.txt", b"copy me");

    let resp = do_request(&emu, "POST", "/storage/v1/b/bkt/o/src.txt/copyTo/b/bkt/o/dst.txt", b"");
    let meta: Object = json_of(&resp);
    assert_eq!(meta.name, "dst.txt");

    let resp = do_request(&emu, "GET", "/storage/v1/b/bkt/o/dst.txt?alt=media", b"");
    assert_eq!(&resp.body[..], b"copy me");

    let resp = do_request(&emu, "POST", "/storage/v1/b/bkt/o/absent/copyTo/b/bkt/o/x", b"");
    assert_eq!(resp.status, 404);
}

#[test]
fn test_rewrite_chunked() {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Rewrite {
        done: bool,
        object_size: String,
        total_bytes_rewritten: String,
        #[serde(default)]
        rewrite_token: String,
        #[serde(default)]
        resource: Option<Object>,
    }

    let emu = GcsEmulator::new(
        Arc::new(MemStore::new()),
        GcsOptions { rewrite_chunk: 4, ..Default::default() },
    );
    create_bucket(&emu, "bkt");
    put_object(&emu, "bkt", "big", b"0123456789"); // 10 bytes, 4-byte chunks

    let mut target = "/storage/v1/b/bkt/o/big/rewriteTo/b/bkt/o/big-copy".to_string();
    let mut calls = 0;
    loop {
        let rw: Rewrite = json_of(&do_request(&emu, "POST", &target, b""));
        calls += 1;
        assert_eq!(rw.object_size, "10");
        if rw.done {
            assert_eq!(rw.total_bytes_rewritten, "10");
            assert_eq!(rw.resource.unwrap().name, "big-copy");
            break;
        }
        assert!(!rw.rewrite_token.is_empty());
        target = format!(
            "/storage/v1/b/bkt/o/big/rewriteTo/b/bkt/o/big-copy?rewriteToken={}",
            rw.rewrite_token
        );
    }
    assert!(calls > 1, "a 10-byte object with 4-byte chunks needs several calls");

    let resp = do_request(&emu, "GET", "/storage/v1/b/bkt/o/big-copy?alt=media", b"");
    assert_eq!(&resp.body[..], b"0123456789");

    // A bogus token is rejected.
    let resp = do_request(
        &emu,
        "POST",
        "/storage/v1/b/bkt/o/big/rewriteTo/b/bkt/o/big-copy?rewriteToken=nope",
        b"",
    );
    assert_eq!(resp.status, 400);
}

#[test]
fn test_compose() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let emu = GcsEmulator::new(store.clone(), GcsOptions::default());
    create_bucket(&emu, "bkt");
    put_object(&emu, "bkt", "a", b"hello ");
    put_object(&emu, "bkt", "b", b"world");

    let body = br#"{"sourceObjects":[{"name":"a"},{"name":"b"}],"destination":{"contentType":"text/plain"}}"#;
    let resp = do_request(&emu, "POST", "/storage/v1/b/bkt/o/c/compose", body);
    let meta: Object = json_of(&resp);
    assert_eq!(meta.name, "c");
    assert_eq!(meta.component_count, 2);

    let resp = do_request(&emu, "GET", "/storage/v1/b/bkt/o/c?alt=media", b"");
    assert_eq!(&resp.body[..], b"hello world");

    // Generation equals the composite payload's mtime in nanoseconds.
    let composed = store.get_meta("", "bkt", "c").unwrap().unwrap();
    let mtime = std::fs::metadata(dir.path().join("bkt/c"))
        .unwrap()
        .modified()
        .unwrap();
    assert_eq!(composed.generation, nimbus_core::time::nanos_of(mtime));

    // Missing source.
    let body = br#"{"sourceObjects":[{"name":"a"},{"name":"missing"}]}"#;
    assert_eq!(do_request(&emu, "POST", "/storage/v1/b/bkt/o/d/compose", body).status, 404);

    // Per-source generation precondition.
    let body = br#"{"sourceObjects":[{"name":"a","objectPreconditions":{"ifGenerationMatch":"1"}}]}"#;
    assert_eq!(do_request(&emu, "POST", "/storage/v1/b/bkt/o/e/compose", body).status, 412);
}

#[test]
fn test_drop_prefix_and_bucket() {
    let emu = mem_emulator();
    create_bucket(&emu, "bkt");
    for prefix in ["AAA", "BBB", "CCC"] {
        for i in 0..3 {
            put_object(&emu, "bkt", &format!("{prefix}{i}"), b"x");
        }
    }

    let resp = do_request(&emu, "DELETE", "/storage/v1/b/bkt?prefix=AAA", b"");
    assert_eq!(resp.status, 204);
    let page: Objects = json_of(&do_request(&emu, "GET", "/storage/v1/b/bkt/o", b""));
    assert_eq!(page.items.len(), 6);

    // Unknown prefix is a no-op.
    let resp = do_request(&emu, "DELETE", "/storage/v1/b/bkt?prefix=XXX", b"");
    assert_eq!(resp.status, 204);

    // No prefix drops the whole bucket.
    let resp = do_request(&emu, "DELETE", "/storage/v1/b/bkt", b"");
    assert_eq!(resp.status, 204);
    assert_eq!(do_request(&emu, "GET", "/storage/v1/b/bkt", b"").status, 404);
}

#[test]
fn test_range_requests() {
    let emu = mem_emulator();
    create_bucket(&emu, "bkt");
    put_object(&emu, "bkt", "f", b"0123456789");

    let mut req =
        GcsRequest::from_target("GET", "/storage/v1/b/bkt/o/f?alt=media", Bytes::new());
    req.range = Some("bytes=2-5".to_string());
    let resp = emu.handle(&req);
    assert_eq!(resp.status, 206);
    assert_eq!(&resp.body[..], b"2345");
    assert!(resp
        .headers
        .iter()
        .any(|(k, v)| k == "Content-Range" && v == "bytes 2-5/10"));

    req.range = Some("bytes=-3".to_string());
    let resp = emu.handle(&req);
    assert_eq!(resp.status, 206);
    assert_eq!(&resp.body[..], b"789");
}

#[test]
fn test_error_body_shape() {
    let emu = mem_emulator();
    let resp = do_request(&emu, "GET", "/storage/v1/b/none/o/thing", b"");
    assert_eq!(resp.status, 404);
    let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(body["error"]["code"], 404);
    assert!(body["error"]["message"].is_string());
}

#[test]
fn test_batch() {
    let emu = mem_emulator();
    create_bucket(&emu, "bkt");
    put_object(&emu, "bkt", "one", b"1");
    put_object(&emu, "bkt", "two", b"2");

    let body = b"--sep\r\nContent-Type: application/http\r\nContent-ID: <item1>\r\n\r\nPATCH /storage/v1/b/bkt/o/one HTTP/1.1\r\nContent-Type: application/json\r\n\r\n{\"contentType\":\"text/a\"}\r\n--sep\r\nContent-Type: application/http\r\nContent-ID: <item2>\r\n\r\nDELETE /storage/v1/b/bkt/o/two HTTP/1.1\r\n\r\n\r\n--sep--\r\n";
    let mut req = GcsRequest::from_target("POST", "/batch/storage/v1", Bytes::from_static(body));
    req.content_type = "multipart/mixed; boundary=sep".to_string();
    let resp = emu.handle(&req);
    assert_eq!(resp.status, 200);
    assert!(resp.content_type.starts_with("multipart/mixed; boundary="));

    let text = String::from_utf8_lossy(&resp.body);
    assert!(text.contains("HTTP/1.1 200 OK"));
    assert!(text.contains("HTTP/1.1 204 No Content"));

    // Both sub-requests took effect.
    let meta: Object = json_of(&do_request(&emu, "GET", "/storage/v1/b/bkt/o/one", b""));
    assert_eq!(meta.content_type, "text/a");
    assert_eq!(do_request(&emu, "GET", "/storage/v1/b/bkt/o/two", b"").status, 404);
}

#[test]
fn test_directory_markers_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let emu = GcsEmulator::new(Arc::new(FileStore::new(dir.path())), GcsOptions::default());
    create_bucket(&emu, "bkt");

    let resp = do_request(
        &emu,
        "POST",
        "/upload/storage/v1/b/bkt/o?uploadType=media&name=folder%2F",
        b"",
    );
    let meta: Object = json_of(&resp);
    assert_eq!(meta.name, "folder/");
    assert_eq!(meta.size, Some(0));
    assert!(dir.path().join("bkt/folder").is_dir());
}
