//! # Nimbus Storage
//!
//! An in-process Cloud Storage emulator speaking the JSON API over
//! HTTP, with in-memory or on-disk backing. Client libraries written
//! against the real service bind unchanged via their endpoint override.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       nimbus-storage                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  http      - axum transport adapter                          │
//! │  dispatch  - path/method router, preconditions, rewrite,     │
//! │              compose, listing, batch                         │
//! │  multipart - multipart/related and multipart/mixed parsing   │
//! │  store     - memory and file object-store backends           │
//! │  token     - pagination cursor codec                         │
//! │  meta      - object/bucket metadata model                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod dispatch;
pub mod http;
pub mod meta;
pub mod multipart;
pub mod store;
pub mod token;

pub use dispatch::{GcsEmulator, GcsRequest, GcsResponse};
pub use meta::{Bucket, Object, Objects};
pub use store::{FileStore, MemStore, ObjectStore};
