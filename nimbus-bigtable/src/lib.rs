//! # Nimbus Bigtable
//!
//! An in-process Cloud Bigtable emulator. It is unauthenticated and only a
//! rough approximation of the real service, intended for unit tests and
//! local development.
//!
//! The crate is transport-agnostic: [`BigtableEmulator`] consumes typed
//! request values, mutates state or returns typed responses, and pushes
//! stream frames through a caller-supplied [`scan::FrameSink`]. A transport
//! adapter (gRPC in production deployments, the bundled JSON framing for
//! local use) maps the wire to these values.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       nimbus-bigtable                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  server    - emulator facade, table map, GC loop             │
//! │  table     - table metadata, GC rules, activity tracking     │
//! │  scan      - range iteration, chunking, frame packing        │
//! │  filter    - recursive cell-filter evaluator                 │
//! │  mutation  - ordered mutation batches                        │
//! │  rmw       - atomic append / increment                       │
//! │  range     - row-set normalization and merging               │
//! │  store     - pluggable ordered row-storage engines           │
//! │  data      - row / family / column / cell model              │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod data;
pub mod filter;
pub mod mutation;
pub mod range;
pub mod rmw;
pub mod scan;
pub mod server;
pub mod store;
pub mod table;

pub use data::{Cell, Column, Family, Row};
pub use filter::RowFilter;
pub use mutation::Mutation;
pub use rmw::ReadModifyWriteRule;
pub use scan::{CellChunk, FrameSink, ReadRowsResponse};
pub use server::BigtableEmulator;
pub use store::{BTreeStorage, DiskStorage, SkipListStorage, TableStorage};
pub use table::{FamilyDef, GcRule, TableDef};
