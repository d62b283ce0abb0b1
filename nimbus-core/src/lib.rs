//! # Nimbus Core
//!
//! Shared foundation for the Nimbus emulator suite:
//! - Error taxonomy common to both emulators
//! - Emulator configuration and client-side helpers
//! - Stop/cancellation signalling
//! - Clock plumbing and time helpers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  nimbus-core                    │
//! ├─────────────────────────────────────────────────┤
//! │  • error      - Failure taxonomy                │
//! │  • config     - Launcher/client configuration   │
//! │  • signal     - Shutdown & cancellation         │
//! │  • time       - Clocks and timestamp helpers    │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod signal;
pub mod time;

pub use config::EmulatorConfig;
pub use error::{Error, Result};
pub use signal::StopSignal;
pub use time::Clock;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
