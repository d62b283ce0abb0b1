//! # Configuration
//!
//! Launcher configuration and the environment variables client-side helpers
//! consult to find a running emulator.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable naming a running Bigtable emulator (`host:port`).
pub const BIGTABLE_EMULATOR_HOST: &str = "BIGTABLE_EMULATOR_HOST";

/// Environment variable naming a running Cloud Storage emulator (`host:port`).
pub const GCS_EMULATOR_HOST: &str = "GCS_EMULATOR_HOST";

/// Configuration shared by both launcher binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorConfig {
    /// Address to bind to on the local machine.
    pub host: String,
    /// Port to bind to; 0 picks a free port.
    pub port: u16,
    /// When set, persist data under this directory; otherwise in-memory.
    pub dir: Option<PathBuf>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self { host: "localhost".to_string(), port: 0, dir: None }
    }
}

impl EmulatorConfig {
    /// The `host:port` string to bind.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The Bigtable emulator address from the environment, if any.
/// The value is `host:port` with no scheme.
pub fn bigtable_emulator_host() -> Option<String> {
    std::env::var(BIGTABLE_EMULATOR_HOST).ok().filter(|v| !v.is_empty())
}

/// The Cloud Storage emulator address from the environment, if any.
/// The value is `host:port` with no scheme.
pub fn gcs_emulator_host() -> Option<String> {
    std::env::var(GCS_EMULATOR_HOST).ok().filter(|v| !v.is_empty())
}
