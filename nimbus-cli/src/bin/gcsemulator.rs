//! # Cloud Storage Emulator Launcher
//!
//! Run with: `gcsemulator --host localhost --port 9000 [--dir ./data]`

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};

use nimbus_core::EmulatorConfig;
use nimbus_storage::dispatch::{GcsEmulator, GcsOptions};
use nimbus_storage::{http, FileStore, MemStore, ObjectStore};

#[derive(Parser)]
#[command(name = "gcsemulator")]
#[command(about = "Launches the Cloud Storage emulator on the given address")]
struct Cli {
    /// The address to bind to on the local machine.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// The port number to bind to on the local machine.
    #[arg(long, default_value_t = 9000)]
    port: u16,

    /// If set, use persistence in the given directory.
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();
    let cli = Cli::parse();

    let config = EmulatorConfig { host: cli.host, port: cli.port, dir: cli.dir };
    let store: Arc<dyn ObjectStore> = match &config.dir {
        Some(dir) => {
            println!("Writing to: {}", dir.display());
            Arc::new(FileStore::new(dir))
        }
        None => Arc::new(MemStore::new()),
    };

    let addr = config.addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("failed to listen on addr {addr}: {err}");
            return ExitCode::FAILURE;
        }
    };
    let local = listener.local_addr().map(|a| a.to_string()).unwrap_or(addr);

    let emu = Arc::new(GcsEmulator::new(
        store,
        GcsOptions { base_url: format!("http://{local}/"), ..Default::default() },
    ));
    let app = http::router(emu);

    println!("Cloud Storage emulator running on http://{local}");
    info!("serving until interrupted");
    if let Err(err) = axum::serve(listener, app).await {
        eprintln!("server error: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
