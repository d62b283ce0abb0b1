//! # Bigtable Emulator Launcher
//!
//! Run with: `btemulator --host localhost --port 8086 [--dir ./data]`
//!
//! Serves the emulator core over a newline-delimited JSON framing: each
//! request line is `{"op": "...", "body": {...}}`; stream frames come back
//! as `{"frame": ...}` lines followed by a `{"done": ...}` or `{"error":
//! ...}` terminator. The gRPC adapter proper is a separate concern; this
//! framing exercises the identical request and response values.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn, Level};

use nimbus_bigtable::scan::FrameSink;
use nimbus_bigtable::server::{
    CheckConsistencyRequest, CheckAndMutateRowRequest, CreateTableRequest, DropRowRangeRequest,
    ListTablesRequest, ModifyColumnFamiliesRequest, MutateRowRequest, MutateRowsRequest,
    ReadModifyWriteRowRequest, ReadRowsRequest,
};
use nimbus_bigtable::store::TableStorage;
use nimbus_bigtable::{BigtableEmulator, DiskStorage, SkipListStorage};
use nimbus_core::{EmulatorConfig, Error, Result, StopSignal};

#[derive(Parser)]
#[command(name = "btemulator")]
#[command(about = "Launches the Bigtable emulator on the given address")]
struct Cli {
    /// The address to bind to on the local machine.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// The port number to bind to on the local machine.
    #[arg(long, default_value_t = 8086)]
    port: u16,

    /// If set, use persistence in the given directory.
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[derive(Deserialize)]
struct Envelope {
    op: String,
    #[serde(default)]
    body: Value,
}

#[derive(Deserialize)]
struct NameRequest {
    name: String,
}

#[derive(Deserialize)]
struct TableNameRequest {
    table_name: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();
    let cli = Cli::parse();

    let config = EmulatorConfig { host: cli.host, port: cli.port, dir: cli.dir };
    let storage: Arc<dyn TableStorage> = match &config.dir {
        Some(dir) => {
            println!("Writing to: {}", dir.display());
            Arc::new(DiskStorage::new(dir))
        }
        None => Arc::new(SkipListStorage),
    };
    let emu = BigtableEmulator::new(storage);

    let addr = config.addr();
    let listener = match TcpListener::bind(&addr) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("failed to listen on addr {addr}: {err}");
            return ExitCode::FAILURE;
        }
    };
    let local = listener.local_addr().map(|a| a.to_string()).unwrap_or(addr);
    println!("Bigtable emulator running on {local}");

    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let emu = Arc::clone(&emu);
                std::thread::spawn(move || {
                    if let Err(err) = serve_connection(&emu, stream) {
                        warn!("connection ended: {}", err);
                    }
                });
            }
            Err(err) => warn!("accept failed: {}", err),
        }
    }
    ExitCode::SUCCESS
}

fn serve_connection(emu: &BigtableEmulator, stream: TcpStream) -> std::io::Result<()> {
    let peer = stream.peer_addr()?;
    info!("client connected: {}", peer);
    let reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let envelope: Envelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(err) => {
                send_line(&mut writer, &error_value(&Error::invalid(err.to_string())))?;
                continue;
            }
        };
        let terminator = match run_op(emu, &envelope, &mut writer) {
            Ok(result) => json!({ "done": result }),
            Err(err) => error_value(&err),
        };
        send_line(&mut writer, &terminator)?;
    }
    Ok(())
}

fn run_op<W: Write>(
    emu: &BigtableEmulator,
    envelope: &Envelope,
    writer: &mut W,
) -> Result<Value> {
    let body = envelope.body.clone();
    let cancel = StopSignal::new();
    match envelope.op.as_str() {
        "create_table" => to_value(emu.create_table(&parse::<CreateTableRequest>(body)?)?),
        "list_tables" => to_value(emu.list_tables(&parse::<ListTablesRequest>(body)?)),
        "get_table" => to_value(emu.get_table(&parse::<NameRequest>(body)?.name)?),
        "delete_table" => {
            emu.delete_table(&parse::<NameRequest>(body)?.name)?;
            Ok(Value::Null)
        }
        "modify_column_families" => {
            to_value(emu.modify_column_families(&parse::<ModifyColumnFamiliesRequest>(body)?)?)
        }
        "drop_row_range" => {
            emu.drop_row_range(&parse::<DropRowRangeRequest>(body)?)?;
            Ok(Value::Null)
        }
        "generate_consistency_token" => {
            to_value(emu.generate_consistency_token(&parse::<NameRequest>(body)?.name)?)
        }
        "check_consistency" => {
            to_value(emu.check_consistency(&parse::<CheckConsistencyRequest>(body)?)?)
        }
        "read_rows" => {
            let req = parse::<ReadRowsRequest>(body)?;
            let mut sink = LineSink { writer };
            emu.read_rows(&req, &mut sink, &cancel)?;
            Ok(Value::Null)
        }
        "mutate_row" => {
            emu.mutate_row(&parse::<MutateRowRequest>(body)?)?;
            Ok(Value::Null)
        }
        "mutate_rows" => {
            let req = parse::<MutateRowsRequest>(body)?;
            let mut sink = LineSink { writer };
            emu.mutate_rows(&req, &mut sink)?;
            Ok(Value::Null)
        }
        "check_and_mutate_row" => {
            to_value(emu.check_and_mutate_row(&parse::<CheckAndMutateRowRequest>(body)?)?)
        }
        "read_modify_write_row" => {
            to_value(emu.read_modify_write_row(&parse::<ReadModifyWriteRowRequest>(body)?)?)
        }
        "sample_row_keys" => {
            let req = parse::<TableNameRequest>(body)?;
            let mut sink = LineSink { writer };
            emu.sample_row_keys(&req.table_name, &mut sink, &cancel)?;
            Ok(Value::Null)
        }
        other => Err(Error::invalid(format!("unknown op {other:?}"))),
    }
}

fn parse<T: serde::de::DeserializeOwned>(body: Value) -> Result<T> {
    serde_json::from_value(body).map_err(|e| Error::invalid(format!("bad request body: {e}")))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::internal(e.to_string()))
}

fn error_value(err: &Error) -> Value {
    json!({ "error": { "code": err.code(), "message": err.to_string() } })
}

fn send_line<W: Write>(writer: &mut W, value: &Value) -> std::io::Result<()> {
    writeln!(writer, "{value}")?;
    writer.flush()
}

/// Writes each stream frame as a `{"frame": ...}` line.
struct LineSink<'a, W: Write> {
    writer: &'a mut W,
}

impl<'a, W: Write, T: serde::Serialize> FrameSink<T> for LineSink<'a, W> {
    fn send(&mut self, frame: T) -> Result<()> {
        let value = json!({ "frame": frame });
        writeln!(self.writer, "{value}").map_err(Error::from)?;
        self.writer.flush().map_err(Error::from)
    }
}
