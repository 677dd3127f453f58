//! CLI entry point for the ClickHouse sink driver: loads a YAML config, validates the target
//! table's schema, and drains an in-process stream of records into it.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel as std_channel;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use flowforge_chsink::{run_producer, spawn_inserters, Endpoint, LiveClickHouseClient, SinkConfig};
use flowforge_chsink_core::{validate_schema, BlockPool};
use flowforge_record::{FieldKind, Schema, TypedRecord, TypedValue};
use flowforge_telemetry::{Content, TelemetryTree};
use flowforge_transport::{ChannelMessage, ChannelTransport};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Buffers flow records into ClickHouse column blocks and inserts them through a pool of
/// worker connections, retrying and rotating endpoints on failure.
#[derive(Parser)]
struct Args {
    /// Path to the sink's YAML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log level passed to the tracing env-filter (e.g. "info", "debug").
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Parses a token into the [`TypedValue`] its schema declares, mirroring the other drivers'
/// input line format.
fn parse_value(kind: FieldKind, token: &str) -> Option<TypedValue> {
    Some(match kind {
        FieldKind::I8 => TypedValue::I8(token.parse().ok()?),
        FieldKind::I16 => TypedValue::I16(token.parse().ok()?),
        FieldKind::I32 => TypedValue::I32(token.parse().ok()?),
        FieldKind::I64 => TypedValue::I64(token.parse().ok()?),
        FieldKind::U8 => TypedValue::U8(token.parse().ok()?),
        FieldKind::U16 => TypedValue::U16(token.parse().ok()?),
        FieldKind::U32 => TypedValue::U32(token.parse().ok()?),
        FieldKind::U64 => TypedValue::U64(token.parse().ok()?),
        FieldKind::F32 => TypedValue::F32(token.parse().ok()?),
        FieldKind::F64 => TypedValue::F64(token.parse().ok()?),
        FieldKind::Char => TypedValue::Char(token.chars().next()?),
        FieldKind::TimeNs => TypedValue::TimeNs(token.parse().ok()?),
        FieldKind::String => TypedValue::String(token.to_string()),
        FieldKind::IpV4 => TypedValue::IpV4 { addr: token.parse().ok()?, prefix: 32 },
        FieldKind::IpV6 => TypedValue::IpV6 { addr: token.parse().ok()?, prefix: 128 },
        FieldKind::Mac | FieldKind::Bytes | FieldKind::Array => return None,
    })
}

fn parse_line(schema: &Schema, line: &str) -> Option<TypedRecord> {
    let tokens: Vec<&str> = line.trim().split(',').collect();
    if tokens.len() != schema.len() {
        return None;
    }
    let mut record = TypedRecord::new(schema.len());
    for (index, ((_, kind), token)) in schema.iter().zip(tokens).enumerate() {
        record.set(flowforge_record::FieldId(index), parse_value(kind, token)?);
    }
    Some(record)
}

fn build_endpoints(config: &SinkConfig) -> Vec<Endpoint> {
    config
        .connection
        .endpoints
        .iter()
        .map(|e| Endpoint { host: e.host.clone(), port: e.port })
        .collect()
}

fn build_telemetry(error_slots: &[Arc<parking_lot::Mutex<Option<String>>>]) -> TelemetryTree {
    let failing = error_slots.iter().filter(|slot| slot.lock().is_some()).count() as f64;

    let mut tree = TelemetryTree::new();
    let dir = tree.mkdir(tree.root(), "chsink");
    tree.add_leaf(dir, "workers_with_last_error", move || Content::Scalar(failing));
    tree
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match SinkConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load sink configuration");
            std::process::exit(1);
        }
    };

    let schema = config.input_schema();
    let specs = match config.column_specs(&schema) {
        Ok(specs) => specs,
        Err(err) => {
            tracing::error!(error = %err, "failed to resolve configured columns");
            std::process::exit(1);
        }
    };

    let endpoints = build_endpoints(&config);
    let table = config.connection.table.clone();

    let mut startup_client = match LiveClickHouseClient::new(
        endpoints.clone(),
        config.connection.database.clone(),
        config.connection.username.clone(),
        config.connection.password.clone(),
    ) {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "failed to build startup ClickHouse client");
            std::process::exit(1);
        }
    };
    if let Err(err) = validate_schema(&mut startup_client, &table, &specs) {
        tracing::error!(error = %err, "configured columns don't match the table's actual schema");
        std::process::exit(1);
    }
    drop(startup_client);

    let pool = match BlockPool::new(config.blocks, specs) {
        Ok(pool) => Arc::new(pool),
        Err(err) => {
            tracing::error!(error = %err, "failed to allocate block pool");
            std::process::exit(1);
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let database = config.connection.database.clone();
    let username = config.connection.username.clone();
    let password = config.connection.password.clone();
    let (inserter_handles, error_slots) = spawn_inserters(
        Arc::clone(&pool),
        table.clone(),
        config.inserter_threads,
        Arc::clone(&stop),
        move |worker_id| {
            match LiveClickHouseClient::new(endpoints.clone(), database.clone(), username.clone(), password.clone()) {
                Ok(client) => Box::new(client),
                Err(err) => panic!("inserter {worker_id} failed to build its ClickHouse client: {err}"),
            }
        },
    );

    let (input_tx, input_rx) = std_channel();
    let mut transport = ChannelTransport::new(input_rx, Vec::new());
    transport.set_required_schema(schema.clone());

    let feeder_schema = schema.clone();
    let feeder = thread::spawn(move || {
        input_tx.send(ChannelMessage::FormatChange(feeder_schema.clone())).ok();
        let stdin = io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(&feeder_schema, &line) {
                Some(record) => {
                    if input_tx.send(ChannelMessage::Record(record)).is_err() {
                        break;
                    }
                }
                None => warn!(%line, "skipping unparsable input line"),
            }
        }
        input_tx.send(ChannelMessage::EndOfStream).ok();
    });

    run_producer(
        &mut transport,
        Arc::clone(&pool),
        config.inserter_threads,
        config.block_insert_threshold,
        Duration::from_secs(config.block_insert_max_delay_secs),
    );

    feeder.join().ok();
    stop.store(true, Ordering::SeqCst);
    for handle in inserter_handles {
        handle.join().ok();
    }

    let tree = build_telemetry(&error_slots);
    if let Ok(Content::Dict(entries)) = tree.read_path("chsink") {
        for (name, content) in entries {
            info!(counter = %name, value = ?content, "final telemetry snapshot");
        }
    }
}
