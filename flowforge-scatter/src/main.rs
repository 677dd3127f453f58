//! CLI entry point for the flow-scatter driver: parses a DSL rule and routes an in-process
//! stream of records across N outputs.

use std::io::{self, BufRead};
use std::sync::mpsc::channel as std_channel;
use std::thread;

use clap::Parser;
use flowforge_record::{FieldId, FieldKind, Schema, TypedRecord, TypedValue};
use flowforge_scatter::run_loop;
use flowforge_scatter_core::parse_rule;
use flowforge_telemetry::{Content, TelemetryTree};
use flowforge_transport::{ChannelMessage, ChannelTransport};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Routes incoming flow records across a fixed number of outputs, by hashing the fields named
/// by the first matching branch of a rule, falling back to round-robin.
#[derive(Parser)]
struct Args {
    /// Number of outputs to scatter records across.
    #[arg(long)]
    count: usize,

    /// The scatter rule DSL, e.g. `<TLS_SNI>:(SRC_IP,DST_IP)|<>:(SRC_IP)`. An empty rule
    /// always round-robins.
    #[arg(long, default_value = "")]
    rule: String,

    /// Log level passed to the tracing env-filter (e.g. "info", "debug").
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// The schema this binary's demo input stream declares, chosen to exercise both guarded and
/// unconditional scatter branches.
fn default_schema() -> Schema {
    Schema::new(vec![
        ("SRC_IP".to_string(), FieldKind::IpV4),
        ("DST_IP".to_string(), FieldKind::IpV4),
        ("SRC_PORT".to_string(), FieldKind::U16),
        ("DST_PORT".to_string(), FieldKind::U16),
        ("PROTOCOL".to_string(), FieldKind::U8),
        ("VLAN_ID".to_string(), FieldKind::U16),
    ])
}

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
        record.set(FieldId(index), parse_value(kind, token)?);
    }
    Some(record)
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.count == 0 {
        tracing::error!("--count must be at least 1");
        std::process::exit(1);
    }

    let rule = match parse_rule(&args.rule) {
        Ok(rule) => rule,
        Err(err) => {
            tracing::error!(error = %err, "failed to parse scatter rule");
            std::process::exit(1);
        }
    };

    let schema = default_schema();
    let (input_tx, input_rx) = std_channel();
    let outputs: Vec<_> = (0..args.count).map(|_| std_channel()).collect();
    let (output_txs, output_rxs): (Vec<_>, Vec<_>) = outputs.into_iter().unzip();
    let mut transport = ChannelTransport::new(input_rx, output_txs);
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

    let printers: Vec<_> = output_rxs
        .into_iter()
        .enumerate()
        .map(|(index, rx)| {
            thread::spawn(move || {
                let mut forwarded = 0u64;
                while let Ok(ChannelMessage::Record(_)) = rx.recv() {
                    forwarded += 1;
                }
                forwarded
            })
        })
        .collect();

    run_loop(&mut transport, &rule, args.count);

    feeder.join().ok();
    drop(transport);
    let per_output: Vec<u64> = printers.into_iter().map(|h| h.join().unwrap_or(0)).collect();

    let mut tree = TelemetryTree::new();
    let dir = tree.mkdir(tree.root(), "scatter");
    for (index, count) in per_output.iter().enumerate() {
        let count = *count as f64;
        tree.add_leaf(dir, &format!("output_{index}"), move || Content::Scalar(count));
    }
    if let Ok(Content::Dict(entries)) = tree.read_path("scatter") {
        for (name, content) in entries {
            info!(counter = %name, value = ?content, "final telemetry snapshot");
        }
    }
}
