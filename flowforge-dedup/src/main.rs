//! CLI entry point for the flow deduplicator driver: wires a [`Deduplicator`] to an in-process
//! transport fed from stdin, logging every classification decision and, on clean shutdown, a
//! snapshot of its counters through the telemetry tree.

use std::io::{self, BufRead};
use std::sync::atomic::Ordering;
use std::sync::mpsc::channel;
use std::thread;
use std::time::Instant;

use clap::Parser;
use flowforge_dedup::{run_loop, DedupFieldNames, Deduplicator};
use flowforge_record::{FieldId, FieldKind, Schema, TypedRecord, TypedValue};
use flowforge_telemetry::{Content, TelemetryTree};
use flowforge_transport::{ChannelMessage, ChannelTransport};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Classifies incoming flow records as fresh, replaced, or duplicate against a timeout-evicting
/// flow-key map, forwarding every non-duplicate record downstream.
#[derive(Parser)]
struct Args {
    /// Capacity exponent for the flow-key map: 2^size total slots, minimum 3.
    #[arg(long, default_value_t = 16)]
    size: u32,

    /// Duplicate-detection window, in the same time unit as the record clock (milliseconds).
    #[arg(long, default_value_t = 30_000)]
    timeout: u64,

    /// Log level passed to the tracing env-filter (e.g. "info", "debug").
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn default_schema() -> Schema {
    Schema::new(vec![
        ("SRC_IP".to_string(), FieldKind::IpV4),
        ("DST_IP".to_string(), FieldKind::IpV4),
        ("SRC_PORT".to_string(), FieldKind::U16),
        ("DST_PORT".to_string(), FieldKind::U16),
        ("PROTOCOL".to_string(), FieldKind::U8),
        ("LINK_BITFIELD".to_string(), FieldKind::U64),
    ])
}

/// Parses `src_ip,dst_ip,src_port,dst_port,proto,link_bitfield` into a record matching
/// [`default_schema`]. The real record transport is an external collaborator this repository
/// doesn't own; this line format exists only so the binary has something concrete to read from
/// while that transport is wired in by the surrounding deployment.
fn parse_line(schema: &Schema, line: &str) -> Option<TypedRecord> {
    let parts: Vec<&str> = line.trim().split(',').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut record = TypedRecord::new(schema.len());
    record.set(
        schema.resolve("SRC_IP").ok()?,
        TypedValue::IpV4 { addr: parts[0].parse().ok()?, prefix: 32 },
    );
    record.set(
        schema.resolve("DST_IP").ok()?,
        TypedValue::IpV4 { addr: parts[1].parse().ok()?, prefix: 32 },
    );
    record.set(schema.resolve("SRC_PORT").ok()?, TypedValue::U16(parts[2].parse().ok()?));
    record.set(schema.resolve("DST_PORT").ok()?, TypedValue::U16(parts[3].parse().ok()?));
    record.set(schema.resolve("PROTOCOL").ok()?, TypedValue::U8(parts[4].parse().ok()?));
    record.set(schema.resolve("LINK_BITFIELD").ok()?, TypedValue::U64(parts[5].parse().ok()?));
    Some(record)
}

/// Builds a snapshot telemetry tree over a deduplicator's final counters, for a clean-shutdown
/// summary. A long-running deployment instead mounts this tree at startup and leaves its leaves
/// reading live atomics for the FUSE-mounted filesystem to poll.
fn build_telemetry(dedup: &Deduplicator) -> TelemetryTree {
    let inserted = dedup.counters.inserted.load(Ordering::Relaxed) as f64;
    let replaced = dedup.counters.replaced.load(Ordering::Relaxed) as f64;
    let deduplicated = dedup.counters.deduplicated.load(Ordering::Relaxed) as f64;

    let mut tree = TelemetryTree::new();
    let dir = tree.mkdir(tree.root(), "dedup");
    tree.add_leaf(dir, "inserted", move || Content::Scalar(inserted));
    tree.add_leaf(dir, "replaced", move || Content::Scalar(replaced));
    tree.add_leaf(dir, "deduplicated", move || Content::Scalar(deduplicated));
    tree
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut dedup = match Deduplicator::new(args.size, args.timeout) {
        Ok(dedup) => dedup,
        Err(err) => {
            tracing::error!(error = %err, "failed to construct deduplicator");
            std::process::exit(1);
        }
    };

    let (input_tx, input_rx) = channel();
    let (output_tx, output_rx) = channel();
    let mut transport = ChannelTransport::single_output(input_rx, output_tx);
    transport.set_required_schema(default_schema());

    let feeder = thread::spawn(move || {
        let schema = default_schema();
        input_tx.send(ChannelMessage::FormatChange(schema.clone())).ok();
        let stdin = io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(&schema, &line) {
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

    let printer = thread::spawn(move || {
        while let Ok(ChannelMessage::Record(record)) = output_rx.recv() {
            let src_port = record.get(FieldId(2));
            info!(?src_port, "forwarded record");
        }
    });

    let names = DedupFieldNames::default();
    let start = Instant::now();
    run_loop(&mut transport, &mut dedup, &names, || start.elapsed().as_millis() as u64);

    feeder.join().ok();
    drop(transport);
    printer.join().ok();

    let tree = build_telemetry(&dedup);
    if let Ok(Content::Dict(entries)) = tree.read_path("dedup") {
        for (name, content) in entries {
            info!(counter = %name, value = ?content, "final telemetry snapshot");
        }
    }
}
