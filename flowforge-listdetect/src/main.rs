//! CLI entry point for the list-detector driver: loads a CSV rule file, watches it for changes,
//! and evaluates an in-process stream of records against it.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::mpsc::channel as std_channel;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use flowforge_listdetect::{run_loop, ListDetector};
use flowforge_record::{FieldKind, Schema, TypedRecord, TypedValue};
use flowforge_rules::{load_rules_csv, ListMode, RulesEngine};
use flowforge_telemetry::{Content, TelemetryTree};
use flowforge_transport::{ChannelMessage, ChannelTransport};
use notify::{Config as NotifyConfig, PollWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ListModeArg {
    Whitelist,
    Blacklist,
}

impl From<ListModeArg> for ListMode {
    fn from(value: ListModeArg) -> Self {
        match value {
            ListModeArg::Whitelist => ListMode::Whitelist,
            ListModeArg::Blacklist => ListMode::Blacklist,
        }
    }
}

/// Evaluates incoming flow records against a CSV rule list, passing or dropping each one
/// according to a whitelist/blacklist mode, and hot-reloads the rule file on change.
#[derive(Parser)]
struct Args {
    /// Path to the rule-list CSV file.
    #[arg(long)]
    rules: PathBuf,

    /// Whether a record passes when rules match or when none do.
    #[arg(long, value_enum)]
    listmode: ListModeArg,

    /// How often, in milliseconds, to poll the rule file's mtime for changes.
    #[arg(long, default_value_t = 5_000)]
    check_interval: u64,

    /// Log level passed to the tracing env-filter (e.g. "info", "debug").
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Parses a token into the [`TypedValue`] its schema declares. Arrays, byte strings, and MAC
/// addresses aren't expressible in this line format and are rejected.
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

/// Parses one comma-separated input line into a record matching `schema`, in column order. This
/// repository's own transport is an external collaborator; this line format exists only so the
/// binary has something concrete to read from while that transport is wired in by the
/// surrounding deployment.
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

fn spawn_reload_watcher(
    rules_path: PathBuf,
    check_interval: Duration,
    handle: Arc<RwLock<RulesEngine>>,
) {
    thread::spawn(move || {
        let (tx, rx) = std_channel();
        let config = NotifyConfig::default().with_poll_interval(check_interval);
        let mut watcher = match PollWatcher::new(tx, config) {
            Ok(watcher) => watcher,
            Err(err) => {
                tracing::error!(error = %err, "failed to start rule-file watcher");
                return;
            }
        };
        if let Err(err) = watcher.watch(&rules_path, RecursiveMode::NonRecursive) {
            tracing::error!(error = %err, "failed to watch rule file");
            return;
        }

        for event in rx {
            let should_reload = match &event {
                Ok(event) => event.kind.is_modify() || event.kind.is_create(),
                Err(err) => {
                    warn!(error = %err, "rule-file watcher error");
                    false
                }
            };
            if !should_reload {
                continue;
            }
            match load_rules_csv(&rules_path) {
                Ok((schema, patterns)) => {
                    *handle.write() = RulesEngine::build(&schema, &patterns);
                    info!(path = %rules_path.display(), rule_count = patterns.len(), "reloaded rule file");
                }
                Err(err) => {
                    warn!(error = %err, "failed to reload rule file, keeping previous engine");
                }
            }
        }
    });
}

fn build_telemetry(detector: &ListDetector) -> TelemetryTree {
    use std::sync::atomic::Ordering;
    let passed = detector.counters.passed.load(Ordering::Relaxed) as f64;
    let dropped = detector.counters.dropped.load(Ordering::Relaxed) as f64;

    let mut tree = TelemetryTree::new();
    let dir = tree.mkdir(tree.root(), "listdetect");
    tree.add_leaf(dir, "passed", move || Content::Scalar(passed));
    tree.add_leaf(dir, "dropped", move || Content::Scalar(dropped));
    tree
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (schema, patterns) = match load_rules_csv(&args.rules) {
        Ok(loaded) => loaded,
        Err(err) => {
            tracing::error!(error = %err, "failed to load rule file");
            std::process::exit(1);
        }
    };
    let engine = RulesEngine::build(&schema, &patterns);
    let detector = ListDetector::new(engine, args.listmode.into());

    spawn_reload_watcher(
        args.rules.clone(),
        Duration::from_millis(args.check_interval),
        detector.engine_handle(),
    );

    let (input_tx, input_rx) = std_channel();
    let (output_tx, output_rx) = std_channel();
    let mut transport = ChannelTransport::single_output(input_rx, output_tx);
    transport.set_required_schema(schema.clone());

    let feeder = thread::spawn(move || {
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
        while let Ok(ChannelMessage::Record(_)) = output_rx.recv() {
            info!("forwarded record");
        }
    });

    run_loop(&mut transport, &detector);

    feeder.join().ok();
    drop(transport);
    printer.join().ok();

    let tree = build_telemetry(&detector);
    if let Ok(Content::Dict(entries)) = tree.read_path("listdetect") {
        for (name, content) in entries {
            info!(counter = %name, value = ?content, "final telemetry snapshot");
        }
    }
}
