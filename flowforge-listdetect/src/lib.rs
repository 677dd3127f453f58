//! List-detector driver: evaluates each record against a hot-reloadable [`RulesEngine`] and
//! forwards it downstream iff its [`ListMode`] passes the resulting match set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flowforge_record::TypedRecord;
use flowforge_rules::{ListMode, RulesEngine};
use flowforge_transport::{ReceiveEvent, Transport};
use parking_lot::RwLock;
use tracing::{debug, warn};

/// Running totals exposed to telemetry.
#[derive(Default)]
pub struct ListDetectCounters {
    pub passed: AtomicU64,
    pub dropped: AtomicU64,
}

/// A hot-reloadable [`RulesEngine`] plus the mode that turns a match set into a pass/drop
/// decision. Reload installs a freshly built engine behind the same handle so readers never
/// block on a writer building the next one (the single-writer/many-readers swap).
pub struct ListDetector {
    engine: Arc<RwLock<RulesEngine>>,
    pub mode: ListMode,
    pub counters: ListDetectCounters,
}

impl ListDetector {
    pub fn new(engine: RulesEngine, mode: ListMode) -> Self {
        ListDetector {
            engine: Arc::new(RwLock::new(engine)),
            mode,
            counters: ListDetectCounters::default(),
        }
    }

    /// A handle a reload watcher uses to swap in a freshly built engine.
    pub fn engine_handle(&self) -> Arc<RwLock<RulesEngine>> {
        Arc::clone(&self.engine)
    }

    /// Evaluates one record, returning whether it passes this detector's mode.
    pub fn evaluate(&self, record: &TypedRecord) -> bool {
        let matched = self.engine.read().matches(record);
        let passes = self.mode.passes(&matched);
        if passes {
            self.counters.passed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("flowforge_listdetect_passed_total").increment(1);
        } else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("flowforge_listdetect_dropped_total").increment(1);
        }
        passes
    }
}

/// Drives a transport's receive loop against a [`ListDetector`], forwarding every record whose
/// mode passes to output 0.
///
/// `FormatChange` is logged rather than handled transparently: the engine's field ids are
/// positional, tied to the schema its rules were built from, so a genuine schema change requires
/// a fresh rule file rather than a re-resolve. `EndOfStream` exits the loop cleanly.
pub fn run_loop<T: Transport>(transport: &mut T, detector: &ListDetector) {
    loop {
        match transport.receive() {
            ReceiveEvent::EndOfStream => {
                debug!("transport closed, exiting cleanly");
                return;
            }
            ReceiveEvent::FormatChange(schema) => {
                warn!(
                    fields = schema.len(),
                    "upstream format changed; rule field ids are positional and are not re-resolved"
                );
            }
            ReceiveEvent::Record(record) => {
                if detector.evaluate(&record) {
                    if let Err(err) = transport.send(0, record) {
                        warn!(error = %err, "failed to forward record downstream");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_rules::load_rules_csv;
    use std::io::Write;

    fn write_temp_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    /// Scenario 3 from this repository's testable-properties list, run against both modes.
    #[test]
    fn scenario_3_whitelist_pass_through() {
        let file = write_temp_csv("uint16 DST_PORT,ipaddr SRC_IP\n80,10.0.0.0/8\n");
        let (schema, patterns) = load_rules_csv(file.path()).unwrap();
        let engine = RulesEngine::build(&schema, &patterns);
        let detector = ListDetector::new(engine, ListMode::Whitelist);

        let mut hit = TypedRecord::new(schema.len());
        hit.set(
            flowforge_record::FieldId(0),
            flowforge_record::TypedValue::U16(80),
        );
        hit.set(
            flowforge_record::FieldId(1),
            flowforge_record::TypedValue::IpV4 {
                addr: "10.1.2.3".parse().unwrap(),
                prefix: 32,
            },
        );
        assert!(detector.evaluate(&hit));

        let mut miss = TypedRecord::new(schema.len());
        miss.set(
            flowforge_record::FieldId(0),
            flowforge_record::TypedValue::U16(443),
        );
        miss.set(
            flowforge_record::FieldId(1),
            flowforge_record::TypedValue::IpV4 {
                addr: "10.1.2.3".parse().unwrap(),
                prefix: 32,
            },
        );
        assert!(!detector.evaluate(&miss));

        assert_eq!(detector.counters.passed.load(Ordering::Relaxed), 1);
        assert_eq!(detector.counters.dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn blacklist_is_the_dual_of_whitelist() {
        let file = write_temp_csv("uint16 DST_PORT,ipaddr SRC_IP\n80,10.0.0.0/8\n");
        let (schema, patterns) = load_rules_csv(file.path()).unwrap();
        let engine = RulesEngine::build(&schema, &patterns);
        let detector = ListDetector::new(engine, ListMode::Blacklist);

        let mut record = TypedRecord::new(schema.len());
        record.set(
            flowforge_record::FieldId(0),
            flowforge_record::TypedValue::U16(443),
        );
        record.set(
            flowforge_record::FieldId(1),
            flowforge_record::TypedValue::IpV4 {
                addr: "10.1.2.3".parse().unwrap(),
                prefix: 32,
            },
        );
        assert!(detector.evaluate(&record));
    }

    #[test]
    fn reload_swaps_in_a_fresh_engine_without_rebuilding_the_detector() {
        let file = write_temp_csv("uint16 DST_PORT\n80\n");
        let (schema, patterns) = load_rules_csv(file.path()).unwrap();
        let engine = RulesEngine::build(&schema, &patterns);
        let detector = ListDetector::new(engine, ListMode::Whitelist);
        let handle = detector.engine_handle();

        let mut record = TypedRecord::new(schema.len());
        record.set(
            flowforge_record::FieldId(0),
            flowforge_record::TypedValue::U16(443),
        );
        assert!(!detector.evaluate(&record));

        let (schema2, patterns2) = load_rules_csv(
            write_temp_csv("uint16 DST_PORT\n443\n").path(),
        )
        .unwrap();
        *handle.write() = RulesEngine::build(&schema2, &patterns2);

        assert!(detector.evaluate(&record));
    }
}
