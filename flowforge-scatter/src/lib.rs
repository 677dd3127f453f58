//! Flow-scatter driver: wires a parsed [`ScatterRule`] against the upstream schema and routes
//! each record to one of N outputs, re-compiling the rule whenever the schema changes.

use flowforge_record::Schema;
use flowforge_scatter_core::{CompiledRule, FlowScatter, ScatterRule};
use flowforge_transport::{ReceiveEvent, Transport};
use tracing::{debug, warn};

/// Drives a transport's receive loop against a scatter rule, compiling it fresh on every
/// `FormatChange` (the rule's field ids are only valid for the schema they were compiled
/// against) and routing every record that follows to one of `output_count` outputs.
pub fn run_loop<T: Transport>(transport: &mut T, rule: &ScatterRule, output_count: usize) {
    let mut scatter: Option<FlowScatter> = None;

    loop {
        match transport.receive() {
            ReceiveEvent::EndOfStream => {
                debug!("transport closed, exiting cleanly");
                return;
            }
            ReceiveEvent::FormatChange(schema) => {
                scatter = compile_scatter(rule, &schema, output_count);
            }
            ReceiveEvent::Record(record) => {
                let Some(scatter) = scatter.as_mut() else {
                    warn!("dropping record received before any format change compiled the rule");
                    continue;
                };
                let output = scatter.route(&record);
                metrics::counter!("flowforge_scatter_routed_total", "output" => output.to_string())
                    .increment(1);
                if let Err(err) = transport.send(output, record) {
                    warn!(error = %err, output, "failed to forward record to its scattered output");
                }
            }
        }
    }
}

fn compile_scatter(rule: &ScatterRule, schema: &Schema, output_count: usize) -> Option<FlowScatter> {
    match CompiledRule::compile(rule, schema) {
        Ok(compiled) => match FlowScatter::new(compiled, output_count) {
            Ok(scatter) => Some(scatter),
            Err(err) => {
                tracing::error!(error = %err, "failed to build flow scatter");
                None
            }
        },
        Err(err) => {
            tracing::error!(error = %err, "failed to compile scatter rule against the current schema");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_record::{FieldId, FieldKind, TypedRecord, TypedValue};
    use flowforge_scatter_core::parse_rule;
    use flowforge_transport::{ChannelMessage, ChannelTransport};
    use std::sync::mpsc::channel;

    fn schema() -> Schema {
        Schema::new(vec![
            ("SRC_IP".to_string(), FieldKind::IpV4),
            ("DST_IP".to_string(), FieldKind::IpV4),
        ])
    }

    fn record() -> TypedRecord {
        let mut r = TypedRecord::new(2);
        r.set(FieldId(0), TypedValue::IpV4 { addr: [10, 0, 0, 1].into(), prefix: 32 });
        r.set(FieldId(1), TypedValue::IpV4 { addr: [10, 0, 0, 2].into(), prefix: 32 });
        r
    }

    /// Scenario 5 from this repository's testable-properties list: a guarded branch on
    /// `TLS_SNI` falling through to an unconditional `SRC_IP` branch across 4 outputs.
    #[test]
    fn scenario_5_scatter_across_four_outputs() {
        let schema = Schema::new(vec![
            ("TLS_SNI".to_string(), FieldKind::String),
            ("SRC_IP".to_string(), FieldKind::IpV4),
            ("DST_IP".to_string(), FieldKind::IpV4),
        ]);
        let rule = parse_rule("<TLS_SNI>:(SRC_IP,DST_IP)|<>:(SRC_IP)").unwrap();

        let (in_tx, in_rx) = channel();
        let outputs: Vec<_> = (0..4).map(|_| channel()).collect();
        let (out_tx, out_rx): (Vec<_>, Vec<_>) = outputs.into_iter().unzip();
        let mut transport = ChannelTransport::new(in_rx, out_tx);

        in_tx.send(ChannelMessage::FormatChange(schema.clone())).unwrap();
        let mut r = TypedRecord::new(3);
        r.set(FieldId(0), TypedValue::String(String::new()));
        r.set(FieldId(1), TypedValue::IpV4 { addr: [10, 0, 0, 1].into(), prefix: 32 });
        r.set(FieldId(2), TypedValue::IpV4 { addr: [10, 0, 0, 2].into(), prefix: 32 });
        in_tx.send(ChannelMessage::Record(r)).unwrap();
        in_tx.send(ChannelMessage::EndOfStream).unwrap();

        run_loop(&mut transport, &rule, 4);

        let delivered = out_rx
            .iter()
            .filter(|rx| matches!(rx.try_recv(), Ok(ChannelMessage::Record(_))))
            .count();
        assert_eq!(delivered, 1);
    }

    #[test]
    fn record_before_format_change_is_dropped_not_panicked() {
        let rule = parse_rule("").unwrap();
        let (in_tx, in_rx) = channel();
        let (out_tx, _out_rx) = channel();
        let mut transport = ChannelTransport::single_output(in_rx, out_tx);

        in_tx.send(ChannelMessage::Record(record())).unwrap();
        in_tx.send(ChannelMessage::EndOfStream).unwrap();

        run_loop(&mut transport, &rule, 1);
    }

    #[test]
    fn empty_rule_round_robins_across_outputs() {
        let rule = parse_rule("").unwrap();
        let schema = schema();
        let (in_tx, in_rx) = channel();
        let outputs: Vec<_> = (0..2).map(|_| channel()).collect();
        let (out_tx, out_rx): (Vec<_>, Vec<_>) = outputs.into_iter().unzip();
        let mut transport = ChannelTransport::new(in_rx, out_tx);

        in_tx.send(ChannelMessage::FormatChange(schema)).unwrap();
        in_tx.send(ChannelMessage::Record(record())).unwrap();
        in_tx.send(ChannelMessage::Record(record())).unwrap();
        in_tx.send(ChannelMessage::EndOfStream).unwrap();

        run_loop(&mut transport, &rule, 2);

        assert!(matches!(out_rx[0].try_recv(), Ok(ChannelMessage::Record(_))));
        assert!(matches!(out_rx[1].try_recv(), Ok(ChannelMessage::Record(_))));
    }
}
