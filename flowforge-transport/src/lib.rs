//! The inter-module record transport every driver runs its receive loop against.
//!
//! The real transport is an external collaborator this repository does not own: a typed,
//! schema-driven inter-process channel with blocking send/receive, format-change notification,
//! and end-of-stream signalling. [`Transport`] is the trait drivers program against;
//! [`ChannelTransport`] is the one concrete, in-process implementation this crate supplies, used
//! by integration tests and by any binary that wires two modules together in a single process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use flowforge_record::{Schema, TypedRecord};
use thiserror::Error;

/// Errors raised while sending or receiving on a [`Transport`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// `send` was called with an output index the transport wasn't built with.
    #[error("output index {index} is out of range (transport has {available} outputs)")]
    OutputOutOfRange {
        index: usize,
        available: usize,
    },
    /// The receiving end of the channel has been dropped.
    #[error("transport channel closed unexpectedly")]
    Disconnected,
}

/// The discriminated result of [`Transport::receive`]: a normal record, a schema change a
/// caller must re-resolve field ids against, or a clean end-of-stream.
#[derive(Debug)]
pub enum ReceiveEvent {
    /// A record validated against the transport's current schema.
    Record(TypedRecord),
    /// The upstream schema changed; cached [`flowforge_record::FieldId`]s must be re-resolved.
    FormatChange(Schema),
    /// The stream has ended cleanly; the receive loop should exit without error.
    EndOfStream,
}

/// Per-interface counters a transport exposes for telemetry, mirroring the external transport's
/// own `{received_bytes, received_records, missed_records}` trio.
#[derive(Default)]
pub struct TransportCounters {
    pub received_bytes: AtomicU64,
    pub received_records: AtomicU64,
    pub missed_records: AtomicU64,
}

impl TransportCounters {
    fn record_received(&self, approx_bytes: u64) {
        self.received_records.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(approx_bytes, Ordering::Relaxed);
    }
}

/// The subset of the external record transport every driver's receive loop needs: blocking
/// receive with format-change/end-of-stream discrimination, blocking send to a named output, and
/// schema negotiation.
pub trait Transport {
    /// Blocks until the next record, format change, or end-of-stream.
    fn receive(&mut self) -> ReceiveEvent;

    /// Blocks for at most `timeout` waiting for the next event, returning `None` if nothing
    /// arrived in time. Drivers that must act on elapsed wall-clock time while otherwise idle
    /// (the ClickHouse sink's delay-threshold flush) use this instead of [`Self::receive`].
    fn receive_timeout(&mut self, timeout: Duration) -> Option<ReceiveEvent>;

    /// Sends a record to `output` (the single output, for single-output modules, is index 0).
    fn send(&self, output: usize, record: TypedRecord) -> Result<(), TransportError>;

    /// Declares the minimum schema this module requires; a downstream format-change is
    /// signalled if the upstream schema changes relative to what was declared.
    fn set_required_schema(&mut self, schema: Schema);

    /// Per-interface counters for telemetry.
    fn counters(&self) -> &TransportCounters;
}

/// A message carried on a [`ChannelTransport`]'s underlying channel.
pub enum ChannelMessage {
    Record(TypedRecord),
    FormatChange(Schema),
    EndOfStream,
}

fn approx_record_bytes(_record: &TypedRecord) -> u64 {
    // A rough accounting good enough for telemetry, not a wire-accurate byte count: the real
    // transport's counters reflect its own serialization, which this in-process stand-in never
    // performs.
    std::mem::size_of::<TypedRecord>() as u64
}

/// An in-process, `std::sync::mpsc`-backed [`Transport`] used by driver integration tests and by
/// same-process module chaining. A real inter-process binding is supplied by the surrounding
/// deployment, exactly as the config loader and the ClickHouse wire client are.
pub struct ChannelTransport {
    inbox: Receiver<ChannelMessage>,
    outputs: Vec<Sender<ChannelMessage>>,
    counters: Arc<TransportCounters>,
    required_schema: Option<Schema>,
}

impl ChannelTransport {
    /// Builds a transport receiving from `inbox` and able to send to each of `outputs` in order.
    pub fn new(inbox: Receiver<ChannelMessage>, outputs: Vec<Sender<ChannelMessage>>) -> Self {
        ChannelTransport {
            inbox,
            outputs,
            counters: Arc::new(TransportCounters::default()),
            required_schema: None,
        }
    }

    /// A transport with a single output, the common case for dedup/list-detector drivers.
    pub fn single_output(inbox: Receiver<ChannelMessage>, output: Sender<ChannelMessage>) -> Self {
        Self::new(inbox, vec![output])
    }
}

impl Transport for ChannelTransport {
    fn receive(&mut self) -> ReceiveEvent {
        match self.inbox.recv() {
            Ok(ChannelMessage::Record(record)) => {
                self.counters.record_received(approx_record_bytes(&record));
                ReceiveEvent::Record(record)
            }
            Ok(ChannelMessage::FormatChange(schema)) => ReceiveEvent::FormatChange(schema),
            Ok(ChannelMessage::EndOfStream) | Err(RecvError) => ReceiveEvent::EndOfStream,
        }
    }

    fn receive_timeout(&mut self, timeout: Duration) -> Option<ReceiveEvent> {
        match self.inbox.recv_timeout(timeout) {
            Ok(ChannelMessage::Record(record)) => {
                self.counters.record_received(approx_record_bytes(&record));
                Some(ReceiveEvent::Record(record))
            }
            Ok(ChannelMessage::FormatChange(schema)) => Some(ReceiveEvent::FormatChange(schema)),
            Ok(ChannelMessage::EndOfStream) => Some(ReceiveEvent::EndOfStream),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(ReceiveEvent::EndOfStream),
        }
    }

    fn send(&self, output: usize, record: TypedRecord) -> Result<(), TransportError> {
        let sender = self.outputs.get(output).ok_or(TransportError::OutputOutOfRange {
            index: output,
            available: self.outputs.len(),
        })?;
        sender
            .send(ChannelMessage::Record(record))
            .map_err(|_| TransportError::Disconnected)
    }

    fn set_required_schema(&mut self, schema: Schema) {
        self.required_schema = Some(schema);
    }

    fn counters(&self) -> &TransportCounters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_record::FieldKind;
    use std::sync::mpsc::channel;

    #[test]
    fn receives_records_and_counts_them() {
        let (tx_in, rx_in) = channel();
        let (tx_out, _rx_out) = channel();
        let mut transport = ChannelTransport::single_output(rx_in, tx_out);

        let schema = Schema::new(vec![("x".to_string(), FieldKind::U8)]);
        tx_in
            .send(ChannelMessage::Record(TypedRecord::new(schema.len())))
            .unwrap();

        match transport.receive() {
            ReceiveEvent::Record(_) => {}
            _ => panic!("expected a record"),
        }
        assert_eq!(
            transport.counters().received_records.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn format_change_and_end_of_stream_are_discriminated() {
        let (tx_in, rx_in) = channel();
        let (tx_out, _rx_out) = channel();
        let mut transport = ChannelTransport::single_output(rx_in, tx_out);

        tx_in
            .send(ChannelMessage::FormatChange(Schema::default()))
            .unwrap();
        tx_in.send(ChannelMessage::EndOfStream).unwrap();

        assert!(matches!(transport.receive(), ReceiveEvent::FormatChange(_)));
        assert!(matches!(transport.receive(), ReceiveEvent::EndOfStream));
    }

    #[test]
    fn dropped_sender_reads_as_end_of_stream() {
        let (tx_in, rx_in) = channel();
        let (tx_out, _rx_out) = channel();
        let mut transport = ChannelTransport::single_output(rx_in, tx_out);
        drop(tx_in);
        assert!(matches!(transport.receive(), ReceiveEvent::EndOfStream));
    }

    #[test]
    fn send_to_out_of_range_output_errors() {
        let (_tx_in, rx_in) = channel();
        let (tx_out, _rx_out) = channel();
        let transport = ChannelTransport::single_output(rx_in, tx_out);
        let schema = Schema::new(vec![("x".to_string(), FieldKind::U8)]);
        let err = transport
            .send(5, TypedRecord::new(schema.len()))
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::OutputOutOfRange {
                index: 5,
                available: 1
            }
        );
    }

    #[test]
    fn receive_timeout_returns_none_when_idle() {
        let (_tx_in, rx_in) = channel();
        let (tx_out, _rx_out) = channel();
        let mut transport = ChannelTransport::single_output(rx_in, tx_out);
        assert!(transport.receive_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn receive_timeout_returns_event_when_available() {
        let (tx_in, rx_in) = channel();
        let (tx_out, _rx_out) = channel();
        let mut transport = ChannelTransport::single_output(rx_in, tx_out);
        tx_in.send(ChannelMessage::EndOfStream).unwrap();
        assert!(matches!(
            transport.receive_timeout(Duration::from_millis(10)),
            Some(ReceiveEvent::EndOfStream)
        ));
    }

    #[test]
    fn multi_output_sends_to_the_right_channel() {
        let (_tx_in, rx_in) = channel();
        let (tx_a, rx_a) = channel();
        let (tx_b, rx_b) = channel();
        let transport = ChannelTransport::new(rx_in, vec![tx_a, tx_b]);

        let schema = Schema::new(vec![("x".to_string(), FieldKind::U8)]);
        transport.send(1, TypedRecord::new(schema.len())).unwrap();

        assert!(rx_a.try_recv().is_err());
        assert!(matches!(rx_b.try_recv(), Ok(ChannelMessage::Record(_))));
    }
}
