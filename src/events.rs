//! Run event forwarding
//!
//! Every event a plugin produces, plus the phase boundaries the orchestrator
//! adds, is wrapped in a [`RunEventEnvelope`] and handed to an [`EventSink`].
//! Sinks must not block; slow consumers lose events rather than stall a run.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::stream::StreamEvent;

/// Event envelope with run metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEventEnvelope {
    pub run_id: String,
    /// Monotonic within one run, starting at 0
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub plugin: String,
    pub event: StreamEvent,
}

/// Receives forwarded run events
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &RunEventEnvelope);
}

/// Stamps envelopes for one run
pub struct EventEmitter {
    run_id: String,
    sequence: AtomicU64,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("run_id", &self.run_id)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl EventEmitter {
    pub fn new(run_id: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            run_id: run_id.into(),
            sequence: AtomicU64::new(0),
            sink,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn emit(&self, plugin: &str, event: StreamEvent) {
        let envelope = RunEventEnvelope {
            run_id: self.run_id.clone(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp_ms: now_ms(),
            plugin: plugin.to_string(),
            event,
        };
        self.sink.emit(&envelope);
    }

    /// Number of envelopes emitted so far
    pub fn emitted(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

/// Current wall-clock time in milliseconds
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Writes every event to the debug log
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &RunEventEnvelope) {
        debug!(
            run_id = %envelope.run_id,
            sequence = envelope.sequence,
            plugin = %envelope.plugin,
            event = ?envelope.event,
            "run event"
        );
    }
}

/// Collects events in memory
#[derive(Default)]
pub struct BufferingEventSink {
    events: RwLock<Vec<RunEventEnvelope>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEventEnvelope> {
        self.events.read().clone()
    }

    /// Events emitted for one plugin, in emission order
    pub fn events_for(&self, plugin: &str) -> Vec<StreamEvent> {
        self.events
            .read()
            .iter()
            .filter(|envelope| envelope.plugin == plugin)
            .map(|envelope| envelope.event.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &RunEventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

/// Forwards events into a bounded channel, dropping when the consumer lags
pub struct ChannelEventSink {
    tx: mpsc::Sender<RunEventEnvelope>,
    dropped: AtomicU64,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RunEventEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, envelope: &RunEventEnvelope) {
        match self.tx.try_send(envelope.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!(dropped, "event channel full, dropping run events");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Fans events out to any number of subscribers.
///
/// Overflow mode is on, so a lagging subscriber loses its oldest events.
pub struct BroadcastEventSink {
    tx: async_broadcast::Sender<RunEventEnvelope>,
    // Keeps the channel open while nobody is subscribed
    _keepalive: async_broadcast::InactiveReceiver<RunEventEnvelope>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity.max(1));
        tx.set_overflow(true);
        Self {
            tx,
            _keepalive: rx.deactivate(),
        }
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<RunEventEnvelope> {
        self.tx.new_receiver()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, envelope: &RunEventEnvelope) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        if let Err(e) = self.tx.try_broadcast(envelope.clone()) {
            debug!(error = %e, "broadcast of run event failed");
        }
    }
}
