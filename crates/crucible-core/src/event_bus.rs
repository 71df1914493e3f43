use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crucible_observability::TraceLog;
use crucible_types::{TraceEvent, TraceKind};

#[derive(Default)]
struct Journal {
    next_seq: u64,
    events: Vec<TraceEvent>,
}

/// Append-only trace bus. Events get a sequence number, are recorded in the
/// in-memory journal and the optional trace log, then fanned out to live
/// subscribers, all under one lock so every view sees the same order.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TraceEvent>,
    journal: Arc<Mutex<Journal>>,
    sink: Option<Arc<TraceLog>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self {
            tx,
            journal: Arc::new(Mutex::new(Journal::default())),
            sink: None,
        }
    }

    pub fn with_trace_log(log: Arc<TraceLog>) -> Self {
        let mut bus = Self::new();
        bus.sink = Some(log);
        bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, kind: TraceKind, payload: Value) -> TraceEvent {
        self.publish(TraceEvent::new(kind, payload))
    }

    pub fn publish(&self, mut event: TraceEvent) -> TraceEvent {
        let mut journal = self.journal.lock();
        journal.next_seq += 1;
        event.seq = journal.next_seq;
        if let Some(sink) = &self.sink {
            if let Err(err) = sink.append(&event) {
                tracing::warn!(
                    path = %sink.path().display(),
                    event_type = %event.event_type,
                    error = %err,
                    "trace log append failed"
                );
            }
        }
        journal.events.push(event.clone());
        let _ = self.tx.send(event.clone());
        event
    }

    pub fn history(&self) -> Vec<TraceEvent> {
        self.journal.lock().events.clone()
    }

    pub fn events_of(&self, kind: TraceKind) -> Vec<TraceEvent> {
        self.journal
            .lock()
            .events
            .iter()
            .filter(|event| event.is(kind))
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
