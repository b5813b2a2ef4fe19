//! Fan-out of parsed events to registered handlers.

use crate::event::{EventKind, ProtocolEvent, parse_envelope};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{debug, error, warn};

/// A synchronous event handler. Slow work belongs in a task the handler spawns.
pub type Handler = Box<dyn Fn(&ProtocolEvent) -> anyhow::Result<()> + Send + Sync>;

/// Result of delivering one event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Routes each event to every handler registered for its kind.
///
/// A handler that errors or panics is logged and skipped; its siblings still
/// receive the event.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<EventKind, Vec<Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&mut self, kind: EventKind, handler: F) -> &mut Self
    where
        F: Fn(&ProtocolEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
        self
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    pub fn dispatch(&self, event: &ProtocolEvent) -> Delivery {
        let kind = event.kind();
        let Some(handlers) = self.handlers.get(&kind) else {
            debug!(?kind, "No handler registered for event.");
            return Delivery::default();
        };

        let mut delivery = Delivery::default();
        for (index, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivery.delivered += 1,
                Ok(Err(e)) => {
                    delivery.failed += 1;
                    error!(?kind, handler = index, error = ?e, "Event handler failed.");
                }
                Err(_) => {
                    delivery.failed += 1;
                    error!(?kind, handler = index, "Event handler panicked.");
                }
            }
        }
        delivery
    }

    /// Parses and dispatches a raw envelope. Malformed envelopes are logged and dropped.
    pub fn dispatch_envelope(&self, raw: &Value) -> Option<ProtocolEvent> {
        match parse_envelope(raw) {
            Ok(event) => {
                self.dispatch(&event);
                Some(event)
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed envelope.");
                None
            }
        }
    }
}
