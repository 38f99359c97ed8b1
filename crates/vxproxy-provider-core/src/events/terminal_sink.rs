use std::future::Future;
use std::pin::Pin;

use super::{Event, EventSink, OperationalEvent};

/// Writes each event as one JSON line through `tracing` under the
/// `vxproxy::events` target. Disabled credentials are logged at `warn`.
#[derive(Debug, Default)]
pub struct TerminalEventSink {
    skip_upstream: bool,
}

impl TerminalEventSink {
    /// Only pool and project events; per-attempt events are already logged by the engine.
    pub fn operational_only() -> Self {
        Self {
            skip_upstream: true,
        }
    }
}

impl EventSink for TerminalEventSink {
    fn deliver<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let line = match serde_json::to_string(event) {
                Ok(line) => line,
                Err(err) => {
                    tracing::warn!(
                        target: "vxproxy::events",
                        error = %err,
                        "event_serialize_error"
                    );
                    return;
                }
            };
            match event {
                Event::Operational(OperationalEvent::Disabled(_)) => {
                    tracing::warn!(target: "vxproxy::events", "{line}")
                }
                _ => tracing::info!(target: "vxproxy::events", "{line}"),
            }
        })
    }

    fn accepts(&self, event: &Event) -> bool {
        !(self.skip_upstream && matches!(event, Event::Upstream(_)))
    }
}
