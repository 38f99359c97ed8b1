use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};

use super::types::Event;

/// Receives events emitted on an [`EventHub`], off the emitting task.
pub trait EventSink: Send + Sync {
    fn deliver<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    fn accepts(&self, _event: &Event) -> bool {
        true
    }
}

/// Fan-out point for pool and upstream events.
///
/// Subscribers get every event through a broadcast channel (lagging receivers
/// lose the oldest ones). Sinks see each event in sink registration order.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<Event>,
    sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            sinks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().await.push(sink);
    }

    pub async fn sink_count(&self) -> usize {
        self.sinks.read().await.len()
    }

    pub async fn emit(&self, event: Event) {
        let targets: Vec<Arc<dyn EventSink>> = self
            .sinks
            .read()
            .await
            .iter()
            .filter(|sink| sink.accepts(&event))
            .cloned()
            .collect();

        if self.tx.receiver_count() > 0 {
            let _ = self.tx.send(event.clone());
        }
        if targets.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for sink in targets {
                sink.deliver(&event).await;
            }
        });
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::events::types::{CredentialStateEvent, OperationalEvent};
    use crate::{CredentialId, UnavailableReason};

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<(&'static str, CredentialId)>>>,
        only_disabled: bool,
    }

    impl EventSink for Recorder {
        fn deliver<'a>(
            &'a self,
            event: &'a Event,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async move {
                if let Event::Operational(
                    OperationalEvent::CoolingDown(e) | OperationalEvent::Disabled(e),
                ) = event
                {
                    self.log.lock().unwrap().push((self.name, e.credential_id));
                }
            })
        }

        fn accepts(&self, event: &Event) -> bool {
            !self.only_disabled
                || matches!(event, Event::Operational(OperationalEvent::Disabled(_)))
        }
    }

    fn state_event(id: CredentialId) -> CredentialStateEvent {
        CredentialStateEvent {
            at: SystemTime::now(),
            credential_id: id,
            reason: Some(UnavailableReason::RateLimit),
        }
    }

    async fn settle(log: &Arc<Mutex<Vec<(&'static str, CredentialId)>>>, len: usize) {
        for _ in 0..50 {
            if log.lock().unwrap().len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn sinks_see_events_in_registration_order_and_filter() {
        let hub = EventHub::new(8);
        let log = Arc::new(Mutex::new(Vec::new()));
        hub.add_sink(Arc::new(Recorder {
            name: "all",
            log: log.clone(),
            only_disabled: false,
        }))
        .await;
        hub.add_sink(Arc::new(Recorder {
            name: "disabled",
            log: log.clone(),
            only_disabled: true,
        }))
        .await;
        assert_eq!(hub.sink_count().await, 2);

        hub.emit(Event::Operational(OperationalEvent::CoolingDown(
            state_event(1),
        )))
        .await;
        settle(&log, 1).await;
        hub.emit(Event::Operational(OperationalEvent::Disabled(state_event(2))))
            .await;
        settle(&log, 3).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![("all", 1), ("all", 2), ("disabled", 2)]
        );
    }

    #[tokio::test]
    async fn emit_without_listeners_is_a_no_op() {
        let hub = EventHub::new(0);
        assert_eq!(hub.subscriber_count(), 0);
        hub.emit(Event::Operational(OperationalEvent::Recovered(state_event(0))))
            .await;

        let mut rx = hub.subscribe();
        hub.emit(Event::Operational(OperationalEvent::Recovered(state_event(3))))
            .await;
        assert!(matches!(
            rx.recv().await,
            Ok(Event::Operational(OperationalEvent::Recovered(ref e))) if e.credential_id == 3
        ));
    }
}
