use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::EventHub;
use crate::events::{CredentialStateEvent, Event, OperationalEvent};

use super::Credential;
use super::state::{CredentialId, CredentialState, Outcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    NoCandidateAvailable,
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::NoCandidateAvailable => write!(f, "no candidate credential available"),
        }
    }
}

impl std::error::Error for AcquireError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    Empty,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Empty => write!(f, "credential pool needs at least one key"),
        }
    }
}

impl std::error::Error for PoolError {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub credentials: usize,
    pub available: usize,
    pub cooling_down: usize,
    pub disabled: usize,
}

struct Slot {
    credential: Arc<Credential>,
    state: CredentialState,
}

struct PoolInner {
    slots: Vec<Slot>,
    cursor: usize,
}

/// Round-robin credential pool.
///
/// Cursor movement and state transitions happen under one mutex, so concurrent
/// requests never observe a half-applied rotation.
pub struct CredentialPool {
    inner: Mutex<PoolInner>,
    len: usize,
    events: EventHub,
}

impl CredentialPool {
    pub fn new<I, S>(keys: I, events: EventHub) -> Result<Self, PoolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slots: Vec<Slot> = keys
            .into_iter()
            .enumerate()
            .map(|(id, key)| Slot {
                credential: Arc::new(Credential::new(id, key)),
                state: CredentialState::Available,
            })
            .collect();
        if slots.is_empty() {
            return Err(PoolError::Empty);
        }
        let len = slots.len();
        Ok(Self {
            inner: Mutex::new(PoolInner { slots, cursor: 0 }),
            len,
            events,
        })
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Picks the next credential at or after the cursor that is neither in
    /// `excluded` nor disabled, and moves the cursor past it.
    pub async fn select_candidate(
        &self,
        excluded: &HashSet<CredentialId>,
    ) -> Result<Arc<Credential>, AcquireError> {
        let mut guard = self.inner.lock().await;
        let len = guard.slots.len();
        let start = guard.cursor;
        for step in 0..len {
            let idx = (start + step) % len;
            let slot = &guard.slots[idx];
            if slot.state.is_disabled() || excluded.contains(&slot.credential.id()) {
                continue;
            }
            let credential = slot.credential.clone();
            guard.cursor = (idx + 1) % len;
            return Ok(credential);
        }
        Err(AcquireError::NoCandidateAvailable)
    }

    pub async fn report_outcome(&self, credential_id: CredentialId, outcome: Outcome) {
        let event = {
            let mut guard = self.inner.lock().await;
            let Some(slot) = guard.slots.get_mut(credential_id) else {
                return;
            };
            let previous = slot.state;
            let next = match (previous, outcome) {
                // Disabled is terminal.
                (CredentialState::Disabled { .. }, _) => previous,
                (_, Outcome::Success) => CredentialState::Available,
                (_, Outcome::Recoverable(reason)) => CredentialState::CoolingDown { reason },
                (_, Outcome::Fatal(reason)) => CredentialState::Disabled { reason },
            };
            slot.state = next;
            transition_event(credential_id, previous, next)
        };
        if let Some(event) = event {
            self.events.emit(Event::Operational(event)).await;
        }
    }

    pub async fn state(&self, credential_id: CredentialId) -> Option<CredentialState> {
        let guard = self.inner.lock().await;
        guard.slots.get(credential_id).map(|slot| slot.state)
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let guard = self.inner.lock().await;
        let mut out = PoolSnapshot {
            credentials: guard.slots.len(),
            ..PoolSnapshot::default()
        };
        for slot in &guard.slots {
            match slot.state {
                CredentialState::Available => out.available += 1,
                CredentialState::CoolingDown { .. } => out.cooling_down += 1,
                CredentialState::Disabled { .. } => out.disabled += 1,
            }
        }
        out
    }
}

fn transition_event(
    credential_id: CredentialId,
    previous: CredentialState,
    next: CredentialState,
) -> Option<OperationalEvent> {
    if previous == next {
        return None;
    }
    let at = SystemTime::now();
    let event = match next {
        CredentialState::Available => OperationalEvent::Recovered(CredentialStateEvent {
            at,
            credential_id,
            reason: None,
        }),
        CredentialState::CoolingDown { reason } => {
            OperationalEvent::CoolingDown(CredentialStateEvent {
                at,
                credential_id,
                reason: Some(reason),
            })
        }
        CredentialState::Disabled { reason } => OperationalEvent::Disabled(CredentialStateEvent {
            at,
            credential_id,
            reason: Some(reason),
        }),
    };
    Some(event)
}
