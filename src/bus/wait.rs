//! Observer registry behind the bus `wait` primitive.
//!
//! Waiters park on a oneshot; every successful append publishes an event tag
//! and wakes exactly the observers the event is relevant to. Publishing
//! happens after channel locks are released so a woken waiter can re-read
//! counts immediately.

use crate::AgentId;

use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Lower bound on the wait timeout.
pub const WAIT_TIMEOUT_MIN_MS: u64 = 1_000;
/// Upper bound on the wait timeout.
pub const WAIT_TIMEOUT_MAX_MS: u64 = 60_000;
/// Timeout applied when the caller doesn't pass one.
pub const WAIT_TIMEOUT_DEFAULT_MS: u64 = 30_000;

/// Clamp a requested wait timeout into the service bounds.
pub fn clamp_timeout_ms(requested: Option<u64>) -> u64 {
    requested
        .unwrap_or(WAIT_TIMEOUT_DEFAULT_MS)
        .clamp(WAIT_TIMEOUT_MIN_MS, WAIT_TIMEOUT_MAX_MS)
}

/// Result of a bus `wait` call.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct WaitOutcome {
    pub timed_out: bool,
    pub dissolved: bool,
    /// Unread group-chat messages for the caller.
    pub group_chat: usize,
    /// Unread DMs summed over every channel the caller participates in.
    pub dms: usize,
    /// Unread lead-channel messages. Always 0 for non-leads.
    pub lead_chat: usize,
}

impl WaitOutcome {
    pub fn has_unread(&self) -> bool {
        self.group_chat > 0 || self.dms > 0 || self.lead_chat > 0
    }

    pub(crate) fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Self::default()
        }
    }

    pub(crate) fn dissolved() -> Self {
        Self {
            dissolved: true,
            ..Self::default()
        }
    }
}

/// What a parked waiter is woken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// A relevant message landed; recompute counts.
    Delivery,
    /// The waiter's team was dissolved.
    Dissolved,
}

/// Event published after a successful append or a dissolution.
#[derive(Debug, Clone)]
pub(crate) enum BusEvent {
    /// A group-chat post on the given team, authored by `from`.
    Group { team: String, from: AgentId },
    /// A DM delivered to `to`.
    Dm { to: AgentId },
    /// A lead-channel post authored by `from`.
    Lead { from: AgentId },
    /// `agent` lost its team.
    Dissolved { agent: AgentId },
}

struct Observer {
    team: String,
    agent: AgentId,
    is_lead: bool,
    tx: oneshot::Sender<Wake>,
}

impl Observer {
    fn wants(&self, event: &BusEvent) -> Option<Wake> {
        match event {
            BusEvent::Group { team, from } => {
                (*team == self.team && *from != self.agent).then_some(Wake::Delivery)
            }
            BusEvent::Dm { to } => (*to == self.agent).then_some(Wake::Delivery),
            BusEvent::Lead { from } => {
                (self.is_lead && *from != self.agent).then_some(Wake::Delivery)
            }
            BusEvent::Dissolved { agent } => (*agent == self.agent).then_some(Wake::Dissolved),
        }
    }
}

/// Registry of parked waiters. Observers are single-shot: a wake removes
/// them, and the wait loop re-registers if it needs to keep blocking.
#[derive(Default)]
pub(crate) struct ObserverRegistry {
    observers: Mutex<Vec<Observer>>,
}

impl ObserverRegistry {
    pub(crate) fn register(
        &self,
        team: &str,
        agent: &str,
        is_lead: bool,
    ) -> oneshot::Receiver<Wake> {
        let (tx, rx) = oneshot::channel();
        let mut observers = self.observers.lock().expect("observer lock poisoned");
        observers.push(Observer {
            team: team.to_string(),
            agent: agent.to_string(),
            is_lead,
            tx,
        });
        rx
    }

    /// Wake every observer the event is relevant to, and drop observers whose
    /// waiter has already gone away.
    pub(crate) fn publish(&self, event: &BusEvent) {
        let mut observers = self.observers.lock().expect("observer lock poisoned");
        let mut kept = Vec::with_capacity(observers.len());
        for observer in observers.drain(..) {
            if observer.tx.is_closed() {
                continue;
            }
            match observer.wants(event) {
                Some(wake) => {
                    let _ = observer.tx.send(wake);
                }
                None => kept.push(observer),
            }
        }
        *observers = kept;
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.observers.lock().expect("observer lock poisoned").len()
    }
}
