//! Call event stream surfaced to UI and bindings layers.
//!
//! Events are a closed sum type dispatched to a flat list of registered
//! listeners, synchronously, after each committed mutation. Registration
//! returns an RAII [`EventSubscription`]; dropping it unregisters the
//! listener.

use crate::call::participant::ParticipantCounts;
use crate::call::state::CallingState;
use crate::signaling::SessionCloseCode;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Everything a consumer can observe about a call, as one closed enum.
#[derive(Debug, Clone)]
pub enum CallEvent {
    CallingStateChanged {
        previous: CallingState,
        current: CallingState,
    },
    /// A participant entered the roster.
    ParticipantJoined { session_id: String },
    ParticipantLeft { session_id: String },
    ParticipantUpdated { session_id: String },
    /// The whole roster was replaced by a (re)join snapshot.
    RosterReplaced,
    MetadataChanged,
    MembersUpdated,
    CountsChanged(ParticipantCounts),
    DominantSpeakerChanged { session_id: Option<String> },
    /// A join attempt failed and a retry is scheduled.
    Reconnecting { attempt: u32 },
    /// The automatic rejoin budget is exhausted; a manual `join()` is
    /// required.
    ReconnectingFailed,
    /// The server closed the session deliberately; the call is over for
    /// this participant.
    PolicyClosed { code: SessionCloseCode },
    /// Diagnostics: a subscription batch left the debouncer.
    SubscriptionsFlushed { requested: usize, delivered: bool },
}

type EventListener = Box<dyn Fn(&CallEvent) + Send + Sync>;

/// Listener registry shared by the controller, the state store and the
/// subscription debouncer.
#[derive(Default)]
pub struct CallEvents {
    listeners: DashMap<u64, EventListener>,
    next_id: AtomicU64,
}

impl CallEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener for all call events.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&CallEvent) + Send + Sync + 'static,
    ) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, Box::new(listener));
        EventSubscription {
            registry: Arc::downgrade(self),
            id,
        }
    }

    /// Invoke every registered listener with `event`, synchronously on the
    /// calling task.
    pub fn notify(&self, event: &CallEvent) {
        for entry in self.listeners.iter() {
            entry.value()(event);
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

/// Keeps an event listener registered while alive; unregisters on drop.
#[must_use = "dropping the subscription unregisters the listener"]
pub struct EventSubscription {
    registry: Weak<CallEvents>,
    id: u64,
}

impl EventSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.listeners.remove(&self.id);
        }
    }
}
