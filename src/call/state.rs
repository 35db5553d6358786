//! Observable call state: lifecycle, roster, metadata.
//!
//! Pure data plus a mutation API — no I/O happens here. Every committed
//! mutation notifies the shared listener registry; derived views (local
//! participant, pinned, dominant speaker, ...) are computed on demand from
//! the current roster, never cached.

use crate::api::{CallMetadata, MemberInfo};
use crate::call::events::{CallEvent, CallEvents};
use crate::call::participant::{Participant, ParticipantCounts, ParticipantPatch, TrackKind};
use log::warn;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Lifecycle state of a call handle.
///
/// `Left` is terminal: a left handle can never be rejoined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CallingState {
    #[default]
    Idle,
    Ringing,
    Joining,
    Joined,
    Left,
    Reconnecting,
    ReconnectingFailed,
    Offline,
    /// Reserved for SFU-initiated session migration; no transition in this
    /// crate produces it.
    Migrating,
}

impl CallingState {
    pub fn is_joined(&self) -> bool {
        matches!(self, Self::Joined)
    }

    pub fn is_left(&self) -> bool {
        matches!(self, Self::Left)
    }
}

/// Ordering applied to roster snapshots before they are handed to
/// consumers. Pure and side-effect free; swappable at runtime.
pub type ParticipantComparator = Arc<dyn Fn(&Participant, &Participant) -> Ordering + Send + Sync>;

/// Default roster order: pinned, then dominant speaker, then screen
/// sharers, then video publishers, then join time, then user id.
pub fn default_comparator() -> ParticipantComparator {
    Arc::new(|a, b| {
        b.is_pinned
            .cmp(&a.is_pinned)
            .then(b.is_dominant_speaker.cmp(&a.is_dominant_speaker))
            .then(b.publishes(TrackKind::ScreenShare).cmp(&a.publishes(TrackKind::ScreenShare)))
            .then(b.publishes(TrackKind::Video).cmp(&a.publishes(TrackKind::Video)))
            .then(a.joined_at.cmp(&b.joined_at))
            .then(a.user_id.cmp(&b.user_id))
    })
}

struct StateInner {
    calling_state: CallingState,
    roster: HashMap<String, Participant>,
    metadata: CallMetadata,
    members: Vec<MemberInfo>,
    counts: ParticipantCounts,
    comparator: ParticipantComparator,
}

/// The authoritative snapshot of one call.
pub struct CallState {
    inner: Mutex<StateInner>,
    events: Arc<CallEvents>,
}

impl CallState {
    pub fn new(events: Arc<CallEvents>) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                calling_state: CallingState::Idle,
                roster: HashMap::new(),
                metadata: CallMetadata::default(),
                members: Vec::new(),
                counts: ParticipantCounts::default(),
                comparator: default_comparator(),
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        // A poisoned lock means a listener-free mutation panicked; the data
        // itself is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn calling_state(&self) -> CallingState {
        self.lock().calling_state
    }

    /// Transition the lifecycle state, returning the previous one.
    pub fn set_calling_state(&self, state: CallingState) -> CallingState {
        let previous = {
            let mut inner = self.lock();
            std::mem::replace(&mut inner.calling_state, state)
        };
        if previous != state {
            self.events.notify(&CallEvent::CallingStateChanged {
                previous,
                current: state,
            });
        }
        previous
    }

    // ---- roster ----

    /// Replace the entire roster from a (re)join snapshot. The entry whose
    /// session id equals `local_session_id` is flagged as the local
    /// participant.
    pub fn replace_roster(&self, participants: Vec<Participant>, local_session_id: &str) {
        let mut found_local = false;
        {
            let mut inner = self.lock();
            inner.roster.clear();
            for mut participant in participants {
                participant.is_local = participant.session_id == local_session_id;
                found_local |= participant.is_local;
                inner
                    .roster
                    .insert(participant.session_id.clone(), participant);
            }
        }
        if !found_local {
            warn!(target: "Call/State", "join snapshot did not contain the local session {local_session_id}");
        }
        self.events.notify(&CallEvent::RosterReplaced);
    }

    pub fn upsert_participant(&self, participant: Participant) {
        let session_id = participant.session_id.clone();
        let inserted = {
            let mut inner = self.lock();
            inner
                .roster
                .insert(session_id.clone(), participant)
                .is_none()
        };
        let event = if inserted {
            CallEvent::ParticipantJoined { session_id }
        } else {
            CallEvent::ParticipantUpdated { session_id }
        };
        self.events.notify(&event);
    }

    /// Merge a partial update into the matching participant. Unknown
    /// session ids are a no-op.
    pub fn patch_participant(&self, session_id: &str, patch: ParticipantPatch) -> bool {
        let patched = {
            let mut inner = self.lock();
            match inner.roster.get_mut(session_id) {
                Some(participant) => {
                    participant.merge(patch);
                    true
                }
                None => false,
            }
        };
        if patched {
            self.events.notify(&CallEvent::ParticipantUpdated {
                session_id: session_id.to_string(),
            });
        }
        patched
    }

    /// Insert-or-update variant of [`patch_participant`]: appends a new
    /// participant materialized from the patch when the id is unknown.
    ///
    /// [`patch_participant`]: Self::patch_participant
    pub fn patch_or_insert_participant(&self, session_id: &str, patch: ParticipantPatch) {
        let inserted = {
            let mut inner = self.lock();
            match inner.roster.get_mut(session_id) {
                Some(participant) => {
                    participant.merge(patch);
                    false
                }
                None => {
                    inner
                        .roster
                        .insert(session_id.to_string(), patch.into_participant(session_id));
                    true
                }
            }
        };
        let event = if inserted {
            CallEvent::ParticipantJoined {
                session_id: session_id.to_string(),
            }
        } else {
            CallEvent::ParticipantUpdated {
                session_id: session_id.to_string(),
            }
        };
        self.events.notify(&event);
    }

    pub fn remove_participant(&self, session_id: &str) -> Option<Participant> {
        let removed = self.lock().roster.remove(session_id);
        if removed.is_some() {
            self.events.notify(&CallEvent::ParticipantLeft {
                session_id: session_id.to_string(),
            });
        }
        removed
    }

    /// Move the dominant-speaker flag to the given session, clearing it
    /// everywhere else. `None` clears it entirely.
    pub fn set_dominant_speaker(&self, session_id: Option<&str>) {
        {
            let mut inner = self.lock();
            for participant in inner.roster.values_mut() {
                participant.is_dominant_speaker =
                    Some(participant.session_id.as_str()) == session_id;
            }
        }
        self.events.notify(&CallEvent::DominantSpeakerChanged {
            session_id: session_id.map(str::to_string),
        });
    }

    // ---- metadata / counts / members ----

    pub fn metadata(&self) -> CallMetadata {
        self.lock().metadata.clone()
    }

    pub fn set_metadata(&self, metadata: CallMetadata) {
        self.lock().metadata = metadata;
        self.events.notify(&CallEvent::MetadataChanged);
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.lock().members.clone()
    }

    pub fn set_members(&self, members: Vec<MemberInfo>) {
        self.lock().members = members;
        self.events.notify(&CallEvent::MembersUpdated);
    }

    pub fn counts(&self) -> ParticipantCounts {
        self.lock().counts
    }

    pub fn set_counts(&self, counts: ParticipantCounts) {
        let changed = {
            let mut inner = self.lock();
            std::mem::replace(&mut inner.counts, counts) != counts
        };
        if changed {
            self.events.notify(&CallEvent::CountsChanged(counts));
        }
    }

    pub fn set_sort_comparator(&self, comparator: ParticipantComparator) {
        self.lock().comparator = comparator;
    }

    // ---- derived views (computed, never cached) ----

    /// All participants, ordered by the active comparator.
    pub fn participants(&self) -> Vec<Participant> {
        let inner = self.lock();
        let mut snapshot: Vec<Participant> = inner.roster.values().cloned().collect();
        let comparator = inner.comparator.clone();
        drop(inner);
        snapshot.sort_by(|a, b| comparator(a, b));
        snapshot
    }

    pub fn participant(&self, session_id: &str) -> Option<Participant> {
        self.lock().roster.get(session_id).cloned()
    }

    pub fn local_participant(&self) -> Option<Participant> {
        self.lock().roster.values().find(|p| p.is_local).cloned()
    }

    pub fn remote_participants(&self) -> Vec<Participant> {
        self.participants()
            .into_iter()
            .filter(|p| !p.is_local)
            .collect()
    }

    pub fn pinned_participants(&self) -> Vec<Participant> {
        self.participants()
            .into_iter()
            .filter(|p| p.is_pinned)
            .collect()
    }

    pub fn dominant_speaker(&self) -> Option<Participant> {
        self.lock()
            .roster
            .values()
            .find(|p| p.is_dominant_speaker)
            .cloned()
    }

    pub fn has_ongoing_screen_share(&self) -> bool {
        self.lock()
            .roster
            .values()
            .any(|p| p.publishes(TrackKind::ScreenShare))
    }
}
