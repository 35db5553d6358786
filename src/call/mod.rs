//! Call lifecycle orchestration.
//!
//! # Architecture
//!
//! - [`Call`]: the controller. Drives join/leave/rejoin, owns cancellation,
//!   retry/backoff and network-reachability reactions.
//! - [`CallState`]: the authoritative, observable snapshot of one call —
//!   calling state, roster, metadata, counts. Pure data, no I/O.
//! - [`SignalingSession`]: one SFU connection attempt. Disposable, never
//!   reused across attempts.
//! - [`SubscriptionDebouncer`]: coalesces track-subscription changes and
//!   flushes them to the active session.
//!
//! Cancellation is cooperative and generation-based: every `leave()` and
//! every fresh `join()` advances a monotonic generation counter, and all
//! asynchronous continuations re-check the counter at their suspension
//! points before touching state.

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod participant;
pub mod session;
pub mod state;
pub mod subscription;

pub use config::{CallConfig, DebounceWindows};
pub use controller::{Call, JoinOptions, LeaveOptions};
pub use error::{CallError, SignalingError};
pub use events::{CallEvent, CallEvents, EventSubscription};
pub use participant::{
    ConnectionQuality, Participant, ParticipantCounts, ParticipantPatch, TrackKind, VideoDimension,
    VisibilityState,
};
pub use session::SignalingSession;
pub use state::{CallState, CallingState};
pub use subscription::{DebounceUrgency, SubscriptionDebouncer, SubscriptionRequest};

use serde::Serialize;

/// Unique identifier of a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Call type, as understood by the call-management backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CallType {
    #[default]
    Default,
    Livestream,
    AudioRoom,
    Development,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Livestream => "livestream",
            Self::AudioRoom => "audio_room",
            Self::Development => "development",
        }
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
