//! Client-side orchestration for SFU-based multi-party calls.
//!
//! This crate owns the part of a calling client that has to be correct under
//! concurrency and partial failure: the join/leave/rejoin state machine,
//! generation-based cancellation of in-flight work, bounded retry with
//! backoff, and the debounced pipeline that keeps per-participant track
//! subscriptions in sync with what the UI actually needs.
//!
//! The media engine, the wire protocol client and the call-management REST
//! backend are external collaborators, injected through the traits in
//! [`signaling`], [`api`] and [`media`].

pub mod api;
pub mod call;
pub mod media;
pub mod signaling;

pub use call::controller::{Call, JoinOptions, LeaveOptions};
pub use call::error::{CallError, SignalingError};
pub use call::events::{CallEvent, EventSubscription};
pub use call::state::{CallState, CallingState};
pub use call::subscription::{DebounceUrgency, SubscriptionRequest};
pub use call::{CallId, CallType};
