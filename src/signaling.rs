//! Wire contract between the call controller and the SFU signaling client.
//!
//! The actual WebSocket framing, protobuf codec and media negotiation live
//! outside this crate. The controller only depends on the two traits here:
//! a [`SfuConnector`] that opens one connection per join attempt, and the
//! [`SfuSignaling`] handle it yields, paired with a stream of inbound
//! [`SfuEvent`]s.

use crate::call::participant::{Participant, ParticipantCounts, TrackKind};
use crate::call::subscription::SubscriptionRequest;
use crate::call::{CallId, CallType};
use crate::call::error::SignalingError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Credentials for one SFU connection, minted by the call-management
/// backend during the join flow.
#[derive(Debug, Clone)]
pub struct SfuCredentials {
    pub url: String,
    pub token: String,
}

/// Join handshake sent once per established connection.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub call_id: CallId,
    pub call_type: CallType,
    /// Locally generated session id identifying this participant-connection.
    pub session_id: String,
    /// True when this join replaces a previous session of the same call.
    pub reconnect: bool,
    pub subscriptions: Vec<SubscriptionRequest>,
}

/// Server acknowledgment of a join request.
#[derive(Debug, Clone)]
pub struct JoinAck {
    pub participants: Vec<Participant>,
    pub counts: ParticipantCounts,
    pub started_at: Option<DateTime<Utc>>,
}

/// Close code attached to a terminated signaling connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCloseCode {
    /// Clean shutdown, either side.
    Normal,
    /// Server is restarting or draining.
    GoingAway,
    /// This participant was banned from the call.
    Banned,
    /// This participant was removed by a moderator.
    Kicked,
    /// Abnormal close with a wire-level code.
    Error(u16),
    /// The transport dropped without a close frame.
    TransportDropped,
}

impl SessionCloseCode {
    /// Whether the controller should attempt an automatic rejoin.
    pub fn should_rejoin(&self) -> bool {
        match self {
            Self::Normal | Self::GoingAway => false,
            Self::Banned | Self::Kicked => false,
            Self::Error(_) | Self::TransportDropped => true,
        }
    }

    /// Policy closes end the call for this participant; a manual `join()`
    /// is not expected to succeed either.
    pub fn is_policy(&self) -> bool {
        matches!(self, Self::Banned | Self::Kicked)
    }
}

/// Inbound events from one SFU connection.
#[derive(Debug, Clone)]
pub enum SfuEvent {
    /// The connection is established and authenticated; the join request
    /// may be sent.
    Ready,
    ParticipantJoined(Participant),
    ParticipantLeft { session_id: String },
    TrackPublished { session_id: String, kind: TrackKind },
    TrackUnpublished { session_id: String, kind: TrackKind },
    DominantSpeakerChanged { session_id: Option<String> },
    ParticipantCountsChanged(ParticipantCounts),
    Closed(SessionCloseCode),
}

/// Handle to one live signaling connection.
#[async_trait]
pub trait SfuSignaling: Send + Sync {
    /// Send the join handshake and wait for the server's acknowledgment.
    async fn send_join(&self, request: JoinRequest) -> Result<JoinAck, SignalingError>;

    /// Replace the server-side subscription set with the given batch.
    async fn update_subscriptions(
        &self,
        requests: Vec<SubscriptionRequest>,
    ) -> Result<(), SignalingError>;

    /// Close the connection. Must be idempotent and must not fail.
    async fn close(&self);
}

/// Opens one signaling connection per join attempt.
#[async_trait]
pub trait SfuConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &SfuCredentials,
    ) -> Result<(Arc<dyn SfuSignaling>, mpsc::Receiver<SfuEvent>), SignalingError>;
}
