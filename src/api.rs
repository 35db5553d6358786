//! Contract with the call-management REST backend.
//!
//! Creating, accepting and rejecting calls happens over plain HTTPS against
//! a coordinator service, not over the SFU connection. The controller only
//! needs the three operations of [`CallApi`]; the HTTP client behind it is
//! supplied by the embedding application.

use crate::call::{CallId, CallType};
use crate::signaling::SfuCredentials;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Server-side call metadata, replaced as a unit from REST responses and
/// join acknowledgments.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallMetadata {
    pub created_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub recording: bool,
    pub backstage: bool,
    /// Application-defined payload, passed through untouched.
    pub custom: serde_json::Value,
}

/// A call member known to the backend (invited or joined).
#[derive(Debug, Clone, Serialize)]
pub struct MemberInfo {
    pub user_id: String,
    pub name: Option<String>,
}

/// Payload of a successful `get_or_create` handshake.
#[derive(Debug, Clone)]
pub struct JoinBootstrap {
    pub metadata: CallMetadata,
    pub members: Vec<MemberInfo>,
    pub credentials: SfuCredentials,
}

/// Reason attached to a call rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Decline,
    Cancel,
    Timeout,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decline => "decline",
            Self::Cancel => "cancel",
            Self::Timeout => "timeout",
        }
    }
}

/// Call-management operations used by the join and ringing flows.
#[async_trait]
pub trait CallApi: Send + Sync {
    /// Fetch or create the call and mint SFU credentials for one join
    /// attempt. `ring` asks the backend to notify the other members.
    async fn get_or_create(
        &self,
        call_id: &CallId,
        call_type: &CallType,
        ring: bool,
    ) -> Result<JoinBootstrap, anyhow::Error>;

    /// Accept an incoming ringing call.
    async fn accept(&self, call_id: &CallId) -> Result<(), anyhow::Error>;

    /// Reject an incoming ringing call.
    async fn reject(
        &self,
        call_id: &CallId,
        reason: Option<RejectReason>,
    ) -> Result<(), anyhow::Error>;
}
