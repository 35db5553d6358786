//! Roster entry model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

/// Kind of a published media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum TrackKind {
    Audio,
    Video,
    ScreenShare,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::ScreenShare => "screen_share",
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested or rendered pixel dimensions of a video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoDimension {
    pub width: u32,
    pub height: u32,
}

impl VideoDimension {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Whether a participant's tile is currently on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum VisibilityState {
    #[default]
    Unknown,
    Visible,
    Invisible,
}

/// Coarse connection quality as reported by the SFU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionQuality {
    #[default]
    Unknown,
    Poor,
    Good,
    Excellent,
}

/// Aggregate participant counts reported by the SFU, covering participants
/// that may not appear in the roster (e.g. anonymous viewers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ParticipantCounts {
    pub total: u32,
    pub anonymous: u32,
}

/// One participant-connection in the call.
///
/// Keyed by `session_id`, which is unique per connection: the same user
/// joining from two devices appears twice with distinct session ids.
#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    pub user_id: String,
    pub session_id: String,
    pub name: String,
    pub published_tracks: BTreeSet<TrackKind>,
    pub video_dimension: Option<VideoDimension>,
    pub screen_share_dimension: Option<VideoDimension>,
    pub video_visibility: VisibilityState,
    pub screen_share_visibility: VisibilityState,
    pub is_local: bool,
    pub is_pinned: bool,
    pub is_dominant_speaker: bool,
    pub connection_quality: ConnectionQuality,
    pub reaction: Option<String>,
    pub joined_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            name: String::new(),
            published_tracks: BTreeSet::new(),
            video_dimension: None,
            screen_share_dimension: None,
            video_visibility: VisibilityState::Unknown,
            screen_share_visibility: VisibilityState::Unknown,
            is_local: false,
            is_pinned: false,
            is_dominant_speaker: false,
            connection_quality: ConnectionQuality::Unknown,
            reaction: None,
            joined_at: None,
        }
    }

    pub fn publishes(&self, kind: TrackKind) -> bool {
        self.published_tracks.contains(&kind)
    }

    /// Shallow-merge a patch into this participant. Fields absent from the
    /// patch are retained.
    pub fn merge(&mut self, patch: ParticipantPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(tracks) = patch.published_tracks {
            self.published_tracks = tracks;
        }
        if let Some(dimension) = patch.video_dimension {
            self.video_dimension = dimension;
        }
        if let Some(dimension) = patch.screen_share_dimension {
            self.screen_share_dimension = dimension;
        }
        if let Some(visibility) = patch.video_visibility {
            self.video_visibility = visibility;
        }
        if let Some(visibility) = patch.screen_share_visibility {
            self.screen_share_visibility = visibility;
        }
        if let Some(pinned) = patch.is_pinned {
            self.is_pinned = pinned;
        }
        if let Some(quality) = patch.connection_quality {
            self.connection_quality = quality;
        }
        if let Some(reaction) = patch.reaction {
            self.reaction = reaction;
        }
        if let Some(joined_at) = patch.joined_at {
            self.joined_at = Some(joined_at);
        }
    }
}

/// Partial update for a roster entry, keyed by `session_id`.
///
/// The double `Option` on the dimension fields distinguishes "leave
/// unchanged" (`None`) from "clear" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct ParticipantPatch {
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub published_tracks: Option<BTreeSet<TrackKind>>,
    pub video_dimension: Option<Option<VideoDimension>>,
    pub screen_share_dimension: Option<Option<VideoDimension>>,
    pub video_visibility: Option<VisibilityState>,
    pub screen_share_visibility: Option<VisibilityState>,
    pub is_pinned: Option<bool>,
    pub connection_quality: Option<ConnectionQuality>,
    pub reaction: Option<Option<String>>,
    pub joined_at: Option<DateTime<Utc>>,
}

impl ParticipantPatch {
    /// Materialize a new participant from this patch, for the
    /// insert-or-update roster operation.
    pub fn into_participant(self, session_id: &str) -> Participant {
        let mut participant =
            Participant::new(self.user_id.clone().unwrap_or_default(), session_id);
        participant.merge(self);
        participant
    }
}
