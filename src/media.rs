//! Contract with the local media capture/publish layer.
//!
//! Capture, encoding and the actual WebRTC publish path live in the media
//! engine. The controller only calls into it on rejoin, to restore the
//! tracks that were published before the old session died — capture itself
//! persists across rejoins.

use crate::call::participant::TrackKind;
use async_trait::async_trait;

#[async_trait]
pub trait MediaPublisher: Send + Sync {
    /// (Re-)publish the local track of the given kind to the active session.
    async fn publish_track(&self, kind: TrackKind) -> Result<(), anyhow::Error>;

    /// Stop publishing the local track of the given kind.
    async fn stop_publish(&self, kind: TrackKind) -> Result<(), anyhow::Error>;
}
