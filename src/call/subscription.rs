//! Debounced track-subscription updates.
//!
//! UI elements report what they need (visible tiles, requested resolutions)
//! far more often than the server should hear about it — a grid resize
//! touches every tile at once. The debouncer buffers desired changes,
//! coalesces repeated updates for the same `(session, track)` key to the
//! latest value, and flushes the whole batch to the active session after a
//! quiescence window picked by the submitter's urgency class.

use crate::call::config::DebounceWindows;
use crate::call::events::{CallEvent, CallEvents};
use crate::call::participant::{TrackKind, VideoDimension};
use crate::call::session::SignalingSession;
use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Desired subscription for one remote track. A `None` dimension means
/// "unsubscribe from the video track"; audio always flows implicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRequest {
    pub session_id: String,
    pub track_kind: TrackKind,
    pub dimension: Option<VideoDimension>,
}

/// How soon a submitted change must reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceUrgency {
    /// Flush on the next tick, no quiescence window.
    Immediate,
    Fast,
    Medium,
    Slow,
}

struct Pending {
    requests: HashMap<(String, TrackKind), SubscriptionRequest>,
    /// Earliest deadline requested by any pending update. A later, slower
    /// submission never delays an armed flush.
    deadline: Option<Instant>,
    session: Option<Arc<SignalingSession>>,
}

pub struct SubscriptionDebouncer {
    pending: Mutex<Pending>,
    windows: DebounceWindows,
    events: Arc<CallEvents>,
    rearm: Notify,
    shutdown: Notify,
    stopped: std::sync::atomic::AtomicBool,
}

impl SubscriptionDebouncer {
    pub fn new(windows: DebounceWindows, events: Arc<CallEvents>) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Pending {
                requests: HashMap::new(),
                deadline: None,
                session: None,
            }),
            windows,
            events,
            rearm: Notify::new(),
            shutdown: Notify::new(),
            stopped: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Buffer subscription changes. Repeated requests for the same
    /// `(session_id, track_kind)` key supersede older pending ones.
    pub fn submit(&self, urgency: DebounceUrgency, requests: Vec<SubscriptionRequest>) {
        if requests.is_empty() {
            return;
        }
        let deadline = Instant::now() + self.windows.window(urgency);
        {
            let mut pending = self.lock();
            for request in requests {
                let key = (request.session_id.clone(), request.track_kind);
                pending.requests.insert(key, request);
            }
            pending.deadline = Some(match pending.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            });
        }
        self.rearm.notify_one();
    }

    /// Bind the flush target. Called when a join attempt commits; pending
    /// requests submitted while unbound have already been dropped.
    pub fn bind(&self, session: Arc<SignalingSession>) {
        self.lock().session = Some(session);
    }

    /// Drop the flush target and everything buffered for it. Subscriptions
    /// are derived from state, never replayed into a new session.
    pub fn unbind(&self) {
        let mut pending = self.lock();
        pending.session = None;
        pending.requests.clear();
        pending.deadline = None;
    }

    /// Stop the flush loop. Terminal; used on leave.
    pub fn stop(&self) {
        self.stopped
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Run the flush loop until [`stop`] is called.
    ///
    /// [`stop`]: Self::stop
    pub fn spawn_flush_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let debouncer = self.clone();
        tokio::spawn(async move {
            loop {
                if debouncer.stopped.load(std::sync::atomic::Ordering::SeqCst) {
                    return;
                }
                let deadline = debouncer.lock().deadline;
                tokio::select! {
                    biased;
                    _ = debouncer.shutdown.notified() => {
                        debug!(target: "Call/Subscriptions", "flush loop shutting down");
                        return;
                    }
                    _ = debouncer.rearm.notified() => {
                        // Deadline may have moved; re-evaluate.
                    }
                    _ = async {
                        match deadline {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        debouncer.flush().await;
                    }
                }
            }
        })
    }

    async fn flush(&self) {
        let (batch, session) = {
            let mut pending = self.lock();
            pending.deadline = None;
            let batch: Vec<SubscriptionRequest> =
                pending.requests.drain().map(|(_, request)| request).collect();
            (batch, pending.session.clone())
        };
        if batch.is_empty() {
            return;
        }

        let Some(session) = session else {
            // Without a live session the batch is meaningless; a new session
            // gets a fresh state-derived batch instead of a replay.
            debug!(
                target: "Call/Subscriptions",
                "dropping {} pending request(s): no active session",
                batch.len()
            );
            return;
        };

        let requested = batch.len();
        let delivered = match session.update_subscriptions(batch).await {
            Ok(()) => true,
            Err(err) => {
                warn!(target: "Call/Subscriptions", "subscription flush failed: {err}");
                false
            }
        };
        self.events.notify(&CallEvent::SubscriptionsFlushed {
            requested,
            delivered,
        });
    }
}
