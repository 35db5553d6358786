//! The call controller: join/leave/rejoin orchestration.
//!
//! One [`Call`] is one call handle. It guarantees at most one active
//! signaling session, cancels in-flight work when the user leaves
//! mid-setup, and retries transient join failures with capped exponential
//! backoff.
//!
//! # Cancellation
//!
//! Every `leave()` and every fresh `join()` advances the generation
//! counter. Asynchronous work captures an [`AttemptToken`] when it starts
//! and re-checks it at every suspension point; a stale continuation tears
//! down anything it half-built and exits without touching state.
//! Generation writes happen under the lifecycle lock, so a token check
//! performed under that lock cannot be invalidated before the guarded
//! mutation commits. `leave()` never waits for superseded work — it only
//! guarantees that work becomes a no-op once it observes the new
//! generation.

use crate::api::{CallApi, RejectReason};
use crate::call::config::CallConfig;
use crate::call::error::{CallError, SignalingError};
use crate::call::events::{CallEvent, CallEvents, EventSubscription};
use crate::call::participant::{ParticipantPatch, TrackKind};
use crate::call::session::SignalingSession;
use crate::call::state::{CallState, CallingState};
use crate::call::subscription::{DebounceUrgency, SubscriptionDebouncer, SubscriptionRequest};
use crate::call::{CallId, CallType};
use crate::media::MediaPublisher;
use crate::signaling::{JoinRequest, SessionCloseCode, SfuConnector, SfuEvent};
use log::{info, warn};
use rand::RngCore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Options for [`Call::join`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JoinOptions {
    /// Ask the backend to ring the other members.
    pub ring: bool,
    /// Override the configured retry budget for this join.
    pub max_attempts: Option<u32>,
}

/// Options for [`Call::leave`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LeaveOptions {
    /// Also reject the call on the backend (incoming ringing calls).
    pub reject: Option<RejectReason>,
}

/// Cancellation token for one attempt generation.
///
/// Same semantics as comparing the raw generation counter, but typed and
/// threaded explicitly through the join/rejoin call chain: a token is
/// cancelled once any later `leave()` or join advances the counter.
#[derive(Clone)]
struct AttemptToken {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl AttemptToken {
    fn is_cancelled(&self) -> bool {
        self.current.load(Ordering::SeqCst) != self.generation
    }

    fn check(&self) -> Result<(), CallError> {
        if self.is_cancelled() {
            Err(CallError::Cancelled)
        } else {
            Ok(())
        }
    }
}

type TeardownFn = Box<dyn FnOnce() -> Result<(), anyhow::Error> + Send>;

/// Everything that must be swapped atomically with respect to lifecycle
/// transitions. Never held across a network await.
struct Lifecycle {
    active_session: Option<Arc<SignalingSession>>,
    teardown: Vec<TeardownFn>,
}

/// A call handle.
///
/// Created once per call; `leave()` is terminal. Construction requires a
/// running tokio runtime (the subscription flush loop starts immediately).
pub struct Call {
    id: CallId,
    call_type: CallType,
    config: CallConfig,
    api: Arc<dyn CallApi>,
    connector: Arc<dyn SfuConnector>,
    media: Option<Arc<dyn MediaPublisher>>,
    state: Arc<CallState>,
    events: Arc<CallEvents>,
    debouncer: Arc<SubscriptionDebouncer>,
    /// Monotonic attempt generation. Written only under `lifecycle`.
    generation: Arc<AtomicU64>,
    reconnect_attempts: AtomicU32,
    join_in_progress: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    shutdown: Notify,
    /// Locally generated id identifying this participant-connection.
    local_session_id: String,
}

impl Call {
    pub fn new(
        id: CallId,
        call_type: CallType,
        config: CallConfig,
        api: Arc<dyn CallApi>,
        connector: Arc<dyn SfuConnector>,
        media: Option<Arc<dyn MediaPublisher>>,
    ) -> Arc<Self> {
        let events = CallEvents::new();
        let state = Arc::new(CallState::new(events.clone()));
        let debouncer = SubscriptionDebouncer::new(config.debounce, events.clone());
        debouncer.spawn_flush_loop();

        let mut session_bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut session_bytes);
        let local_session_id: String =
            session_bytes.iter().map(|b| format!("{b:02x}")).collect();

        Arc::new(Self {
            id,
            call_type,
            config,
            api,
            connector,
            media,
            state,
            events,
            debouncer,
            generation: Arc::new(AtomicU64::new(0)),
            reconnect_attempts: AtomicU32::new(0),
            join_in_progress: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle {
                active_session: None,
                teardown: Vec::new(),
            }),
            shutdown: Notify::new(),
            local_session_id,
        })
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn local_session_id(&self) -> &str {
        &self.local_session_id
    }

    /// Retry attempts consumed since the last successful join.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Register a listener for call events. Dropping the returned
    /// subscription unregisters it.
    pub fn on(&self, listener: impl Fn(&CallEvent) + Send + Sync + 'static) -> EventSubscription {
        self.events.subscribe(listener)
    }

    /// Submit desired subscription changes; they reach the server after the
    /// urgency class's debounce window.
    pub fn update_subscriptions(
        &self,
        urgency: DebounceUrgency,
        requests: Vec<SubscriptionRequest>,
    ) {
        self.debouncer.submit(urgency, requests);
    }

    /// Register a hook to run on leave. Hooks run in reverse registration
    /// order; failures are logged, never propagated.
    pub async fn register_teardown(
        &self,
        hook: impl FnOnce() -> Result<(), anyhow::Error> + Send + 'static,
    ) {
        self.lifecycle.lock().await.teardown.push(Box::new(hook));
    }

    /// Advance the generation and mint the token for the new attempt.
    /// Callers must hold the lifecycle lock.
    fn next_token(&self) -> AttemptToken {
        AttemptToken {
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            current: self.generation.clone(),
        }
    }

    /// Token observing the current generation without advancing it.
    fn current_token(&self) -> AttemptToken {
        AttemptToken {
            generation: self.generation.load(Ordering::SeqCst),
            current: self.generation.clone(),
        }
    }

    // ---- ringing flows ----

    /// Create the call on the backend and ring the other members.
    pub async fn ring(&self) -> Result<(), CallError> {
        {
            let _lifecycle = self.lifecycle.lock().await;
            if self.state.calling_state() != CallingState::Idle {
                return Err(CallError::IllegalState("ring is only valid before joining"));
            }
            self.state.set_calling_state(CallingState::Ringing);
        }

        match self.api.get_or_create(&self.id, &self.call_type, true).await {
            Ok(bootstrap) => {
                let _lifecycle = self.lifecycle.lock().await;
                if self.state.calling_state() == CallingState::Ringing {
                    self.state.set_metadata(bootstrap.metadata);
                    self.state.set_members(bootstrap.members);
                }
                Ok(())
            }
            Err(err) => {
                let _lifecycle = self.lifecycle.lock().await;
                if self.state.calling_state() == CallingState::Ringing {
                    self.state.set_calling_state(CallingState::Idle);
                }
                Err(SignalingError::Rest(err.to_string()).into())
            }
        }
    }

    /// Mark an incoming call as ringing locally (driven by the
    /// application's push/notification layer).
    pub async fn mark_ringing(&self) -> Result<(), CallError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state.calling_state() != CallingState::Idle {
            return Err(CallError::IllegalState("call is not idle"));
        }
        self.state.set_calling_state(CallingState::Ringing);
        Ok(())
    }

    /// Accept an incoming ringing call on the backend. Follow with
    /// [`join`] to actually enter it.
    ///
    /// [`join`]: Self::join
    pub async fn accept(&self) -> Result<(), CallError> {
        if self.state.calling_state() != CallingState::Ringing {
            return Err(CallError::IllegalState("accept is only valid while ringing"));
        }
        self.api
            .accept(&self.id)
            .await
            .map_err(|err| SignalingError::Rest(err.to_string()))?;
        Ok(())
    }

    /// Reject an incoming ringing call and leave the handle.
    pub async fn reject(self: &Arc<Self>, reason: Option<RejectReason>) -> Result<(), CallError> {
        if self.state.calling_state() != CallingState::Ringing {
            return Err(CallError::IllegalState("reject is only valid while ringing"));
        }
        self.leave(LeaveOptions {
            reject: Some(reason.unwrap_or(RejectReason::Decline)),
        })
        .await
    }

    // ---- join ----

    pub async fn join(self: &Arc<Self>, options: JoinOptions) -> Result<(), CallError> {
        if self.join_in_progress.swap(true, Ordering::SeqCst) {
            return Err(CallError::IllegalState("join already in progress"));
        }
        let _joining = scopeguard::guard((), |_| {
            self.join_in_progress.store(false, Ordering::Relaxed);
        });

        let (token, previous_state) = {
            let _lifecycle = self.lifecycle.lock().await;
            let current = self.state.calling_state();
            match current {
                CallingState::Joined => return Err(CallError::IllegalState("already joined")),
                CallingState::Joining => {
                    return Err(CallError::IllegalState("join already in progress"));
                }
                CallingState::Left => {
                    return Err(CallError::IllegalState("call has already been left"));
                }
                _ => {}
            }
            // A fresh join starts with a clean retry budget.
            self.reconnect_attempts.store(0, Ordering::SeqCst);
            let token = self.next_token();
            self.state.set_calling_state(CallingState::Joining);
            (token, current)
        };
        info!(target: "Call", "joining call {} (generation {})", self.id, token.generation);

        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.max_reconnect_attempts)
            .max(1);

        match self
            .run_join_attempts(&token, options.ring, max_attempts, false)
            .await
        {
            Ok(()) => {
                info!(target: "Call", "joined call {}", self.id);
                Ok(())
            }
            Err(CallError::Cancelled) => Err(CallError::Cancelled),
            Err(err) => {
                // The attempt is over; give the handle back the state it had
                // before, unless something newer owns it now.
                let _lifecycle = self.lifecycle.lock().await;
                if !token.is_cancelled() && self.state.calling_state() == CallingState::Joining {
                    self.state.set_calling_state(previous_state);
                }
                Err(err)
            }
        }
    }

    /// Run the join procedure, retrying transient signaling failures up to
    /// `max_attempts` under the same token.
    async fn run_join_attempts(
        self: &Arc<Self>,
        token: &AttemptToken,
        ring: bool,
        max_attempts: u32,
        reconnect: bool,
    ) -> Result<(), CallError> {
        loop {
            token.check()?;
            if reconnect && self.state.calling_state() == CallingState::Offline {
                // Connectivity is gone; the online transition restarts the
                // rejoin with a fresh generation.
                return Err(CallError::Cancelled);
            }

            let source = match self.join_once(token, ring, reconnect).await {
                Ok(()) => return Ok(()),
                Err(CallError::Signaling(source)) => source,
                Err(other) => return Err(other),
            };

            let attempts = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempts >= max_attempts {
                warn!(target: "Call", "join failed after {attempts} attempt(s): {source}");
                return Err(CallError::JoinFailed { attempts, source });
            }
            let delay = self.config.backoff_delay(attempts);
            warn!(target: "Call", "join attempt {attempts} failed: {source}; retrying in {delay:?}");
            self.events
                .notify(&CallEvent::Reconnecting { attempt: attempts });
            sleep(delay).await;
        }
    }

    /// One pass of the join procedure: REST handshake, SFU connect, join
    /// request, commit.
    async fn join_once(
        self: &Arc<Self>,
        token: &AttemptToken,
        ring: bool,
        reconnect: bool,
    ) -> Result<(), CallError> {
        token.check()?;

        let bootstrap = self
            .api
            .get_or_create(&self.id, &self.call_type, ring)
            .await
            .map_err(|err| SignalingError::Rest(err.to_string()))?;
        token.check()?;

        let session = Arc::new(
            SignalingSession::establish(
                self.connector.as_ref(),
                &bootstrap.credentials,
                self.config.ready_timeout,
            )
            .await?,
        );
        if token.is_cancelled() {
            session.close().await;
            return Err(CallError::Cancelled);
        }

        let request = JoinRequest {
            call_id: self.id.clone(),
            call_type: self.call_type,
            session_id: self.local_session_id.clone(),
            reconnect,
            subscriptions: Vec::new(),
        };
        let ack = match session
            .send_join_request(request, self.config.join_ack_timeout)
            .await
        {
            Ok(ack) => ack,
            Err(err) => {
                session.close().await;
                return Err(err.into());
            }
        };

        // Commit. Everything below runs under the lifecycle lock so that a
        // racing leave() cannot slip between the token check and the state
        // mutations.
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if token.is_cancelled() || self.state.calling_state() == CallingState::Offline {
                drop(lifecycle);
                session.close().await;
                return Err(CallError::Cancelled);
            }

            if let Some(old) = lifecycle.active_session.replace(session.clone()) {
                // Rejoin paths close the old session before getting here;
                // closing again is idempotent.
                tokio::spawn(async move { old.close().await });
            }

            let mut metadata = bootstrap.metadata;
            if metadata.started_at.is_none() {
                metadata.started_at = ack.started_at;
            }
            self.state.set_metadata(metadata);
            self.state.set_members(bootstrap.members);
            self.state
                .replace_roster(ack.participants, &self.local_session_id);
            self.state.set_counts(ack.counts);
            self.reconnect_attempts.store(0, Ordering::SeqCst);
            self.state.set_calling_state(CallingState::Joined);

            self.debouncer.bind(session.clone());
            let pump = self.spawn_event_pump(session, token.clone());
            lifecycle.teardown.push(Box::new(move || {
                pump.abort();
                Ok(())
            }));
        }
        Ok(())
    }

    // ---- inbound events & rejoin ----

    fn spawn_event_pump(
        self: &Arc<Self>,
        session: Arc<SignalingSession>,
        token: AttemptToken,
    ) -> JoinHandle<()> {
        let call = self.clone();
        tokio::spawn(async move {
            let Some(mut events) = session.take_events().await else {
                warn!(target: "Call", "session event stream was already consumed");
                return;
            };
            loop {
                tokio::select! {
                    biased;
                    _ = call.shutdown.notified() => return,
                    event = events.recv() => {
                        let Some(event) = event else {
                            // Stream ended without a close frame.
                            if !session.is_closed() {
                                call.handle_unexpected_close(
                                    &token,
                                    SessionCloseCode::TransportDropped,
                                )
                                .await;
                            }
                            return;
                        };
                        if token.is_cancelled() {
                            return;
                        }
                        match event {
                            SfuEvent::Closed(code) => {
                                if !session.is_closed() {
                                    call.handle_unexpected_close(&token, code).await;
                                }
                                return;
                            }
                            other => call.apply_sfu_event(&token, other).await,
                        }
                    }
                }
            }
        })
    }

    async fn apply_sfu_event(&self, token: &AttemptToken, event: SfuEvent) {
        let _lifecycle = self.lifecycle.lock().await;
        if token.is_cancelled() {
            return;
        }
        match event {
            SfuEvent::Ready => {}
            SfuEvent::ParticipantJoined(mut participant) => {
                participant.is_local = participant.session_id == self.local_session_id;
                self.state.upsert_participant(participant);
            }
            SfuEvent::ParticipantLeft { session_id } => {
                self.state.remove_participant(&session_id);
            }
            SfuEvent::TrackPublished { session_id, kind } => {
                self.set_track_published(&session_id, kind, true);
            }
            SfuEvent::TrackUnpublished { session_id, kind } => {
                self.set_track_published(&session_id, kind, false);
            }
            SfuEvent::DominantSpeakerChanged { session_id } => {
                self.state.set_dominant_speaker(session_id.as_deref());
            }
            SfuEvent::ParticipantCountsChanged(counts) => {
                self.state.set_counts(counts);
            }
            // Terminal; handled by the pump itself.
            SfuEvent::Closed(_) => {}
        }
    }

    fn set_track_published(&self, session_id: &str, kind: TrackKind, published: bool) {
        let Some(participant) = self.state.participant(session_id) else {
            return;
        };
        let mut tracks = participant.published_tracks;
        if published {
            tracks.insert(kind);
        } else {
            tracks.remove(&kind);
        }
        self.state.patch_participant(
            session_id,
            ParticipantPatch {
                published_tracks: Some(tracks),
                ..Default::default()
            },
        );
    }

    async fn handle_unexpected_close(
        self: &Arc<Self>,
        token: &AttemptToken,
        code: SessionCloseCode,
    ) {
        if token.is_cancelled() {
            return;
        }
        warn!(target: "Call", "signaling session closed unexpectedly: {code:?}");

        if code.is_policy() {
            self.events.notify(&CallEvent::PolicyClosed { code });
            self.terminate(None).await;
            return;
        }
        if !code.should_rejoin() {
            info!(target: "Call", "server ended the session; leaving call {}", self.id);
            self.terminate(None).await;
            return;
        }
        self.rejoin(token).await;
    }

    /// Tear down the dead session and run the join procedure again,
    /// restoring the previously published tracks on success.
    async fn rejoin(self: &Arc<Self>, from: &AttemptToken) {
        let (token, old_session) = {
            let mut lifecycle = self.lifecycle.lock().await;
            if from.is_cancelled() {
                return;
            }
            match self.state.calling_state() {
                CallingState::Joined | CallingState::Offline | CallingState::Reconnecting => {}
                _ => return,
            }
            let token = self.next_token();
            self.state.set_calling_state(CallingState::Reconnecting);
            (token, lifecycle.active_session.take())
        };

        // Snapshot what we were publishing before the teardown; media
        // capture itself persists across rejoins.
        let published: Vec<TrackKind> = self
            .state
            .local_participant()
            .map(|p| p.published_tracks.iter().copied().collect())
            .unwrap_or_default();

        self.debouncer.unbind();
        if let Some(old) = old_session {
            old.close().await;
        }

        info!(target: "Call/Rejoin", "rejoining call {} (generation {})", self.id, token.generation);
        match self
            .run_join_attempts(&token, false, self.config.max_reconnect_attempts, true)
            .await
        {
            Ok(()) => {
                self.republish(&published).await;
                info!(target: "Call/Rejoin", "rejoined call {}", self.id);
            }
            Err(CallError::Cancelled) => {}
            Err(err) => {
                warn!(target: "Call/Rejoin", "rejoin failed: {err}");
                let _lifecycle = self.lifecycle.lock().await;
                if !token.is_cancelled()
                    && self.state.calling_state() == CallingState::Reconnecting
                {
                    self.state
                        .set_calling_state(CallingState::ReconnectingFailed);
                    self.events.notify(&CallEvent::ReconnectingFailed);
                }
            }
        }
    }

    async fn republish(&self, kinds: &[TrackKind]) {
        let Some(media) = &self.media else {
            return;
        };
        for kind in kinds {
            // Best effort: a failed republish must not undo the rejoin.
            if let Err(err) = media.publish_track(*kind).await {
                warn!(target: "Call/Rejoin", "failed to republish {kind} track: {err:#}");
            }
        }
    }

    // ---- network reachability ----

    /// Feed network reachability changes from the platform's connectivity
    /// monitor.
    pub async fn set_network_available(self: &Arc<Self>, online: bool) {
        if online {
            let token = {
                let _lifecycle = self.lifecycle.lock().await;
                if self.state.calling_state() != CallingState::Offline {
                    return;
                }
                // Connectivity loss is not the session's fault; rejoin with
                // a fresh budget.
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.current_token()
            };
            info!(target: "Call", "network restored; rejoining call {}", self.id);
            self.rejoin(&token).await;
        } else {
            let session = {
                let mut lifecycle = self.lifecycle.lock().await;
                match self.state.calling_state() {
                    CallingState::Joined | CallingState::Reconnecting => {}
                    _ => return,
                }
                self.state.set_calling_state(CallingState::Offline);
                lifecycle.active_session.take()
            };
            info!(target: "Call", "network lost; parking call {}", self.id);
            self.debouncer.unbind();
            if let Some(session) = session {
                session.close().await;
            }
        }
    }

    // ---- leave ----

    pub async fn leave(self: &Arc<Self>, options: LeaveOptions) -> Result<(), CallError> {
        if self.terminate(options.reject).await {
            Ok(())
        } else {
            Err(CallError::IllegalState("call has already been left"))
        }
    }

    /// Converge to `Left`. Returns false when the call was already left.
    async fn terminate(self: &Arc<Self>, reject: Option<RejectReason>) -> bool {
        let (session, teardown, was_ringing) = {
            let mut lifecycle = self.lifecycle.lock().await;
            let current = self.state.calling_state();
            if current.is_left() {
                return false;
            }
            // Advancing the generation is what actually cancels in-flight
            // join and retry work; the rest is cleanup.
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.state.set_calling_state(CallingState::Left);
            (
                lifecycle.active_session.take(),
                std::mem::take(&mut lifecycle.teardown),
                current == CallingState::Ringing,
            )
        };
        info!(target: "Call", "leaving call {}", self.id);

        if was_ringing && let Some(reason) = reject {
            if let Err(err) = self.api.reject(&self.id, Some(reason)).await {
                warn!(target: "Call", "failed to reject call {}: {err:#}", self.id);
            }
        }
        if let Some(session) = session {
            session.close().await;
        }
        self.debouncer.unbind();
        self.debouncer.stop();
        for hook in teardown.into_iter().rev() {
            if let Err(err) = hook() {
                warn!(target: "Call", "teardown hook failed: {err:#}");
            }
        }
        true
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
        self.debouncer.stop();
    }
}
