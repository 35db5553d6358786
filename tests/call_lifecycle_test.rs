//! End-to-end lifecycle tests over mock backend and SFU collaborators.

use async_trait::async_trait;
use callcore::api::{CallApi, CallMetadata, JoinBootstrap, MemberInfo, RejectReason};
use callcore::call::config::CallConfig;
use callcore::call::participant::{Participant, ParticipantCounts, ParticipantPatch, TrackKind};
use callcore::media::MediaPublisher;
use callcore::signaling::{
    JoinAck, JoinRequest, SessionCloseCode, SfuConnector, SfuCredentials, SfuEvent, SfuSignaling,
};
use callcore::{
    Call, CallError, CallEvent, CallId, CallType, CallingState, JoinOptions, LeaveOptions,
    SignalingError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::sleep;

// ---- mock collaborators ----

#[derive(Default)]
struct TestApi {
    get_or_create_calls: AtomicUsize,
    accept_calls: AtomicUsize,
    reject_calls: AtomicUsize,
    fail_get_or_create: AtomicBool,
    /// When set, get_or_create parks until the gate is released.
    gate: Mutex<Option<Arc<Notify>>>,
    last_ring: AtomicBool,
}

#[async_trait]
impl CallApi for TestApi {
    async fn get_or_create(
        &self,
        _call_id: &CallId,
        _call_type: &CallType,
        ring: bool,
    ) -> Result<JoinBootstrap, anyhow::Error> {
        self.get_or_create_calls.fetch_add(1, Ordering::SeqCst);
        self.last_ring.store(ring, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_get_or_create.load(Ordering::SeqCst) {
            anyhow::bail!("backend unavailable");
        }
        Ok(JoinBootstrap {
            metadata: CallMetadata::default(),
            members: vec![MemberInfo {
                user_id: "bob".to_string(),
                name: Some("Bob".to_string()),
            }],
            credentials: SfuCredentials {
                url: "sfu.test".to_string(),
                token: "jwt".to_string(),
            },
        })
    }

    async fn accept(&self, _call_id: &CallId) -> Result<(), anyhow::Error> {
        self.accept_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(
        &self,
        _call_id: &CallId,
        _reason: Option<RejectReason>,
    ) -> Result<(), anyhow::Error> {
        self.reject_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct TestSignaling {
    join_calls: AtomicUsize,
    close_calls: AtomicUsize,
    last_join_request: Mutex<Option<JoinRequest>>,
    batches: Mutex<Vec<Vec<callcore::SubscriptionRequest>>>,
}

#[async_trait]
impl SfuSignaling for TestSignaling {
    async fn send_join(&self, request: JoinRequest) -> Result<JoinAck, SignalingError> {
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        let mut local = Participant::new("local-user", request.session_id.clone());
        local.name = "Local".to_string();
        *self.last_join_request.lock().unwrap() = Some(request);
        let remote = Participant::new("bob", "remote-session");
        Ok(JoinAck {
            participants: vec![local, remote],
            counts: ParticipantCounts {
                total: 2,
                anonymous: 0,
            },
            started_at: None,
        })
    }

    async fn update_subscriptions(
        &self,
        requests: Vec<callcore::SubscriptionRequest>,
    ) -> Result<(), SignalingError> {
        self.batches.lock().unwrap().push(requests);
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out one fresh signaling handle + event stream per connect.
#[derive(Default)]
struct TestConnector {
    connect_calls: AtomicUsize,
    fail_connect: AtomicBool,
    /// When set, connect parks until the gate is released (after counting).
    gate: Mutex<Option<Arc<Notify>>>,
    /// Every handle created, oldest first, with its event sender.
    sessions: Mutex<Vec<(Arc<TestSignaling>, mpsc::Sender<SfuEvent>)>>,
}

impl TestConnector {
    fn session(&self, index: usize) -> (Arc<TestSignaling>, mpsc::Sender<SfuEvent>) {
        self.sessions.lock().unwrap()[index].clone()
    }

    fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl SfuConnector for TestConnector {
    async fn connect(
        &self,
        _credentials: &SfuCredentials,
    ) -> Result<(Arc<dyn SfuSignaling>, mpsc::Receiver<SfuEvent>), SignalingError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SignalingError::Connect("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::channel(32);
        tx.try_send(SfuEvent::Ready).expect("channel has capacity");
        let signaling = Arc::new(TestSignaling::default());
        self.sessions
            .lock()
            .unwrap()
            .push((signaling.clone(), tx));
        Ok((signaling, rx))
    }
}

#[derive(Default)]
struct TestMedia {
    published: Mutex<Vec<TrackKind>>,
}

#[async_trait]
impl MediaPublisher for TestMedia {
    async fn publish_track(&self, kind: TrackKind) -> Result<(), anyhow::Error> {
        self.published.lock().unwrap().push(kind);
        Ok(())
    }

    async fn stop_publish(&self, _kind: TrackKind) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

struct Harness {
    api: Arc<TestApi>,
    connector: Arc<TestConnector>,
    media: Arc<TestMedia>,
    call: Arc<Call>,
    events: Arc<Mutex<Vec<CallEvent>>>,
    _subscription: callcore::EventSubscription,
}

fn harness(config: CallConfig) -> Harness {
    let api = Arc::new(TestApi::default());
    let connector = Arc::new(TestConnector::default());
    let media = Arc::new(TestMedia::default());
    let call = Call::new(
        CallId::new("test-call"),
        CallType::Default,
        config,
        api.clone(),
        connector.clone(),
        Some(media.clone()),
    );
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = events.clone();
    let subscription = call.on(move |event| {
        events_clone.lock().unwrap().push(event.clone());
    });
    Harness {
        api,
        connector,
        media,
        call,
        events,
        _subscription: subscription,
    }
}

fn fast_config() -> CallConfig {
    CallConfig {
        backoff_base: Duration::from_millis(20),
        backoff_cap: Duration::from_millis(100),
        ready_timeout: Duration::from_millis(500),
        join_ack_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

// ---- tests ----

#[tokio::test]
async fn join_applies_snapshot_and_reaches_joined() {
    let h = harness(fast_config());

    h.call.join(JoinOptions::default()).await.unwrap();

    assert_eq!(h.call.state().calling_state(), CallingState::Joined);
    assert_eq!(h.connector.connect_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.api.get_or_create_calls.load(Ordering::SeqCst), 1);

    let local = h.call.state().local_participant().expect("local participant");
    assert_eq!(local.session_id, h.call.local_session_id());
    assert!(local.is_local);
    assert_eq!(h.call.state().remote_participants().len(), 1);
    assert_eq!(h.call.state().counts().total, 2);
    assert_eq!(h.call.reconnect_attempts(), 0);

    let states: Vec<CallingState> = h
        .events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            CallEvent::CallingStateChanged { current, .. } => Some(*current),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![CallingState::Joining, CallingState::Joined]);
}

#[tokio::test]
async fn join_while_joined_is_illegal() {
    let h = harness(fast_config());
    h.call.join(JoinOptions::default()).await.unwrap();

    let result = h.call.join(JoinOptions::default()).await;
    assert!(matches!(result, Err(CallError::IllegalState(_))));
    // No second connection was opened.
    assert_eq!(h.connector.connect_calls.load(Ordering::SeqCst), 1);
}

/// Leaving while a join attempt is still in its pre-network
/// setup phase must prevent the session-establishing call entirely.
#[tokio::test]
async fn leave_during_rest_handshake_never_connects() {
    let h = harness(fast_config());
    let gate = Arc::new(Notify::new());
    *h.api.gate.lock().unwrap() = Some(gate.clone());

    let call = h.call.clone();
    let join_task = tokio::spawn(async move { call.join(JoinOptions::default()).await });
    sleep(Duration::from_millis(50)).await; // join is parked inside the REST call

    h.call.leave(LeaveOptions::default()).await.unwrap();
    assert_eq!(h.call.state().calling_state(), CallingState::Left);

    gate.notify_one();
    let result = join_task.await.unwrap();
    assert!(matches!(result, Err(CallError::Cancelled)));
    assert_eq!(h.connector.connect_calls.load(Ordering::SeqCst), 0);
}

/// A superseded join never applies roster or metadata, and
/// the session it half-built is torn down.
#[tokio::test]
async fn superseded_join_does_not_touch_state() {
    let h = harness(fast_config());
    let gate = Arc::new(Notify::new());
    *h.connector.gate.lock().unwrap() = Some(gate.clone());

    let call = h.call.clone();
    let join_task = tokio::spawn(async move { call.join(JoinOptions::default()).await });
    sleep(Duration::from_millis(50)).await; // parked inside connect()

    // A second caller racing the first observes IllegalState.
    let second = h.call.join(JoinOptions::default()).await;
    assert!(matches!(second, Err(CallError::IllegalState(_))));

    h.call.leave(LeaveOptions::default()).await.unwrap();
    gate.notify_one();

    let result = join_task.await.unwrap();
    assert!(matches!(result, Err(CallError::Cancelled)));
    assert_eq!(h.call.state().calling_state(), CallingState::Left);
    assert!(h.call.state().participants().is_empty());
    assert!(h.call.state().local_participant().is_none());

    // The connection that finished establishing after leave was closed and
    // never sent a join request.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(h.connector.session_count(), 1);
    let (signaling, _) = h.connector.session(0);
    assert_eq!(signaling.close_calls.load(Ordering::SeqCst), 1);
    assert_eq!(signaling.join_calls.load(Ordering::SeqCst), 0);
}

/// Once leave() resolves, no further join attempts happen.
#[tokio::test]
async fn leave_during_backoff_stops_retries() {
    let mut config = fast_config();
    config.backoff_base = Duration::from_millis(300);
    config.backoff_cap = Duration::from_secs(2);
    let h = harness(config);
    h.api.fail_get_or_create.store(true, Ordering::SeqCst);

    let call = h.call.clone();
    let join_task =
        tokio::spawn(async move { call.join(JoinOptions { ring: false, max_attempts: Some(8) }).await });

    // Attempt 1 fails instantly, attempt 2 fires at ~300ms and fails, then
    // the controller sleeps 600ms. Leave lands inside that second sleep.
    sleep(Duration::from_millis(450)).await;
    assert_eq!(h.api.get_or_create_calls.load(Ordering::SeqCst), 2);
    h.call.leave(LeaveOptions::default()).await.unwrap();

    let result = join_task.await.unwrap();
    assert!(matches!(result, Err(CallError::Cancelled)));
    assert_eq!(h.call.state().calling_state(), CallingState::Left);

    // No attempt happens after leave resolved.
    sleep(Duration::from_millis(800)).await;
    assert_eq!(h.api.get_or_create_calls.load(Ordering::SeqCst), 2);
}

/// `join(max_attempts = 10)` against an always-failing
/// handshake, interrupted by leave after the first attempt, performs
/// exactly one attempt and settles as failed.
#[tokio::test]
async fn failing_handshake_interrupted_by_leave_performs_one_attempt() {
    let mut config = fast_config();
    config.backoff_base = Duration::from_millis(300);
    let h = harness(config);
    h.api.fail_get_or_create.store(true, Ordering::SeqCst);

    let call = h.call.clone();
    let join_task = tokio::spawn(async move {
        call.join(JoinOptions { ring: false, max_attempts: Some(10) }).await
    });

    sleep(Duration::from_millis(100)).await; // inside the first backoff sleep
    h.call.leave(LeaveOptions::default()).await.unwrap();

    let result = join_task.await.unwrap();
    assert!(result.is_err(), "superseded join must not settle successfully");
    assert_eq!(h.api.get_or_create_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.call.state().calling_state(), CallingState::Left);

    sleep(Duration::from_millis(600)).await;
    assert_eq!(h.api.get_or_create_calls.load(Ordering::SeqCst), 1);
}

/// leave() when already Left fails and never tears the
/// session down twice.
#[tokio::test]
async fn leave_twice_fails_and_closes_once() {
    let h = harness(fast_config());
    h.call.join(JoinOptions::default()).await.unwrap();

    h.call.leave(LeaveOptions::default()).await.unwrap();
    let second = h.call.leave(LeaveOptions::default()).await;
    assert!(matches!(second, Err(CallError::IllegalState(_))));

    let (signaling, _) = h.connector.session(0);
    assert_eq!(signaling.close_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhausted_retries_restore_previous_state() {
    let h = harness(fast_config());
    h.api.fail_get_or_create.store(true, Ordering::SeqCst);

    let result = h
        .call
        .join(JoinOptions { ring: false, max_attempts: Some(3) })
        .await;

    match result {
        Err(CallError::JoinFailed { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected JoinFailed, got {other:?}"),
    }
    assert_eq!(h.api.get_or_create_calls.load(Ordering::SeqCst), 3);
    // The handle is recoverable: back to Idle, not Left.
    assert_eq!(h.call.state().calling_state(), CallingState::Idle);

    // And a later join works once the backend recovers.
    h.api.fail_get_or_create.store(false, Ordering::SeqCst);
    h.call.join(JoinOptions::default()).await.unwrap();
    assert_eq!(h.call.state().calling_state(), CallingState::Joined);
}

#[tokio::test]
async fn unexpected_close_rejoins_and_republishes_tracks() {
    let h = harness(fast_config());
    h.call.join(JoinOptions::default()).await.unwrap();

    // Simulate an active local publish before the session dies.
    h.call.state().patch_participant(
        h.call.local_session_id(),
        ParticipantPatch {
            published_tracks: Some([TrackKind::Audio, TrackKind::Video].into()),
            ..Default::default()
        },
    );

    let (first_signaling, first_events) = h.connector.session(0);
    first_events
        .send(SfuEvent::Closed(SessionCloseCode::Error(1006)))
        .await
        .unwrap();

    sleep(Duration::from_millis(300)).await;
    assert_eq!(h.call.state().calling_state(), CallingState::Joined);
    assert_eq!(h.connector.connect_calls.load(Ordering::SeqCst), 2);
    assert_eq!(first_signaling.close_calls.load(Ordering::SeqCst), 1);

    // The rejoin flagged itself as a reconnect on the wire.
    let (second_signaling, _) = h.connector.session(1);
    let request = second_signaling
        .last_join_request
        .lock()
        .unwrap()
        .clone()
        .expect("join request sent");
    assert!(request.reconnect);

    // Previously published tracks were restored, best effort.
    let published = h.media.published.lock().unwrap().clone();
    assert!(published.contains(&TrackKind::Audio));
    assert!(published.contains(&TrackKind::Video));
}

#[tokio::test]
async fn policy_close_ends_the_call_without_rejoin() {
    let h = harness(fast_config());
    h.call.join(JoinOptions::default()).await.unwrap();

    let (_, events) = h.connector.session(0);
    events
        .send(SfuEvent::Closed(SessionCloseCode::Banned))
        .await
        .unwrap();

    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.call.state().calling_state(), CallingState::Left);
    assert_eq!(h.connector.connect_calls.load(Ordering::SeqCst), 1);
    assert!(h.events.lock().unwrap().iter().any(|event| matches!(
        event,
        CallEvent::PolicyClosed { code: SessionCloseCode::Banned }
    )));

    // Left is terminal; manual join is rejected.
    let result = h.call.join(JoinOptions::default()).await;
    assert!(matches!(result, Err(CallError::IllegalState(_))));
}

#[tokio::test]
async fn rejoin_budget_exhaustion_requires_manual_join() {
    let mut config = fast_config();
    config.max_reconnect_attempts = 2;
    let h = harness(config);
    h.call.join(JoinOptions::default()).await.unwrap();

    // Every reconnect attempt will fail at the connector.
    h.connector.fail_connect.store(true, Ordering::SeqCst);
    let (_, events) = h.connector.session(0);
    events
        .send(SfuEvent::Closed(SessionCloseCode::TransportDropped))
        .await
        .unwrap();

    sleep(Duration::from_millis(400)).await;
    assert_eq!(h.call.state().calling_state(), CallingState::ReconnectingFailed);
    assert!(h.events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, CallEvent::ReconnectingFailed)));

    // No further automatic attempts.
    let attempts_after_failure = h.connector.connect_calls.load(Ordering::SeqCst);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.connector.connect_calls.load(Ordering::SeqCst), attempts_after_failure);

    // A manual join with a healthy network recovers the call.
    h.connector.fail_connect.store(false, Ordering::SeqCst);
    h.call.join(JoinOptions::default()).await.unwrap();
    assert_eq!(h.call.state().calling_state(), CallingState::Joined);
}

#[tokio::test]
async fn offline_then_online_rejoins_with_fresh_budget() {
    let h = harness(fast_config());
    h.call.join(JoinOptions::default()).await.unwrap();

    h.call.set_network_available(false).await;
    assert_eq!(h.call.state().calling_state(), CallingState::Offline);
    let (first_signaling, _) = h.connector.session(0);
    assert_eq!(first_signaling.close_calls.load(Ordering::SeqCst), 1);

    h.call.set_network_available(true).await;
    assert_eq!(h.call.state().calling_state(), CallingState::Joined);
    assert_eq!(h.connector.connect_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.call.reconnect_attempts(), 0);
}

#[tokio::test]
async fn ringing_reject_reports_to_backend_and_leaves() {
    let h = harness(fast_config());

    h.call.ring().await.unwrap();
    assert_eq!(h.call.state().calling_state(), CallingState::Ringing);
    assert!(h.api.last_ring.load(Ordering::SeqCst));
    assert_eq!(h.call.state().members().len(), 1);

    h.call.reject(Some(RejectReason::Decline)).await.unwrap();
    assert_eq!(h.call.state().calling_state(), CallingState::Left);
    assert_eq!(h.api.reject_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn incoming_ringing_accept_then_join() {
    let h = harness(fast_config());

    h.call.mark_ringing().await.unwrap();
    h.call.accept().await.unwrap();
    assert_eq!(h.api.accept_calls.load(Ordering::SeqCst), 1);

    h.call.join(JoinOptions::default()).await.unwrap();
    assert_eq!(h.call.state().calling_state(), CallingState::Joined);
}

#[tokio::test]
async fn teardown_hooks_run_on_leave_in_reverse_order() {
    let h = harness(fast_config());
    let order = Arc::new(Mutex::new(Vec::new()));

    let order_a = order.clone();
    h.call
        .register_teardown(move || {
            order_a.lock().unwrap().push("a");
            Ok(())
        })
        .await;
    let order_b = order.clone();
    h.call
        .register_teardown(move || {
            order_b.lock().unwrap().push("b");
            Ok(())
        })
        .await;
    // A failing hook must not stop the others or fail the leave.
    h.call
        .register_teardown(|| anyhow::bail!("stats reporter already gone"))
        .await;

    h.call.join(JoinOptions::default()).await.unwrap();
    h.call.leave(LeaveOptions::default()).await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["b", "a"]);
    assert_eq!(h.call.state().calling_state(), CallingState::Left);
}

#[tokio::test]
async fn roster_events_flow_from_the_session() {
    let h = harness(fast_config());
    h.call.join(JoinOptions::default()).await.unwrap();

    let (_, events) = h.connector.session(0);
    let mut carol = Participant::new("carol", "carol-session");
    carol.name = "Carol".to_string();
    events.send(SfuEvent::ParticipantJoined(carol)).await.unwrap();
    events
        .send(SfuEvent::TrackPublished {
            session_id: "carol-session".to_string(),
            kind: TrackKind::ScreenShare,
        })
        .await
        .unwrap();
    events
        .send(SfuEvent::DominantSpeakerChanged {
            session_id: Some("carol-session".to_string()),
        })
        .await
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.call.state().remote_participants().len(), 2);
    assert!(h.call.state().has_ongoing_screen_share());
    assert_eq!(
        h.call.state().dominant_speaker().unwrap().session_id,
        "carol-session"
    );

    events
        .send(SfuEvent::ParticipantLeft {
            session_id: "carol-session".to_string(),
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.call.state().remote_participants().len(), 1);
    assert!(!h.call.state().has_ongoing_screen_share());
}

#[tokio::test]
async fn subscriptions_flow_through_the_debouncer_to_the_session() {
    let h = harness(fast_config());
    h.call.join(JoinOptions::default()).await.unwrap();

    h.call.update_subscriptions(
        callcore::DebounceUrgency::Immediate,
        vec![callcore::SubscriptionRequest {
            session_id: "remote-session".to_string(),
            track_kind: TrackKind::Video,
            dimension: Some(callcore::call::participant::VideoDimension::new(640, 360)),
        }],
    );

    sleep(Duration::from_millis(100)).await;
    let (signaling, _) = h.connector.session(0);
    let batches = signaling.batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    assert!(h.events.lock().unwrap().iter().any(|event| matches!(
        event,
        CallEvent::SubscriptionsFlushed { requested: 1, delivered: true }
    )));
}
