//! One SFU connection attempt.
//!
//! A `SignalingSession` is created for a single join attempt and never
//! reused: a rejoin tears the old session down and establishes a fresh one.
//! The session owns the connect-and-ready handshake and the join request;
//! inbound events are handed to the controller exactly once via
//! [`take_events`].
//!
//! [`take_events`]: SignalingSession::take_events

use crate::call::error::SignalingError;
use crate::signaling::{JoinAck, JoinRequest, SfuConnector, SfuCredentials, SfuEvent, SfuSignaling};
use crate::call::subscription::SubscriptionRequest;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;

pub struct SignalingSession {
    transport: Arc<dyn SfuSignaling>,
    events: Mutex<Option<mpsc::Receiver<SfuEvent>>>,
    closed: AtomicBool,
}

impl SignalingSession {
    /// Open a connection and wait for its ready signal.
    ///
    /// On any failure (including timeout) the half-open transport is closed
    /// before the error is returned, so a cancelled or failed attempt never
    /// leaks a connection.
    pub async fn establish(
        connector: &dyn SfuConnector,
        credentials: &SfuCredentials,
        ready_timeout: Duration,
    ) -> Result<Self, SignalingError> {
        let (transport, mut events) = connector.connect(credentials).await?;

        let ready_wait = async {
            loop {
                match events.recv().await {
                    Some(SfuEvent::Ready) => return Ok(()),
                    Some(SfuEvent::Closed(code)) => {
                        return Err(SignalingError::Connect(format!(
                            "connection closed during setup: {code:?}"
                        )));
                    }
                    // Events preceding Ready belong to no session yet.
                    Some(other) => {
                        debug!(target: "Call/Session", "dropping pre-ready event: {other:?}");
                    }
                    None => return Err(SignalingError::ChannelClosed),
                }
            }
        };

        match timeout(ready_timeout, ready_wait).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                transport.close().await;
                return Err(err);
            }
            Err(_) => {
                transport.close().await;
                return Err(SignalingError::HandshakeTimeout);
            }
        }

        Ok(Self {
            transport,
            events: Mutex::new(Some(events)),
            closed: AtomicBool::new(false),
        })
    }

    /// Send the join handshake, bounded by `ack_timeout`.
    pub async fn send_join_request(
        &self,
        request: JoinRequest,
        ack_timeout: Duration,
    ) -> Result<JoinAck, SignalingError> {
        match timeout(ack_timeout, self.transport.send_join(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(target: "Call/Session", "join acknowledgment timed out after {ack_timeout:?}");
                Err(SignalingError::HandshakeTimeout)
            }
        }
    }

    pub async fn update_subscriptions(
        &self,
        requests: Vec<SubscriptionRequest>,
    ) -> Result<(), SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::ChannelClosed);
        }
        self.transport.update_subscriptions(requests).await
    }

    /// Hand the inbound event stream to the caller. Yields `Some` exactly
    /// once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<SfuEvent>> {
        self.events.lock().await.take()
    }

    /// Deliberately close the session. Idempotent; repeated calls never
    /// reach the transport twice.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.transport.close().await;
        }
    }

    /// Whether `close()` was called — distinguishes our own teardown from a
    /// transport-initiated close.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::mock::MockConnector;

    fn credentials() -> SfuCredentials {
        SfuCredentials {
            url: "sfu.test".to_string(),
            token: "token".to_string(),
        }
    }

    #[tokio::test]
    async fn establish_waits_for_ready() {
        let (connector, _tx, _signaling) = MockConnector::ready();
        let session =
            SignalingSession::establish(&connector, &credentials(), Duration::from_secs(1)).await;
        assert!(session.is_ok());
    }

    #[tokio::test]
    async fn establish_times_out_without_ready() {
        let (_tx, rx) = mpsc::channel(1);
        let signaling = Arc::new(crate::signaling::mock::MockSignaling::default());
        let connector = MockConnector {
            signaling: signaling.clone(),
            events: std::sync::Mutex::new(Some(rx)),
        };

        let result =
            SignalingSession::establish(&connector, &credentials(), Duration::from_millis(50))
                .await;
        assert!(matches!(result, Err(SignalingError::HandshakeTimeout)));
        // The half-open transport was torn down.
        assert_eq!(signaling.close_count(), 1);
    }

    #[tokio::test]
    async fn establish_fails_when_closed_during_setup() {
        let (_, rx) = {
            let (tx, rx) = mpsc::channel(4);
            tx.try_send(SfuEvent::Closed(crate::signaling::SessionCloseCode::Error(1006)))
                .unwrap();
            (tx, rx)
        };
        let signaling = Arc::new(crate::signaling::mock::MockSignaling::default());
        let connector = MockConnector {
            signaling: signaling.clone(),
            events: std::sync::Mutex::new(Some(rx)),
        };

        let result =
            SignalingSession::establish(&connector, &credentials(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SignalingError::Connect(_))));
        assert_eq!(signaling.close_count(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (connector, _tx, signaling) = MockConnector::ready();
        let session =
            SignalingSession::establish(&connector, &credentials(), Duration::from_secs(1))
                .await
                .unwrap();

        session.close().await;
        session.close().await;
        assert_eq!(signaling.close_count(), 1);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn update_subscriptions_fails_after_close() {
        let (connector, _tx, _signaling) = MockConnector::ready();
        let session =
            SignalingSession::establish(&connector, &credentials(), Duration::from_secs(1))
                .await
                .unwrap();

        session.close().await;
        let result = session.update_subscriptions(Vec::new()).await;
        assert!(matches!(result, Err(SignalingError::ChannelClosed)));
    }

    #[tokio::test]
    async fn events_can_only_be_taken_once() {
        let (connector, _tx, _signaling) = MockConnector::ready();
        let session =
            SignalingSession::establish(&connector, &credentials(), Duration::from_secs(1))
                .await
                .unwrap();

        assert!(session.take_events().await.is_some());
        assert!(session.take_events().await.is_none());
    }
}
