//! Connection registry and event dispatch.
//!
//! The manager owns every [`PeerSession`] by connection id. Sessions
//! never reach back into the registry; transport callbacks enqueue
//! [`ConnectionEvent`]s and the single dispatch loop here applies them,
//! so registration, teardown, and state decisions all happen in one
//! place regardless of which transport thread reported first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::analysis::AnalysisHandle;
use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::media::{FrameProcessor, FrameRelay, FrameSource, TrackWriter};
use crate::peer::connection::PeerSession;
use crate::peer::state::{ConnectionEvent, ConnectionState};

const EVENT_QUEUE_DEPTH: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Registry view of one connection, as exposed over the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub state: String,
    /// When the connection was created (ISO 8601)
    pub created_at: String,
    /// Seconds since the transport connected, if it has
    pub duration_secs: Option<u64>,
}

/// Result of a successful offer/answer exchange
#[derive(Debug, Clone)]
pub struct NegotiatedAnswer {
    pub connection_id: String,
    pub sdp: String,
}

/// Owns all peer sessions and runs the event dispatch loop
pub struct PeerManager {
    config: MediaConfig,
    relay: Arc<FrameRelay>,
    analysis: Option<AnalysisHandle>,
    connections: RwLock<HashMap<String, Arc<PeerSession>>>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    /// Taken by the dispatch loop on startup
    events_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
}

impl PeerManager {
    pub fn new(
        config: MediaConfig,
        relay: Arc<FrameRelay>,
        analysis: Option<AnalysisHandle>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        Self {
            config,
            relay,
            analysis,
            connections: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Negotiate a new connection from a validated remote offer.
    ///
    /// The session is registered before negotiation and unregistered
    /// again if any step fails, so the registry only ever holds
    /// sessions that produced an answer or are still producing one.
    pub async fn handle_offer(&self, offer: RTCSessionDescription) -> Result<NegotiatedAnswer> {
        // Subscribing first makes a dead camera feed fail the offer
        // before any session state exists
        let subscription = self.relay.subscribe().await?;

        let session = Arc::new(PeerSession::new(&self.config, self.events_tx.clone()).await?);
        let connection_id = session.connection_id().to_string();

        let at_capacity = {
            let mut connections = self.connections.write().await;
            if connections.len() >= self.config.max_connections {
                true
            } else {
                connections.insert(connection_id.clone(), Arc::clone(&session));
                false
            }
        };
        if at_capacity {
            let _ = session.close().await;
            return Err(Error::PeerConnection(format!(
                "Connection limit reached ({})",
                self.config.max_connections
            )));
        }

        let answer_sdp = match session.answer(offer).await {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Negotiation failed, unregistering");
                self.connections.write().await.remove(&connection_id);
                if let Err(close_err) = session.close().await {
                    warn!(connection_id = %connection_id, error = %close_err, "Cleanup close failed");
                }
                return Err(e);
            }
        };

        // Outbound pipeline: subscription -> analysis tap -> encoder -> track
        let processor = FrameProcessor::new(
            subscription,
            self.analysis.clone(),
            connection_id.clone(),
            session.video_track_id().to_string(),
        );
        let writer = TrackWriter::new(processor, session.video_track(), connection_id.clone());
        let events = self.events_tx.clone();
        let writer_connection = connection_id.clone();
        let writer_task = tokio::spawn(async move {
            let reason = match writer.run().await {
                Ok(()) => "source ended".to_string(),
                Err(e) => e.to_string(),
            };
            let _ = events
                .send(ConnectionEvent::TrackEnded {
                    connection_id: writer_connection,
                    reason,
                })
                .await;
        });
        session.add_task(writer_task).await;

        let connections = self.connection_count().await;
        info!(
            connection_id = %connection_id,
            connections = connections,
            "Negotiated new connection"
        );

        Ok(NegotiatedAnswer {
            connection_id,
            sdp: answer_sdp,
        })
    }

    /// Run the dispatch loop until shutdown is signalled
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut events = match self.events_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("Dispatch loop already running");
                return;
            }
        };

        info!("Connection event dispatch started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Connection event dispatch stopping");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                }
            }
        }
    }

    /// Apply one event. The only mutation point for lifecycle state.
    async fn dispatch(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged {
                connection_id,
                state,
            } => {
                let session = self.get(&connection_id).await;
                let session = match session {
                    Some(session) => session,
                    None => {
                        debug!(connection_id = %connection_id, "State report for unknown connection");
                        return;
                    }
                };

                match session.set_state(state).await {
                    Ok(true) => match state {
                        ConnectionState::Connected => {
                            info!(connection_id = %connection_id, "Peer connected");
                        }
                        ConnectionState::Failed => {
                            warn!(connection_id = %connection_id, "Transport failed, closing connection");
                            self.close_connection(&connection_id).await;
                        }
                        ConnectionState::Closed => {
                            self.close_connection(&connection_id).await;
                        }
                        _ => {}
                    },
                    Ok(false) => {}
                    Err(e) => {
                        debug!(connection_id = %connection_id, error = %e, "Ignoring state report");
                    }
                }
            }

            ConnectionEvent::TrackAnnounced {
                connection_id,
                track_id,
                kind,
            } => {
                let session = self.get(&connection_id).await;
                let session = match session {
                    Some(session) => session,
                    None => {
                        debug!(connection_id = %connection_id, "Track announcement for unknown connection");
                        return;
                    }
                };

                if !session.register_remote_track(&track_id).await {
                    debug!(
                        connection_id = %connection_id,
                        track_id = %track_id,
                        "Duplicate track announcement ignored"
                    );
                    return;
                }

                if kind != "video" {
                    debug!(
                        connection_id = %connection_id,
                        track_id = %track_id,
                        kind = %kind,
                        "Non-video track drained without analysis tap"
                    );
                    return;
                }

                let subscription = match self.relay.subscribe().await {
                    Ok(sub) => sub,
                    Err(e) => {
                        warn!(connection_id = %connection_id, error = %e, "No analysis tap, relay closed");
                        return;
                    }
                };
                let mut processor = FrameProcessor::new(
                    subscription,
                    self.analysis.clone(),
                    connection_id.clone(),
                    track_id.clone(),
                );
                let tap_connection = connection_id.clone();
                let tap = tokio::spawn(async move {
                    loop {
                        if let Err(e) = processor.recv().await {
                            debug!(connection_id = %tap_connection, error = %e, "Analysis tap stopped");
                            break;
                        }
                    }
                });
                session.add_task(tap).await;

                info!(
                    connection_id = %connection_id,
                    track_id = %track_id,
                    "Wired analysis tap for remote track"
                );
            }

            ConnectionEvent::TrackEnded {
                connection_id,
                reason,
            } => {
                info!(connection_id = %connection_id, reason = %reason, "Outbound track ended, closing connection");
                self.close_connection(&connection_id).await;
            }
        }
    }

    /// Unregister and tear down a connection.
    ///
    /// Closing an unknown or already-closed connection is a no-op.
    /// Returns whether a session was actually removed.
    pub async fn close_connection(&self, connection_id: &str) -> bool {
        let session = self.connections.write().await.remove(connection_id);
        match session {
            Some(session) => {
                if let Err(e) = session.close().await {
                    warn!(connection_id = %connection_id, error = %e, "Error closing connection");
                }
                let remaining = self.connection_count().await;
                info!(
                    connection_id = %connection_id,
                    remaining = remaining,
                    "Connection unregistered"
                );
                true
            }
            None => {
                debug!(connection_id = %connection_id, "Close for unknown connection is a no-op");
                false
            }
        }
    }

    /// Close every connection concurrently, bounded by a grace period
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<PeerSession>> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, session)| session).collect()
        };
        if sessions.is_empty() {
            return;
        }

        info!(count = sessions.len(), "Closing all peer connections");
        let closes = sessions.iter().map(|session| session.close());
        match tokio::time::timeout(SHUTDOWN_GRACE, join_all(closes)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "Connection close failed during shutdown");
                    }
                }
            }
            Err(_) => {
                warn!(
                    grace_secs = SHUTDOWN_GRACE.as_secs(),
                    "Shutdown grace period elapsed with connections still closing"
                );
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Registry snapshot for the status endpoint
    pub async fn list_connections(&self) -> Vec<ConnectionInfo> {
        let connections = {
            let guard = self.connections.read().await;
            guard.values().cloned().collect::<Vec<_>>()
        };

        let mut infos = Vec::with_capacity(connections.len());
        for session in connections {
            let duration_secs = session
                .connected_at()
                .await
                .and_then(|t| t.elapsed().ok())
                .map(|d| d.as_secs());
            infos.push(ConnectionInfo {
                connection_id: session.connection_id().to_string(),
                state: session.state().await.to_string(),
                created_at: chrono::DateTime::<chrono::Utc>::from(session.created_at())
                    .to_rfc3339(),
                duration_secs,
            });
        }
        infos
    }

    async fn get(&self, connection_id: &str) -> Option<Arc<PeerSession>> {
        let connections = self.connections.read().await;
        connections.get(connection_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::channel_source;

    fn media_config() -> MediaConfig {
        MediaConfig {
            stun_servers: vec![],
            ..MediaConfig::default()
        }
    }

    fn live_relay() -> (
        tokio::sync::mpsc::Sender<Result<crate::media::VideoFrame>>,
        Arc<FrameRelay>,
    ) {
        let (tx, source) = channel_source();
        (tx, FrameRelay::spawn(source, 8))
    }

    async fn register_session(manager: &PeerManager) -> (String, Arc<PeerSession>) {
        let session = Arc::new(
            PeerSession::new(&media_config(), manager.events_tx.clone())
                .await
                .unwrap(),
        );
        let id = session.connection_id().to_string();
        manager
            .connections
            .write()
            .await
            .insert(id.clone(), Arc::clone(&session));
        (id, session)
    }

    #[tokio::test]
    async fn test_close_unknown_connection_is_noop() {
        let (_tx, relay) = live_relay();
        let manager = PeerManager::new(media_config(), relay, None);
        assert!(!manager.close_connection("nope").await);
    }

    #[tokio::test]
    async fn test_close_connection_unregisters_once() {
        let (_tx, relay) = live_relay();
        let manager = PeerManager::new(media_config(), relay, None);
        let (id, session) = register_session(&manager).await;

        assert!(manager.close_connection(&id).await);
        assert_eq!(manager.connection_count().await, 0);
        assert_eq!(session.state().await, ConnectionState::Closed);

        // Second close of the same id is a no-op, not an error
        assert!(!manager.close_connection(&id).await);
    }

    #[tokio::test]
    async fn test_track_ended_event_closes_connection() {
        let (_tx, relay) = live_relay();
        let manager = PeerManager::new(media_config(), relay, None);
        let (id, session) = register_session(&manager).await;

        manager
            .dispatch(ConnectionEvent::TrackEnded {
                connection_id: id.clone(),
                reason: "video relay is closed".to_string(),
            })
            .await;

        assert_eq!(manager.connection_count().await, 0);
        assert_eq!(session.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_transport_failure_closes_connection() {
        let (_tx, relay) = live_relay();
        let manager = PeerManager::new(media_config(), relay, None);
        let (id, session) = register_session(&manager).await;

        session.set_state(ConnectionState::Negotiating).await.unwrap();
        manager
            .dispatch(ConnectionEvent::StateChanged {
                connection_id: id.clone(),
                state: ConnectionState::Failed,
            })
            .await;

        assert_eq!(manager.connection_count().await, 0);
        assert_eq!(session.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_stale_events_for_unknown_connection_ignored() {
        let (_tx, relay) = live_relay();
        let manager = PeerManager::new(media_config(), relay, None);

        manager
            .dispatch(ConnectionEvent::StateChanged {
                connection_id: "gone".to_string(),
                state: ConnectionState::Failed,
            })
            .await;
        manager
            .dispatch(ConnectionEvent::TrackAnnounced {
                connection_id: "gone".to_string(),
                track_id: "t".to_string(),
                kind: "video".to_string(),
            })
            .await;
    }

    #[tokio::test]
    async fn test_offer_rejected_when_relay_closed() {
        let (_tx, relay) = live_relay();
        relay.close().await;
        let manager = PeerManager::new(media_config(), Arc::clone(&relay), None);

        let offer = RTCSessionDescription::offer(
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".to_string(),
        )
        .unwrap();
        let err = manager.handle_offer(offer).await.unwrap_err();
        assert!(matches!(err, Error::TransportState(_)));
        assert_eq!(manager.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_offer_rejected_at_capacity() {
        let (_tx, relay) = live_relay();
        let config = MediaConfig {
            max_connections: 1,
            ..media_config()
        };
        let manager = PeerManager::new(config, relay, None);
        let _held = register_session(&manager).await;

        let offer = RTCSessionDescription::offer(
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".to_string(),
        )
        .unwrap();
        let err = manager.handle_offer(offer).await.unwrap_err();
        assert!(matches!(err, Error::PeerConnection(_)));
        assert_eq!(manager.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything_concurrently() {
        let (_tx, relay) = live_relay();
        let manager = PeerManager::new(media_config(), relay, None);
        let (_, a) = register_session(&manager).await;
        let (_, b) = register_session(&manager).await;

        manager.shutdown().await;

        assert_eq!(manager.connection_count().await, 0);
        assert_eq!(a.state().await, ConnectionState::Closed);
        assert_eq!(b.state().await, ConnectionState::Closed);
    }
}
