//! One WebRTC peer session.
//!
//! [`PeerSession`] wraps an `RTCPeerConnection` plus everything owned per
//! peer: the outbound video track, the tasks feeding and draining it, and
//! the lifecycle state. Transport callbacks registered here never touch
//! session state; they enqueue [`ConnectionEvent`]s for the manager's
//! dispatch loop and, for remote tracks, start the RTP drain that keeps
//! the transport reading.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::peer::state::{ConnectionEvent, ConnectionState};

/// Server-side peer connection with its outbound camera track
pub struct PeerSession {
    connection_id: String,
    pc: Arc<RTCPeerConnection>,
    state: Arc<RwLock<ConnectionState>>,
    video_track: Arc<TrackLocalStaticSample>,
    /// Retained so the transceiver keeps its sender alive
    _video_sender: Arc<RTCRtpSender>,
    /// Remote track ids already wired up, for exactly-once registration
    remote_tracks: Mutex<HashSet<String>>,
    /// Writer and drain tasks, aborted on close
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// Teardown-done flag, separate from lifecycle state: the state may
    /// already read Closed from a transport report while the transport
    /// itself still needs closing
    closed: AtomicBool,
    gather_timeout: Duration,
    created_at: SystemTime,
    connected_at: Arc<RwLock<Option<SystemTime>>>,
}

impl PeerSession {
    /// Create a session with the camera track already attached.
    ///
    /// The track must exist before the answer is produced so the SDP
    /// advertises the outbound video; attaching it later would need a
    /// renegotiation round the signaling contract does not have.
    pub async fn new(
        config: &MediaConfig,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Self> {
        let connection_id = Uuid::new_v4().to_string();

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::PeerConnection(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(
            Default::default(),
            &mut media_engine,
        )
        .map_err(|e| Error::PeerConnection(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PeerConnection(format!("Failed to create peer connection: {}", e))
        })?);

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            format!("video-{}", connection_id),
            format!("camgate-{}", connection_id),
        ));

        let video_sender = pc
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrack(format!("Failed to add video track: {}", e)))?;

        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        Self::register_state_callback(&pc, &connection_id, events.clone());
        Self::register_track_callback(&pc, &connection_id, events, Arc::clone(&tasks));

        info!(connection_id = %connection_id, "Created peer session");

        Ok(Self {
            connection_id,
            pc,
            state: Arc::new(RwLock::new(ConnectionState::New)),
            video_track,
            _video_sender: video_sender,
            remote_tracks: Mutex::new(HashSet::new()),
            tasks,
            closed: AtomicBool::new(false),
            gather_timeout: Duration::from_secs(config.gather_timeout_secs),
            created_at: SystemTime::now(),
            connected_at: Arc::new(RwLock::new(None)),
        })
    }

    /// Transport state reports become events; the dispatch loop decides
    fn register_state_callback(
        pc: &Arc<RTCPeerConnection>,
        connection_id: &str,
        events: mpsc::Sender<ConnectionEvent>,
    ) {
        let connection_id = connection_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let events = events.clone();
            let connection_id = connection_id.clone();
            Box::pin(async move {
                let state = match s {
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                        ConnectionState::Failed
                    }
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => return,
                };
                debug!(connection_id = %connection_id, transport_state = %s, "Transport state report");
                let _ = events
                    .send(ConnectionEvent::StateChanged {
                        connection_id,
                        state,
                    })
                    .await;
            })
        }));
    }

    /// Remote track announcements become events. The RTP drain starts
    /// here because only the callback holds the `TrackRemote`; reading
    /// and discarding packets keeps the transport delivering them.
    fn register_track_callback(
        pc: &Arc<RTCPeerConnection>,
        connection_id: &str,
        events: mpsc::Sender<ConnectionEvent>,
        tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    ) {
        let connection_id = connection_id.to_string();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = events.clone();
                let connection_id = connection_id.clone();
                let tasks = Arc::clone(&tasks);
                Box::pin(async move {
                    let track_id = track.id();
                    let kind = track.kind().to_string();
                    info!(
                        connection_id = %connection_id,
                        track_id = %track_id,
                        kind = %kind,
                        mime_type = %track.codec().capability.mime_type,
                        "Remote track announced"
                    );

                    let drain_connection = connection_id.clone();
                    let drain = tokio::spawn(async move {
                        loop {
                            match track.read_rtp().await {
                                Ok(_) => {}
                                Err(e) => {
                                    debug!(
                                        connection_id = %drain_connection,
                                        error = %e,
                                        "Remote track ended"
                                    );
                                    break;
                                }
                            }
                        }
                    });
                    tasks.lock().await.push(drain);

                    let _ = events
                        .send(ConnectionEvent::TrackAnnounced {
                            connection_id,
                            track_id,
                            kind,
                        })
                        .await;
                })
            },
        ));
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.video_track)
    }

    pub fn video_track_id(&self) -> &str {
        self.video_track.id()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn connected_at(&self) -> Option<SystemTime> {
        *self.connected_at.read().await
    }

    /// Apply a validated lifecycle transition.
    ///
    /// Returns whether the state changed; reporting the current state
    /// again is a no-op, an illegal move is an error the caller logs.
    pub async fn set_state(&self, next: ConnectionState) -> Result<bool> {
        let mut state = self.state.write().await;
        if *state == next {
            return Ok(false);
        }
        *state = state.transition_to(next)?;
        if next == ConnectionState::Connected {
            *self.connected_at.write().await = Some(SystemTime::now());
        }
        debug!(connection_id = %self.connection_id, state = %next, "Connection state changed");
        Ok(true)
    }

    /// Record a remote track id; true only the first time it is seen
    pub async fn register_remote_track(&self, track_id: &str) -> bool {
        self.remote_tracks.lock().await.insert(track_id.to_string())
    }

    /// Park a task whose lifetime is bound to this session
    pub async fn add_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().await.push(task);
    }

    /// Negotiate: apply the remote offer and produce a complete answer.
    ///
    /// The signaling contract is a single request/response exchange, so
    /// the answer must already carry the candidate set. Gathering is
    /// bounded; on timeout the answer ships with whatever was gathered.
    pub async fn answer(&self, offer: RTCSessionDescription) -> Result<String> {
        self.set_state(ConnectionState::Negotiating).await?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create answer: {}", e)))?;

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set local description: {}", e)))?;

        let mut gather_done = self.pc.gathering_complete_promise().await;
        if tokio::time::timeout(self.gather_timeout, gather_done.recv())
            .await
            .is_err()
        {
            warn!(
                connection_id = %self.connection_id,
                timeout_secs = self.gather_timeout.as_secs(),
                "ICE gathering incomplete, answering with gathered candidates"
            );
        }

        let local = self.pc.local_description().await.ok_or_else(|| {
            Error::Negotiation("No local description after setting answer".to_string())
        })?;

        debug!(connection_id = %self.connection_id, "Created SDP answer");
        Ok(local.sdp)
    }

    /// Tear the session down. Safe to call from any state, any number
    /// of times, from concurrent tasks; only the first call does work.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(connection_id = %self.connection_id, "Session already closed");
            return Ok(());
        }

        // Every state may finalize to Closed during teardown
        *self.state.write().await = ConnectionState::Closed;

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        self.pc
            .close()
            .await
            .map_err(|e| Error::PeerConnection(format!("Failed to close connection: {}", e)))?;

        info!(connection_id = %self.connection_id, "Session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MediaConfig {
        MediaConfig {
            // No STUN keeps gathering local and instant in tests
            stun_servers: vec![],
            ..MediaConfig::default()
        }
    }

    #[tokio::test]
    async fn test_session_starts_new_with_video_track() {
        let (events, _rx) = mpsc::channel(16);
        let session = PeerSession::new(&test_config(), events).await.unwrap();

        assert_eq!(session.state().await, ConnectionState::New);
        assert!(!session.connection_id().is_empty());
        assert!(session.connected_at().await.is_none());
    }

    #[tokio::test]
    async fn test_remote_track_registered_exactly_once() {
        let (events, _rx) = mpsc::channel(16);
        let session = PeerSession::new(&test_config(), events).await.unwrap();

        assert!(session.register_remote_track("track-a").await);
        assert!(!session.register_remote_track("track-a").await);
        assert!(session.register_remote_track("track-b").await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (events, _rx) = mpsc::channel(16);
        let session = PeerSession::new(&test_config(), events).await.unwrap();

        session.close().await.unwrap();
        assert_eq!(session.state().await, ConnectionState::Closed);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_transitions_out_of_closed() {
        let (events, _rx) = mpsc::channel(16);
        let session = PeerSession::new(&test_config(), events).await.unwrap();

        session.close().await.unwrap();
        let err = session.set_state(ConnectionState::Connected).await.unwrap_err();
        assert!(matches!(err, Error::TransportState(_)));
    }

    #[tokio::test]
    async fn test_same_state_report_is_noop() {
        let (events, _rx) = mpsc::channel(16);
        let session = PeerSession::new(&test_config(), events).await.unwrap();

        assert!(session.set_state(ConnectionState::Negotiating).await.unwrap());
        assert!(!session.set_state(ConnectionState::Negotiating).await.unwrap());
    }
}
