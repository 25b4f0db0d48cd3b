//! WHIP session registry
//!
//! Owns every live session and drives its state machine from transport
//! events. A session that fails or closes is removed from the map right
//! away so a lookup never returns a terminal session; the peer itself is
//! torn down asynchronously and at most once.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::peer::{PeerHandle, PeerState, PeerTransport, TransportEvent};
use super::signaling::{parse_trickle_fragment, validate_offer, SessionState, SignalingError};
use crate::video::CaptureIngest;

/// Snapshot of a session for status queries
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a trickle ICE update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrickleOutcome {
    pub applied: usize,
    pub skipped: usize,
}

struct Session {
    id: String,
    handle: Box<dyn PeerHandle>,
    state: watch::Sender<SessionState>,
    created_at: DateTime<Utc>,
    /// Stops the event task and any capture loop fed by this session
    cancel: CancellationToken,
    torn_down: AtomicBool,
}

impl Session {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Apply a transition if it is legal; returns whether the state changed
    fn transition(&self, next: SessionState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Session {} -> {}", self.id, next);
        }
        changed
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            state: self.state(),
            created_at: self.created_at,
        }
    }

    /// Release transport resources; only the first call does anything
    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Err(e) = self.handle.close().await {
            warn!("Failed to close peer for session {}: {}", self.id, e);
        }
        debug!("Session {} torn down", self.id);
    }
}

pub struct SessionRegistry {
    transport: Arc<dyn PeerTransport>,
    ingest: Arc<CaptureIngest>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    tracker: TaskTracker,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn PeerTransport>, ingest: Arc<CaptureIngest>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            ingest,
            sessions: RwLock::new(HashMap::new()),
            tracker: TaskTracker::new(),
        })
    }

    /// Negotiate a new session from an SDP offer
    ///
    /// Returns the session id and the SDP answer. Nothing is registered
    /// when the offer is malformed or negotiation fails.
    pub async fn create(self: &Arc<Self>, offer: &str) -> Result<(String, String), SignalingError> {
        let summary = validate_offer(offer)?;
        if !summary.has_video() {
            warn!(
                "Offer without a video section (media: {}), no frames will be ingested",
                summary.media.join(",")
            );
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let negotiated = self.transport.negotiate(&id, offer, events_tx).await?;

        let (state, _) = watch::channel(SessionState::Negotiating);
        let session = Arc::new(Session {
            id: id.clone(),
            handle: negotiated.handle,
            state,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
        });
        self.sessions.write().insert(id.clone(), session.clone());
        info!(
            "Session {} created ({} active)",
            id,
            self.session_count()
        );

        let this = self.clone();
        self.tracker
            .spawn(async move { this.drive(session, events_rx).await });

        Ok((id, negotiated.answer))
    }

    /// Forward trickle ICE candidates from a `sdpfrag` body
    ///
    /// Malformed candidate lines are skipped individually.
    pub async fn add_candidates(
        &self,
        id: &str,
        fragment: &str,
    ) -> Result<TrickleOutcome, SignalingError> {
        let session = self
            .lookup(id)
            .ok_or_else(|| SignalingError::UnknownSession(id.to_string()))?;

        let parsed = parse_trickle_fragment(fragment);
        let mut outcome = TrickleOutcome {
            applied: 0,
            skipped: parsed.skipped,
        };
        for candidate in parsed.candidates {
            match session.handle.add_candidate(candidate).await {
                Ok(()) => outcome.applied += 1,
                Err(e) => {
                    debug!("Session {}: candidate rejected: {}", id, e);
                    outcome.skipped += 1;
                }
            }
        }

        if parsed.end_of_candidates {
            debug!("Session {}: remote end of candidates", id);
        }
        debug!(
            "Session {}: {} candidates applied, {} skipped",
            id, outcome.applied, outcome.skipped
        );
        Ok(outcome)
    }

    /// Close a session; returns `false` if it does not exist (anymore)
    pub async fn close(&self, id: &str) -> bool {
        let Some(session) = self.sessions.write().remove(id) else {
            return false;
        };
        session.transition(SessionState::Closed);
        self.ingest.detach(id);
        session.teardown().await;
        info!("Session {} closed ({} active)", id, self.session_count());
        true
    }

    /// Close every session and wait for their event tasks
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        if !sessions.is_empty() {
            info!("Closing {} sessions", sessions.len());
        }

        futures::future::join_all(sessions.iter().map(|session| async move {
            session.transition(SessionState::Closed);
            session.teardown().await;
        }))
        .await;

        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.lookup(id).map(|s| s.info())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove a session after the transport reported it dead
    fn evict(&self, session: &Arc<Session>, state: SessionState) {
        let removed = {
            let mut sessions = self.sessions.write();
            match sessions.get(&session.id) {
                Some(current) if Arc::ptr_eq(current, session) => sessions.remove(&session.id),
                _ => None,
            }
        };
        if removed.is_some() {
            session.transition(state);
            self.ingest.detach(&session.id);
            info!(
                "Session {} removed after transport {} ({} active)",
                session.id,
                state,
                self.session_count()
            );
        }
    }

    async fn drive(
        self: Arc<Self>,
        session: Arc<Session>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            let event = tokio::select! {
                _ = session.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                TransportEvent::StateChanged(PeerState::Connected) => {
                    session.transition(SessionState::Connected);
                }
                TransportEvent::StateChanged(PeerState::Failed) => {
                    self.evict(&session, SessionState::Failed);
                    session.teardown().await;
                    break;
                }
                TransportEvent::StateChanged(PeerState::Closed) => {
                    self.evict(&session, SessionState::Closed);
                    session.teardown().await;
                    break;
                }
                TransportEvent::StateChanged(state) => {
                    debug!("Session {} transport {}", session.id, state);
                }
                TransportEvent::Track(source) => {
                    if session.state().is_terminal() {
                        debug!("Session {} is closed, dropping track", session.id);
                        continue;
                    }
                    self.ingest
                        .attach(&session.id, source, session.cancel.child_token());
                }
            }
        }
        debug!("Session {} event task finished", session.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::BusyGate;
    use crate::stats::PipelineStats;
    use crate::video::{CaptureSettings, FrameSource, FrameStore, RawFrame, TransportError};
    use crate::webrtc::peer::Negotiated;
    use crate::webrtc::signaling::tests::{CANDIDATE_LINE, VIDEO_OFFER};
    use crate::webrtc::signaling::IceCandidate;
    use async_trait::async_trait;
    use image::RgbImage;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct FakePeer {
        candidates: Mutex<Vec<IceCandidate>>,
        closes: AtomicUsize,
    }

    struct FakeHandle(Arc<FakePeer>);

    #[async_trait]
    impl PeerHandle for FakeHandle {
        async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), SignalingError> {
            self.0.candidates.lock().push(candidate);
            Ok(())
        }

        async fn close(&self) -> Result<(), SignalingError> {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        fail: AtomicBool,
        peers: Mutex<HashMap<String, (Arc<FakePeer>, mpsc::UnboundedSender<TransportEvent>)>>,
    }

    impl FakeTransport {
        fn peer(&self, id: &str) -> Arc<FakePeer> {
            self.peers.lock()[id].0.clone()
        }

        fn emit(&self, id: &str, event: TransportEvent) {
            let _ = self.peers.lock()[id].1.send(event);
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn negotiate(
            &self,
            session_id: &str,
            _offer: &str,
            events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Result<Negotiated, SignalingError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SignalingError::Transport("negotiation failed".to_string()));
            }
            let peer = Arc::new(FakePeer::default());
            self.peers
                .lock()
                .insert(session_id.to_string(), (peer.clone(), events));
            Ok(Negotiated {
                answer: format!("answer-for-{}", session_id),
                handle: Box::new(FakeHandle(peer)),
            })
        }
    }

    /// Source that stays open without producing frames
    struct IdleSource;

    #[async_trait]
    impl FrameSource for IdleSource {
        async fn recv(&mut self) -> Result<RawFrame, TransportError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(TransportError::Timeout)
        }

        fn decode(&mut self, _frame: &RawFrame) -> Result<Option<RgbImage>, TransportError> {
            Ok(None)
        }

        fn describe(&self) -> String {
            "idle".to_string()
        }
    }

    struct Harness {
        transport: Arc<FakeTransport>,
        stats: Arc<PipelineStats>,
        ingest: Arc<CaptureIngest>,
        registry: Arc<SessionRegistry>,
    }

    fn harness() -> Harness {
        let transport = Arc::new(FakeTransport::default());
        let stats = Arc::new(PipelineStats::new());
        let ingest = CaptureIngest::new(
            Arc::new(FrameStore::new()),
            stats.clone(),
            BusyGate::new(),
            CaptureSettings::default(),
            TaskTracker::new(),
        );
        let registry = SessionRegistry::new(transport.clone(), ingest.clone());
        Harness {
            transport,
            stats,
            ingest,
            registry,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_create_session() {
        let h = harness();
        let (id, answer) = h.registry.create(VIDEO_OFFER).await.unwrap();

        assert_eq!(answer, format!("answer-for-{}", id));
        assert_eq!(h.registry.session_count(), 1);
        assert_eq!(h.registry.get(&id).unwrap().state, SessionState::Negotiating);

        let (other, _) = h.registry.create(VIDEO_OFFER).await.unwrap();
        assert_ne!(id, other);
        assert_eq!(h.registry.session_count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_offer_registers_nothing() {
        let h = harness();
        let err = h.registry.create("garbage").await.unwrap_err();
        assert!(matches!(err, SignalingError::MalformedOffer(_)));
        assert_eq!(h.registry.session_count(), 0);
        assert!(h.transport.peers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_negotiation_registers_nothing() {
        let h = harness();
        h.transport.fail.store(true, Ordering::SeqCst);
        let err = h.registry.create(VIDEO_OFFER).await.unwrap_err();
        assert!(matches!(err, SignalingError::Transport(_)));
        assert_eq!(h.registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_trickle_candidates() {
        let h = harness();
        let (id, _) = h.registry.create(VIDEO_OFFER).await.unwrap();

        let body = format!("a=mid:0\r\n{}\r\na=candidate:nonsense\r\n", CANDIDATE_LINE);
        let outcome = h.registry.add_candidates(&id, &body).await.unwrap();
        assert_eq!(outcome, TrickleOutcome { applied: 1, skipped: 1 });

        let candidates = h.transport.peer(&id).candidates.lock().clone();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].sdp_mid.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_trickle_unknown_session() {
        let h = harness();
        let (id, _) = h.registry.create(VIDEO_OFFER).await.unwrap();

        let err = h
            .registry
            .add_candidates("no-such-session", CANDIDATE_LINE)
            .await
            .unwrap_err();
        assert_eq!(err, SignalingError::UnknownSession("no-such-session".to_string()));
        assert!(h.transport.peer(&id).candidates.lock().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let h = harness();
        let (id, _) = h.registry.create(VIDEO_OFFER).await.unwrap();
        let (other, _) = h.registry.create(VIDEO_OFFER).await.unwrap();

        assert!(h.registry.close(&id).await);
        assert!(!h.registry.close(&id).await);
        assert!(h.registry.get(&id).is_none());
        assert_eq!(h.transport.peer(&id).closes.load(Ordering::SeqCst), 1);

        // Other sessions are unaffected
        assert!(h.registry.get(&other).is_some());
        assert_eq!(h.transport.peer(&other).closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transport_connected() {
        let h = harness();
        let (id, _) = h.registry.create(VIDEO_OFFER).await.unwrap();

        h.transport
            .emit(&id, TransportEvent::StateChanged(PeerState::Connected));
        let registry = h.registry.clone();
        wait_until(|| {
            registry.get(&id).map(|s| s.state) == Some(SessionState::Connected)
        })
        .await;
    }

    #[tokio::test]
    async fn test_transport_failure_removes_session() {
        let h = harness();
        let (id, _) = h.registry.create(VIDEO_OFFER).await.unwrap();
        let peer = h.transport.peer(&id);

        h.transport
            .emit(&id, TransportEvent::StateChanged(PeerState::Failed));
        let registry = h.registry.clone();
        wait_until(|| registry.get(&id).is_none()).await;
        wait_until(|| peer.closes.load(Ordering::SeqCst) == 1).await;

        // Explicit close after the failure finds nothing and does not close twice
        assert!(!h.registry.close(&id).await);
        assert_eq!(peer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnected_is_not_terminal() {
        let h = harness();
        let (id, _) = h.registry.create(VIDEO_OFFER).await.unwrap();

        h.transport
            .emit(&id, TransportEvent::StateChanged(PeerState::Connected));
        h.transport
            .emit(&id, TransportEvent::StateChanged(PeerState::Disconnected));
        let registry = h.registry.clone();
        wait_until(|| {
            registry.get(&id).map(|s| s.state) == Some(SessionState::Connected)
        })
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.registry.get(&id).unwrap().state, SessionState::Connected);
    }

    #[tokio::test]
    async fn test_track_attaches_and_close_detaches() {
        let h = harness();
        let (id, _) = h.registry.create(VIDEO_OFFER).await.unwrap();

        h.transport.emit(&id, TransportEvent::Track(Box::new(IdleSource)));
        let stats = h.stats.clone();
        wait_until(|| stats.stream_attached()).await;
        assert_eq!(h.ingest.active_session().as_deref(), Some(id.as_str()));

        assert!(h.registry.close(&id).await);
        let stats = h.stats.clone();
        wait_until(|| !stats.stream_attached()).await;
    }

    #[tokio::test]
    async fn test_close_all() {
        let h = harness();
        let (a, _) = h.registry.create(VIDEO_OFFER).await.unwrap();
        let (b, _) = h.registry.create(VIDEO_OFFER).await.unwrap();

        h.registry.close_all().await;
        assert_eq!(h.registry.session_count(), 0);
        assert_eq!(h.transport.peer(&a).closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.peer(&b).closes.load(Ordering::SeqCst), 1);
    }
}
