//! Maps room membership onto peer sessions and routes relayed signals.
//!
//! Events are handled strictly in arrival order on one logical task, which
//! serializes state transitions per session without any global lock. Signals
//! that arrive before local media is ready are queued behind the media gate,
//! not dropped. Per-session failures close that session only; the
//! orchestrator itself never dies on a bad message.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::client::media::{LocalMedia, SessionConfig};
use crate::client::session::{NegotiationState, PeerSession, Role, SessionEvents, TrackAttachment};
use crate::client::signaling::SignalingClient;
use crate::error::{Error, Result};
use crate::protocol::{ClientEvent, ServerEvent};

/// Events surfaced to the embedding application.
pub enum CallEvent {
    ParticipantJoined(String),
    ParticipantLeft(String),
    /// The session with this remote reached `stable` (initial handshake or a
    /// renegotiation cycle completed).
    SessionStable(String),
    SessionClosed(String),
    RemoteTrack {
        remote_id: String,
        track: Arc<TrackRemote>,
    },
    /// Coordinator-side error (e.g. join rejection).
    CoordinatorError(String),
}

impl fmt::Debug for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallEvent::ParticipantJoined(id) => write!(f, "ParticipantJoined({id})"),
            CallEvent::ParticipantLeft(id) => write!(f, "ParticipantLeft({id})"),
            CallEvent::SessionStable(id) => write!(f, "SessionStable({id})"),
            CallEvent::SessionClosed(id) => write!(f, "SessionClosed({id})"),
            CallEvent::RemoteTrack { remote_id, .. } => {
                write!(f, "RemoteTrack {{ remote_id: {remote_id} }}")
            }
            CallEvent::CoordinatorError(message) => write!(f, "CoordinatorError({message})"),
        }
    }
}

struct SessionEntry {
    session: Arc<PeerSession>,
    /// Initial offer deferred behind the media gate.
    offer_pending: bool,
}

/// Owns the set of active peer sessions for the local participant and drives
/// them from room membership events and relayed signals.
pub struct CallOrchestrator {
    signaling: SignalingClient,
    room_id: String,
    connection_id: String,
    config: SessionConfig,
    sessions: HashMap<String, SessionEntry>,
    local_media: Option<LocalMedia>,
    /// Signals that arrived before local media was ready.
    deferred_signals: VecDeque<ServerEvent>,
    events_tx: mpsc::UnboundedSender<CallEvent>,
}

impl CallOrchestrator {
    /// Connects to the coordinator, joins the room, and waits for the
    /// assigned connection identity.
    pub async fn join(
        url: &str,
        room_id: &str,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CallEvent>)> {
        let mut signaling = SignalingClient::connect(url).await?;
        signaling
            .send(ClientEvent::RoomJoin {
                room_id: room_id.to_owned(),
            })
            .await?;

        let connection_id = loop {
            match signaling.receive().await {
                Some(ServerEvent::RoomJoined {
                    connection_id,
                    peers,
                    ..
                }) => {
                    debug!(%connection_id, existing = peers.len(), "joined room");
                    break connection_id;
                }
                Some(ServerEvent::Error { message }) => return Err(Error::Room(message)),
                Some(other) => {
                    debug!(?other, "event before join ack ignored");
                }
                None => return Err(Error::ChannelClosed),
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        info!(room_id, %connection_id, "call orchestrator ready");
        Ok((
            Self {
                signaling,
                room_id: room_id.to_owned(),
                connection_id,
                config,
                sessions: HashMap::new(),
                local_media: None,
                deferred_signals: VecDeque::new(),
                events_tx,
            },
            events_rx,
        ))
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Signals currently parked behind the media gate.
    pub fn deferred_signal_count(&self) -> usize {
        self.deferred_signals.len()
    }

    /// Handles coordinator events until the transport closes.
    pub async fn run(&mut self) -> Result<()> {
        while self.poll_event().await? {}
        Ok(())
    }

    /// Receives and handles exactly one coordinator event. Returns `false`
    /// once the transport is gone; by then every active session has been
    /// closed, since signaling loss leaves them unrecoverable.
    pub async fn poll_event(&mut self) -> Result<bool> {
        match self.signaling.receive().await {
            Some(event) => {
                self.handle_event(event).await;
                Ok(true)
            }
            None => {
                info!("signaling transport closed, closing active sessions");
                self.close_all_sessions().await;
                Ok(false)
            }
        }
    }

    /// Local media became available: attach it to every live session (safe in
    /// either media/session readiness order), then flush the work that was
    /// gated on it.
    pub async fn on_local_media_ready(&mut self, media: LocalMedia) {
        self.local_media = Some(media);

        let remotes: Vec<String> = self.sessions.keys().cloned().collect();
        for remote_id in &remotes {
            self.attach_media(remote_id).await;
        }
        for remote_id in remotes {
            let pending = self
                .sessions
                .get_mut(&remote_id)
                .map(|entry| std::mem::take(&mut entry.offer_pending))
                .unwrap_or(false);
            if pending {
                self.send_initial_offer(&remote_id).await;
            }
        }

        let deferred: Vec<ServerEvent> = self.deferred_signals.drain(..).collect();
        for event in deferred {
            self.dispatch(event).await;
        }
    }

    /// Closes every session and leaves the room best-effort, so remaining
    /// members hear about it faster than disconnect detection.
    pub async fn teardown(&mut self) {
        self.close_all_sessions().await;
        let _ = self
            .signaling
            .send(ClientEvent::RoomLeave {
                room_id: self.room_id.clone(),
            })
            .await;
        self.local_media = None;
    }

    async fn close_all_sessions(&mut self) {
        for (remote_id, entry) in self.sessions.drain() {
            let _ = entry.session.close().await;
            let _ = self.events_tx.send(CallEvent::SessionClosed(remote_id));
        }
        self.deferred_signals.clear();
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        if self.local_media.is_none() && self.must_wait_for_media(&event) {
            debug!("queueing signal until local media is ready");
            self.deferred_signals.push_back(event);
            return;
        }
        self.dispatch(event).await;
    }

    /// Offers need local media for the answer's tracks; they queue until the
    /// gate opens. A candidate whose offer is itself still gated waits with
    /// it, since applying it early would hit a session that does not exist
    /// yet. Everything else is handled immediately.
    fn must_wait_for_media(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::Offer { .. } | ServerEvent::RenegotiateOffer { .. } => true,
            ServerEvent::Candidate { from, .. } => {
                !self.sessions.contains_key(from)
                    && self.deferred_signals.iter().any(|queued| {
                        matches!(queued, ServerEvent::Offer { from: sender, .. } if sender == from)
                    })
            }
            _ => false,
        }
    }

    async fn dispatch(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ParticipantJoined { connection_id } => {
                self.on_participant_joined(&connection_id).await;
            }
            ServerEvent::ParticipantLeft { connection_id } => {
                self.on_participant_left(&connection_id).await;
            }
            ServerEvent::Offer { from, payload } => {
                self.on_incoming_offer(&from, &payload, false).await;
            }
            ServerEvent::RenegotiateOffer { from, payload } => {
                self.on_incoming_offer(&from, &payload, true).await;
            }
            ServerEvent::Answer { from, payload }
            | ServerEvent::RenegotiateAnswer { from, payload } => {
                self.on_incoming_answer(&from, &payload).await;
            }
            ServerEvent::RenegotiateRequest { from, kinds } => {
                self.on_renegotiate_request(&from, &kinds).await;
            }
            ServerEvent::Candidate { from, payload } => {
                if let Some(entry) = self.sessions.get(&from) {
                    if let Err(e) = entry.session.add_remote_candidate(&payload).await {
                        warn!(remote_id = %from, error = %e, "bad candidate dropped");
                    }
                }
            }
            ServerEvent::Error { message } => {
                warn!(%message, "coordinator error");
                let _ = self.events_tx.send(CallEvent::CoordinatorError(message));
            }
            ServerEvent::RoomJoined { .. } => {}
        }
    }

    /// A new participant appeared: open an initiator session toward it and
    /// offer, once local media allows.
    async fn on_participant_joined(&mut self, remote_id: &str) {
        if self.sessions.contains_key(remote_id) {
            debug!(remote_id, "session already exists, join notification ignored");
            return;
        }
        let _ = self
            .events_tx
            .send(CallEvent::ParticipantJoined(remote_id.to_owned()));
        if self.create_session(remote_id, Role::Initiator).await.is_err() {
            return;
        }
        if self.local_media.is_some() {
            self.attach_media(remote_id).await;
            self.send_initial_offer(remote_id).await;
        } else if let Some(entry) = self.sessions.get_mut(remote_id) {
            debug!(remote_id, "offer deferred until local media is ready");
            entry.offer_pending = true;
        }
    }

    async fn on_participant_left(&mut self, remote_id: &str) {
        self.purge_deferred(remote_id);
        let Some(entry) = self.sessions.remove(remote_id) else {
            return;
        };
        info!(remote_id, "participant left, closing session");
        let _ = entry.session.close().await;
        let _ = self
            .events_tx
            .send(CallEvent::ParticipantLeft(remote_id.to_owned()));
        let _ = self
            .events_tx
            .send(CallEvent::SessionClosed(remote_id.to_owned()));
    }

    async fn on_incoming_offer(&mut self, remote_id: &str, payload: &str, renegotiation: bool) {
        if !self.sessions.contains_key(remote_id) {
            if renegotiation {
                // Cannot renegotiate a session that was never created.
                warn!(remote_id, "renegotiate-offer for unknown session dropped");
                return;
            }
            if self.create_session(remote_id, Role::Responder).await.is_err() {
                return;
            }
            self.attach_media(remote_id).await;
        }

        let session = Arc::clone(&self.sessions[remote_id].session);
        match session.accept_offer(payload).await {
            Ok(Some(answer)) => {
                let event = if renegotiation {
                    ClientEvent::RenegotiateAnswer {
                        to: remote_id.to_owned(),
                        payload: answer,
                    }
                } else {
                    ClientEvent::Answer {
                        to: remote_id.to_owned(),
                        payload: answer,
                    }
                };
                if self.signaling.send(event).await.is_err() {
                    warn!(remote_id, "failed to send answer");
                    return;
                }
                let _ = self
                    .events_tx
                    .send(CallEvent::SessionStable(remote_id.to_owned()));
                self.drain_renegotiation(remote_id).await;
            }
            Ok(None) => {
                debug!(remote_id, "duplicate offer ignored");
            }
            Err(Error::Negotiation(reason)) => {
                warn!(remote_id, %reason, "offer dropped");
            }
            Err(e) => {
                warn!(remote_id, error = %e, "offer failed, closing session");
                self.fail_session(remote_id).await;
            }
        }
    }

    async fn on_incoming_answer(&mut self, remote_id: &str, payload: &str) {
        let Some(entry) = self.sessions.get(remote_id) else {
            warn!(remote_id, "answer for unknown session dropped");
            return;
        };
        let session = Arc::clone(&entry.session);
        match session.accept_answer(payload).await {
            Ok(()) => {
                let _ = self
                    .events_tx
                    .send(CallEvent::SessionStable(remote_id.to_owned()));
                self.drain_renegotiation(remote_id).await;
            }
            Err(Error::Negotiation(reason)) => {
                warn!(remote_id, %reason, "answer dropped");
            }
            Err(e) => {
                warn!(remote_id, error = %e, "answer failed, closing session");
                self.fail_session(remote_id).await;
            }
        }
    }

    /// The responder side asked for a renegotiation, naming the kinds it
    /// wants to send. Only the initiator ever offers, so glare cannot occur
    /// on a session; the initiator prepares a receive transceiver for every
    /// requested kind it does not already carry, otherwise its re-offer
    /// would lack the m-line and the responder's new track could never flow.
    async fn on_renegotiate_request(&mut self, remote_id: &str, kinds: &[String]) {
        let Some(entry) = self.sessions.get(remote_id) else {
            warn!(remote_id, "renegotiate-request for unknown session dropped");
            return;
        };
        if entry.session.role() != Role::Initiator {
            warn!(remote_id, "renegotiate-request received by responder, dropped");
            return;
        }
        let session = Arc::clone(&entry.session);
        for kind in kinds {
            let kind = match kind.as_str() {
                "audio" => RTPCodecType::Audio,
                "video" => RTPCodecType::Video,
                other => {
                    warn!(remote_id, kind = other, "unknown kind in renegotiate request");
                    continue;
                }
            };
            if let Err(e) = session.ensure_recv_kind(kind).await {
                warn!(remote_id, error = %e, "receive transceiver failed, closing session");
                self.fail_session(remote_id).await;
                return;
            }
        }
        self.send_renegotiation_offer(remote_id).await;
    }

    async fn create_session(&mut self, remote_id: &str, role: Role) -> Result<()> {
        match PeerSession::new(remote_id, role, &self.config).await {
            Ok((session, events)) => {
                self.forward_session_events(remote_id, events);
                self.sessions.insert(
                    remote_id.to_owned(),
                    SessionEntry {
                        session,
                        offer_pending: false,
                    },
                );
                debug!(remote_id, ?role, "session created");
                Ok(())
            }
            Err(e) => {
                warn!(remote_id, error = %e, "failed to create session");
                Err(e)
            }
        }
    }

    /// Remote tracks flow to the application tagged with their session's
    /// remote id; the forwarding task ends with the session's channels.
    fn forward_session_events(&self, remote_id: &str, mut events: SessionEvents) {
        let events_tx = self.events_tx.clone();
        let remote_id = remote_id.to_owned();
        tokio::spawn(async move {
            while let Some(track) = events.remote_tracks.recv().await {
                if events_tx
                    .send(CallEvent::RemoteTrack {
                        remote_id: remote_id.clone(),
                        track,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    /// Attaches the local tracks to the session. Attachment is idempotent per
    /// kind, so racing media-ready against session creation is harmless.
    async fn attach_media(&mut self, remote_id: &str) {
        let Some(media) = self.local_media.clone() else {
            return;
        };
        let Some(entry) = self.sessions.get(remote_id) else {
            return;
        };
        let session = Arc::clone(&entry.session);
        for track in media.tracks() {
            match session.attach_local_track(track).await {
                Ok(TrackAttachment::Added) => {}
                Ok(TrackAttachment::Replaced) => {
                    debug!(remote_id, "track re-attachment replaced existing sender");
                }
                Err(e) => {
                    warn!(remote_id, error = %e, "track attach failed, closing session");
                    self.fail_session(remote_id).await;
                    return;
                }
            }
        }
        self.drain_renegotiation(remote_id).await;
    }

    /// Attaches a single track to every session, post-handshake additions
    /// included. Sessions mid-negotiation queue the cycle for later.
    pub async fn attach_track_everywhere(&mut self, track: Arc<dyn TrackLocal + Send + Sync>) {
        let remotes: Vec<String> = self.sessions.keys().cloned().collect();
        for remote_id in remotes {
            let Some(entry) = self.sessions.get(&remote_id) else {
                continue;
            };
            let session = Arc::clone(&entry.session);
            if let Err(e) = session.attach_local_track(Arc::clone(&track)).await {
                warn!(%remote_id, error = %e, "track attach failed");
                continue;
            }
            self.drain_renegotiation(&remote_id).await;
        }
    }

    async fn send_initial_offer(&mut self, remote_id: &str) {
        let Some(entry) = self.sessions.get(remote_id) else {
            return;
        };
        let session = Arc::clone(&entry.session);
        match session.create_offer().await {
            Ok(payload) => {
                let sent = self
                    .signaling
                    .send(ClientEvent::Offer {
                        to: remote_id.to_owned(),
                        payload,
                    })
                    .await;
                if sent.is_err() {
                    warn!(remote_id, "failed to send offer");
                }
            }
            Err(e) => {
                warn!(remote_id, error = %e, "offer creation failed, closing session");
                self.fail_session(remote_id).await;
            }
        }
    }

    async fn send_renegotiation_offer(&mut self, remote_id: &str) {
        let Some(entry) = self.sessions.get(remote_id) else {
            return;
        };
        let session = Arc::clone(&entry.session);
        match session.create_offer().await {
            Ok(payload) => {
                let sent = self
                    .signaling
                    .send(ClientEvent::RenegotiateOffer {
                        to: remote_id.to_owned(),
                        payload,
                    })
                    .await;
                if sent.is_err() {
                    warn!(remote_id, "failed to send renegotiation offer");
                }
            }
            Err(Error::Negotiation(reason)) => {
                // Still mid-cycle; re-queue for the next stable transition.
                debug!(remote_id, %reason, "renegotiation postponed");
                if let Some(entry) = self.sessions.get(remote_id) {
                    entry.session.queue_renegotiation();
                }
            }
            Err(e) => {
                warn!(remote_id, error = %e, "renegotiation failed, closing session");
                self.fail_session(remote_id).await;
            }
        }
    }

    /// Fires a queued renegotiation if the session is back at `stable`.
    /// Initiators offer directly; responders ask the initiator to offer.
    async fn drain_renegotiation(&mut self, remote_id: &str) {
        let Some(entry) = self.sessions.get(remote_id) else {
            return;
        };
        if entry.session.negotiation_state().await != NegotiationState::Stable {
            return;
        }
        if !entry.session.take_queued_renegotiation() {
            return;
        }
        match entry.session.role() {
            Role::Initiator => self.send_renegotiation_offer(remote_id).await,
            Role::Responder => {
                let kinds = entry
                    .session
                    .sender_kinds()
                    .await
                    .iter()
                    .map(|kind| kind.to_string())
                    .collect();
                let sent = self
                    .signaling
                    .send(ClientEvent::RenegotiateRequest {
                        to: remote_id.to_owned(),
                        kinds,
                    })
                    .await;
                if sent.is_err() {
                    warn!(remote_id, "failed to send renegotiation request");
                }
            }
        }
    }

    /// Per-session containment: a failed session is closed and discarded
    /// without touching the others.
    async fn fail_session(&mut self, remote_id: &str) {
        self.purge_deferred(remote_id);
        if let Some(entry) = self.sessions.remove(remote_id) {
            let _ = entry.session.close().await;
            let _ = self
                .events_tx
                .send(CallEvent::SessionClosed(remote_id.to_owned()));
        }
    }

    /// Drops media-gated signals from a remote whose session is gone, so they
    /// cannot resurrect it once local media arrives.
    fn purge_deferred(&mut self, remote_id: &str) {
        self.deferred_signals.retain(|event| {
            !matches!(
                event,
                ServerEvent::Offer { from, .. }
                    | ServerEvent::RenegotiateOffer { from, .. }
                    | ServerEvent::Candidate { from, .. }
                    if from == remote_id
            )
        });
    }
}
