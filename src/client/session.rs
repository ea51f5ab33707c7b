//! Per-remote peer session: one underlying peer connection plus the explicit
//! offer/answer state machine driven by relayed signaling.
//!
//! Every operation that transitions negotiation state takes the session's
//! negotiation lock for its whole duration, so no two transitions for the
//! same session are ever in flight. Offers and answers are non-trickle: the
//! local description is sent only after ICE gathering completes, so the
//! relayed payload is self-contained.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::client::media::SessionConfig;
use crate::error::{Error, Result};

/// Which side of the initial handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Negotiation progress. Initiator path: Idle → OfferSent → Stable.
/// Responder path: Idle → OfferReceived → AnswerSent → Stable. Renegotiation
/// re-enters either path from Stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    Stable,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Idle => write!(f, "idle"),
            NegotiationState::OfferSent => write!(f, "offer_sent"),
            NegotiationState::OfferReceived => write!(f, "offer_received"),
            NegotiationState::AnswerSent => write!(f, "answer_sent"),
            NegotiationState::Stable => write!(f, "stable"),
        }
    }
}

/// Data-plane connection state, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::New => write!(f, "new"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

impl From<RTCPeerConnectionState> for SessionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => SessionState::New,
            RTCPeerConnectionState::Connecting => SessionState::Connecting,
            RTCPeerConnectionState::Connected => SessionState::Connected,
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                SessionState::Disconnected
            }
            RTCPeerConnectionState::Closed => SessionState::Closed,
            _ => SessionState::New,
        }
    }
}

/// Outcome of [`PeerSession::attach_local_track`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackAttachment {
    /// First track of its kind; a new sender was added.
    Added,
    /// A track of this kind was already attached; its sender now carries the
    /// new track. Never a second sender for the same kind.
    Replaced,
}

/// Channels handed out at session construction. Listener lifetime equals
/// session lifetime: dropping the session tears the underlying handlers down
/// with the peer connection.
pub struct SessionEvents {
    /// Inbound media tracks from the remote participant. The most recent
    /// track of a kind supersedes earlier ones for display purposes.
    pub remote_tracks: mpsc::UnboundedReceiver<Arc<TrackRemote>>,
    /// Data-plane state transitions.
    pub states: watch::Receiver<SessionState>,
}

#[derive(Default)]
struct TrackSenders {
    audio: Option<Arc<RTCRtpSender>>,
    video: Option<Arc<RTCRtpSender>>,
}

/// Kinds for which a receive-only transceiver has been added.
#[derive(Default)]
struct RecvSlots {
    audio: bool,
    video: bool,
}

impl TrackSenders {
    fn slot(&mut self, kind: RTPCodecType) -> Result<&mut Option<Arc<RTCRtpSender>>> {
        match kind {
            RTPCodecType::Audio => Ok(&mut self.audio),
            RTPCodecType::Video => Ok(&mut self.video),
            RTPCodecType::Unspecified => {
                Err(Error::Media("track has unspecified kind".to_owned()))
            }
        }
    }
}

/// Negotiation and data-plane state between the local participant and exactly
/// one remote connection. Owned by the orchestrator, never shared
/// process-wide.
pub struct PeerSession {
    remote_id: String,
    role: Role,
    pc: Arc<RTCPeerConnection>,
    negotiation: Mutex<NegotiationState>,
    senders: Mutex<TrackSenders>,
    recv_slots: Mutex<RecvSlots>,
    last_remote_offer: Mutex<Option<String>>,
    queued_renegotiation: AtomicBool,
    closed: AtomicBool,
    state_tx: watch::Sender<SessionState>,
}

impl PeerSession {
    pub async fn new(
        remote_id: &str,
        role: Role,
        config: &SessionConfig,
    ) -> Result<(Arc<Self>, SessionEvents)> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let pc = Arc::new(api.new_peer_connection(config.rtc_configuration()).await?);

        let (track_tx, track_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::New);

        let remote = remote_id.to_owned();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let track_tx = track_tx.clone();
            let remote = remote.clone();
            Box::pin(async move {
                debug!(remote_id = %remote, kind = %track.kind(), "remote track");
                let _ = track_tx.send(track);
            })
        }));

        let watch_tx = state_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let watch_tx = watch_tx.clone();
            Box::pin(async move {
                let _ = watch_tx.send(SessionState::from(state));
            })
        }));

        let session = Arc::new(Self {
            remote_id: remote_id.to_owned(),
            role,
            pc,
            negotiation: Mutex::new(NegotiationState::Idle),
            senders: Mutex::new(TrackSenders::default()),
            recv_slots: Mutex::new(RecvSlots::default()),
            last_remote_offer: Mutex::new(None),
            queued_renegotiation: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state_tx,
        });
        let events = SessionEvents {
            remote_tracks: track_rx,
            states: state_rx,
        };
        Ok((session, events))
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn negotiation_state(&self) -> NegotiationState {
        *self.negotiation.lock().await
    }

    /// Produces a local offer (JSON session description) to relay to the
    /// remote side. Valid from `idle` (initial) or `stable` (renegotiation).
    pub async fn create_offer(&self) -> Result<String> {
        let mut negotiation = self.negotiation.lock().await;
        match *negotiation {
            NegotiationState::Idle | NegotiationState::Stable => {}
            state => {
                return Err(Error::Negotiation(format!(
                    "create_offer for {} invalid in state {state}",
                    self.remote_id
                )))
            }
        }

        let offer = self.pc.create_offer(None).await?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await?;
        let _ = gathered.recv().await;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Negotiation("no local description after offer".to_owned()))?;
        *negotiation = NegotiationState::OfferSent;
        Ok(serde_json::to_string(&local)?)
    }

    /// Applies a remote offer and produces the matching answer. Valid from
    /// `idle` (initial) or `stable` (renegotiation). A byte-identical
    /// retransmission of the last accepted offer is a guarded no-op and
    /// returns `None`.
    pub async fn accept_offer(&self, payload: &str) -> Result<Option<String>> {
        let mut negotiation = self.negotiation.lock().await;
        match *negotiation {
            NegotiationState::Idle | NegotiationState::Stable => {}
            state => {
                return Err(Error::Negotiation(format!(
                    "offer from {} arrived in state {state}",
                    self.remote_id
                )))
            }
        }

        let mut last_offer = self.last_remote_offer.lock().await;
        if last_offer.as_deref() == Some(payload) {
            debug!(remote_id = %self.remote_id, "ignoring retransmitted offer");
            return Ok(None);
        }

        let offer: RTCSessionDescription = serde_json::from_str(payload)?;
        self.pc.set_remote_description(offer).await?;
        *negotiation = NegotiationState::OfferReceived;

        let answer = self.pc.create_answer(None).await?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(answer).await?;
        let _ = gathered.recv().await;
        *negotiation = NegotiationState::AnswerSent;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Negotiation("no local description after answer".to_owned()))?;
        // answer_sent collapses into stable as soon as the answer is handed
        // back for relaying.
        *last_offer = Some(payload.to_owned());
        *negotiation = NegotiationState::Stable;
        Ok(Some(serde_json::to_string(&local)?))
    }

    /// Applies a remote answer. Valid only from `offer_sent`; anything else
    /// is a protocol violation to be logged and dropped by the caller.
    pub async fn accept_answer(&self, payload: &str) -> Result<()> {
        let mut negotiation = self.negotiation.lock().await;
        if *negotiation != NegotiationState::OfferSent {
            return Err(Error::Negotiation(format!(
                "answer from {} with no offer in flight (state {})",
                self.remote_id, *negotiation
            )));
        }

        let answer: RTCSessionDescription = serde_json::from_str(payload)?;
        self.pc.set_remote_description(answer).await?;
        *negotiation = NegotiationState::Stable;
        Ok(())
    }

    /// Attaches a local track, at most one per kind. Re-attaching a kind that
    /// already has a sender replaces the carried track instead of adding a
    /// duplicate sender. Attaching after the initial handshake queues a
    /// renegotiation for the orchestrator to drive.
    pub async fn attach_local_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<TrackAttachment> {
        let kind = track.kind();
        let mut senders = self.senders.lock().await;
        if let Some(sender) = senders.slot(kind)?.as_ref() {
            sender.replace_track(Some(track)).await?;
            debug!(remote_id = %self.remote_id, %kind, "replaced local track");
            return Ok(TrackAttachment::Replaced);
        }
        let sender = self.pc.add_track(track).await?;
        *senders.slot(kind)? = Some(sender);
        drop(senders);

        let negotiation = self.negotiation.lock().await;
        if *negotiation != NegotiationState::Idle {
            // The new sender is not covered by the current description;
            // queued here, fired by the orchestrator once stable.
            self.queued_renegotiation.store(true, Ordering::SeqCst);
        }
        debug!(remote_id = %self.remote_id, %kind, "attached local track");
        Ok(TrackAttachment::Added)
    }

    /// Number of live senders, for duplicate-attachment checks.
    pub async fn sender_count(&self) -> usize {
        self.pc.get_senders().await.len()
    }

    /// Kinds this session currently sends. Carried in renegotiation requests
    /// so the offering side knows what it must be able to receive.
    pub async fn sender_kinds(&self) -> Vec<RTPCodecType> {
        let senders = self.senders.lock().await;
        let mut kinds = Vec::new();
        if senders.audio.is_some() {
            kinds.push(RTPCodecType::Audio);
        }
        if senders.video.is_some() {
            kinds.push(RTPCodecType::Video);
        }
        kinds
    }

    /// Guarantees the next offer carries an m-line able to receive this kind.
    /// A kind the session already sends comes with its own m-line; otherwise
    /// a receive-only transceiver is added, once.
    pub async fn ensure_recv_kind(&self, kind: RTPCodecType) -> Result<()> {
        {
            let mut senders = self.senders.lock().await;
            if senders.slot(kind)?.is_some() {
                return Ok(());
            }
        }
        let mut recv = self.recv_slots.lock().await;
        let slot = match kind {
            RTPCodecType::Audio => &mut recv.audio,
            RTPCodecType::Video => &mut recv.video,
            RTPCodecType::Unspecified => {
                return Err(Error::Media("cannot receive unspecified kind".to_owned()))
            }
        };
        if *slot {
            return Ok(());
        }
        self.pc
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        *slot = true;
        debug!(remote_id = %self.remote_id, %kind, "added receive transceiver");
        Ok(())
    }

    /// Applies a relayed ICE candidate from a trickle-capable remote.
    pub async fn add_remote_candidate(&self, payload: &str) -> Result<()> {
        let candidate: RTCIceCandidateInit = serde_json::from_str(payload)?;
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    /// Takes the queued renegotiation flag, if set. The orchestrator calls
    /// this whenever the session reaches `stable`.
    pub fn take_queued_renegotiation(&self) -> bool {
        self.queued_renegotiation.swap(false, Ordering::SeqCst)
    }

    /// Re-queues a renegotiation that could not be fired yet (negotiation
    /// already in flight). Drained at the next `stable` transition.
    pub fn queue_renegotiation(&self) {
        self.queued_renegotiation.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tears the peer connection down. Idempotent and valid from any state;
    /// queued work for the session is discarded.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.queued_renegotiation.store(false, Ordering::SeqCst);
        {
            let mut senders = self.senders.lock().await;
            senders.audio = None;
            senders.video = None;
        }
        if let Err(e) = self.pc.close().await {
            warn!(remote_id = %self.remote_id, error = %e, "peer connection close");
        }
        let _ = self.state_tx.send(SessionState::Closed);
        Ok(())
    }
}
