//! End-to-end call flow: two orchestrators negotiating through a real
//! coordinator. Events are pumped one at a time, which makes the exchange
//! deterministic: join → offer → answer → stable, then renegotiation from
//! both roles, then disconnect teardown.

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use roomlink::{
    CallEvent, CallOrchestrator, ClientEvent, Coordinator, LocalMedia, PeerSession, Role,
    ServerEvent, SessionConfig, SignalingClient,
};

const STEP_TIMEOUT: Duration = Duration::from_secs(20);

async fn start_coordinator() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let coordinator = Coordinator::new();
    tokio::spawn(async move {
        let _ = coordinator.serve(listener).await;
    });
    format!("ws://{addr}")
}

fn local_config() -> SessionConfig {
    SessionConfig {
        ice_servers: vec![],
    }
}

async fn pump(orchestrator: &mut CallOrchestrator) {
    let more = timeout(STEP_TIMEOUT, orchestrator.poll_event())
        .await
        .expect("timed out waiting for coordinator event")
        .expect("orchestrator failed");
    assert!(more, "signaling transport closed unexpectedly");
}

async fn expect_stable(events: &mut mpsc::UnboundedReceiver<CallEvent>, remote: &str) {
    loop {
        match timeout(STEP_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for call event")
            .expect("event channel closed")
        {
            CallEvent::SessionStable(id) => {
                assert_eq!(id, remote);
                return;
            }
            CallEvent::ParticipantJoined(_) | CallEvent::RemoteTrack { .. } => {}
            other => panic!("unexpected call event: {other:?}"),
        }
    }
}

/// Brings two audio-only orchestrators in room `r1` to a stable session pair.
async fn stable_audio_call(
    url: &str,
) -> (
    CallOrchestrator,
    mpsc::UnboundedReceiver<CallEvent>,
    CallOrchestrator,
    mpsc::UnboundedReceiver<CallEvent>,
) {
    let (mut a, mut a_events) = CallOrchestrator::join(url, "r1", local_config())
        .await
        .unwrap();
    a.on_local_media_ready(LocalMedia::new().with_audio("alice"))
        .await;
    let (mut b, mut b_events) = CallOrchestrator::join(url, "r1", local_config())
        .await
        .unwrap();
    b.on_local_media_ready(LocalMedia::new().with_audio("bob"))
        .await;

    let a_id = a.connection_id().to_owned();
    let b_id = b.connection_id().to_owned();
    pump(&mut a).await;
    pump(&mut b).await;
    pump(&mut a).await;
    expect_stable(&mut b_events, &a_id).await;
    expect_stable(&mut a_events, &b_id).await;
    (a, a_events, b, b_events)
}

/// Joins through a bare signaling client, standing in for a trickle-capable
/// implementation of the protocol.
async fn raw_join(url: &str, room_id: &str) -> SignalingClient {
    let mut client = SignalingClient::connect(url).await.unwrap();
    client
        .send(ClientEvent::RoomJoin {
            room_id: room_id.to_owned(),
        })
        .await
        .unwrap();
    match timeout(STEP_TIMEOUT, client.receive())
        .await
        .expect("timed out waiting for join ack")
        .expect("signaling channel closed")
    {
        ServerEvent::RoomJoined { .. } => client,
        other => panic!("expected room:joined, got {other:?}"),
    }
}

const HOST_CANDIDATE: &str = concat!(
    r#"{"candidate":"candidate:1 1 udp 2122252543 127.0.0.1 54321 typ host","#,
    r#""sdpMid":"0","sdpMLineIndex":0,"usernameFragment":null}"#
);

#[tokio::test]
async fn two_party_call_negotiates_renegotiates_and_tears_down() {
    let url = start_coordinator().await;

    let (mut a, mut a_events) = CallOrchestrator::join(&url, "r1", local_config())
        .await
        .unwrap();
    a.on_local_media_ready(LocalMedia::new().with_audio("alice"))
        .await;

    let (mut b, mut b_events) = CallOrchestrator::join(&url, "r1", local_config())
        .await
        .unwrap();
    b.on_local_media_ready(LocalMedia::new().with_audio("bob"))
        .await;

    let a_id = a.connection_id().to_owned();
    let b_id = b.connection_id().to_owned();

    // A learns of B and offers; B answers; A applies the answer.
    pump(&mut a).await;
    pump(&mut b).await;
    pump(&mut a).await;
    expect_stable(&mut b_events, &a_id).await;
    expect_stable(&mut a_events, &b_id).await;
    assert_eq!(a.session_count(), 1);
    assert_eq!(b.session_count(), 1);

    // Initiator-side renegotiation: A adds video after the handshake.
    let video = LocalMedia::new().with_video("alice").video().unwrap();
    a.attach_track_everywhere(video).await; // sends renegotiate-offer
    pump(&mut b).await; // B answers
    pump(&mut a).await; // A applies the renegotiation answer
    expect_stable(&mut b_events, &a_id).await;
    expect_stable(&mut a_events, &b_id).await;

    // Responder-side renegotiation: B adds video, which asks A to re-offer.
    let video = LocalMedia::new().with_video("bob").video().unwrap();
    b.attach_track_everywhere(video).await; // sends renegotiate-request
    pump(&mut a).await; // A re-offers
    pump(&mut b).await; // B answers
    pump(&mut a).await; // A applies the answer
    expect_stable(&mut b_events, &a_id).await;
    expect_stable(&mut a_events, &b_id).await;

    // B leaves: A hears participant:left and closes the session for B.
    b.teardown().await;
    pump(&mut a).await;
    assert_eq!(a.session_count(), 0);

    let mut saw_left = false;
    let mut saw_closed = false;
    while !(saw_left && saw_closed) {
        match timeout(STEP_TIMEOUT, a_events.recv())
            .await
            .expect("timed out waiting for teardown events")
            .expect("event channel closed")
        {
            CallEvent::ParticipantLeft(id) => {
                assert_eq!(id, b_id);
                saw_left = true;
            }
            CallEvent::SessionClosed(id) => {
                assert_eq!(id, b_id);
                saw_closed = true;
            }
            CallEvent::RemoteTrack { .. } => {}
            other => panic!("unexpected call event: {other:?}"),
        }
    }

    a.teardown().await;
}

#[tokio::test]
async fn offer_before_local_media_is_queued_not_dropped() {
    let url = start_coordinator().await;

    // A has media and will offer immediately; B withholds media.
    let (mut a, mut a_events) = CallOrchestrator::join(&url, "r1", local_config())
        .await
        .unwrap();
    a.on_local_media_ready(LocalMedia::new().with_audio("alice"))
        .await;

    let (mut b, mut b_events) = CallOrchestrator::join(&url, "r1", local_config())
        .await
        .unwrap();

    let a_id = a.connection_id().to_owned();
    let b_id = b.connection_id().to_owned();

    pump(&mut a).await; // A offers toward B
    pump(&mut b).await; // B queues the offer behind the media gate
    assert_eq!(b.session_count(), 0);

    // Media arrives: the queued offer is answered and the call completes.
    b.on_local_media_ready(LocalMedia::new().with_audio("bob"))
        .await;
    assert_eq!(b.session_count(), 1);
    pump(&mut a).await;
    expect_stable(&mut b_events, &a_id).await;
    expect_stable(&mut a_events, &b_id).await;

    a.teardown().await;
    b.teardown().await;
}

#[tokio::test]
async fn queued_offer_from_departed_participant_is_discarded() {
    let url = start_coordinator().await;

    let (mut a, _a_events) = CallOrchestrator::join(&url, "r1", local_config())
        .await
        .unwrap();
    a.on_local_media_ready(LocalMedia::new().with_audio("alice"))
        .await;

    let (mut b, _b_events) = CallOrchestrator::join(&url, "r1", local_config())
        .await
        .unwrap();

    pump(&mut a).await; // A offers toward B
    pump(&mut b).await; // B queues the offer, no media yet
    assert_eq!(b.session_count(), 0);

    // A leaves before B's media shows up; the queued offer must not
    // resurrect a session for a participant that is gone.
    a.teardown().await;
    pump(&mut b).await; // participant:left purges the queued offer

    b.on_local_media_ready(LocalMedia::new().with_audio("bob"))
        .await;
    assert_eq!(b.session_count(), 0);

    b.teardown().await;
}

#[tokio::test]
async fn deferred_offer_waits_for_initiator_media() {
    let url = start_coordinator().await;

    // A joins without media; B's arrival must not produce an offer yet.
    let (mut a, mut a_events) = CallOrchestrator::join(&url, "r1", local_config())
        .await
        .unwrap();
    let (mut b, mut b_events) = CallOrchestrator::join(&url, "r1", local_config())
        .await
        .unwrap();
    b.on_local_media_ready(LocalMedia::new().with_audio("bob"))
        .await;

    let a_id = a.connection_id().to_owned();
    let b_id = b.connection_id().to_owned();

    pump(&mut a).await; // participant:joined, offer deferred
    assert_eq!(a.session_count(), 1);

    a.on_local_media_ready(LocalMedia::new().with_audio("alice"))
        .await; // deferred offer goes out now
    pump(&mut b).await;
    pump(&mut a).await;
    expect_stable(&mut b_events, &a_id).await;
    expect_stable(&mut a_events, &b_id).await;

    a.teardown().await;
    b.teardown().await;
}

#[tokio::test]
async fn transport_loss_closes_active_sessions() {
    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    // The coordinator gets its own runtime so the test can sever every
    // connection at once by shutting it down.
    let server = std::thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();
            let coordinator = Coordinator::new();
            tokio::select! {
                _ = coordinator.serve(listener) => {}
                _ = stop_rx => {}
            }
        });
    });
    let url = format!("ws://{}", addr_rx.recv().unwrap());

    let (mut a, mut a_events, b, _b_events) = stable_audio_call(&url).await;
    let b_id = b.connection_id().to_owned();
    assert_eq!(a.session_count(), 1);

    stop_tx.send(()).unwrap();
    server.join().unwrap();

    // Pump until the transport loss is reported.
    loop {
        let more = timeout(STEP_TIMEOUT, a.poll_event())
            .await
            .expect("timed out waiting for transport loss")
            .expect("orchestrator failed");
        if !more {
            break;
        }
    }
    assert_eq!(
        a.session_count(),
        0,
        "sessions must be closed when signaling is lost"
    );
    let mut closed = false;
    while let Ok(event) = a_events.try_recv() {
        if let CallEvent::SessionClosed(id) = event {
            assert_eq!(id, b_id);
            closed = true;
        }
    }
    assert!(closed, "session close was not surfaced");
}

#[tokio::test]
async fn abrupt_disconnect_mid_call_closes_the_peer_session() {
    let url = start_coordinator().await;
    let (mut a, mut a_events, b, b_events) = stable_audio_call(&url).await;
    let b_id = b.connection_id().to_owned();
    assert_eq!(a.session_count(), 1);

    // No goodbye: dropping B severs its transport and the coordinator's
    // disconnect sweep announces the departure.
    drop(b);
    drop(b_events);

    pump(&mut a).await; // participant:left
    assert_eq!(a.session_count(), 0);

    let mut saw_left = false;
    let mut saw_closed = false;
    while !(saw_left && saw_closed) {
        match timeout(STEP_TIMEOUT, a_events.recv())
            .await
            .expect("timed out waiting for departure events")
            .expect("event channel closed")
        {
            CallEvent::ParticipantLeft(id) => {
                assert_eq!(id, b_id);
                saw_left = true;
            }
            CallEvent::SessionClosed(id) => {
                assert_eq!(id, b_id);
                saw_closed = true;
            }
            CallEvent::RemoteTrack { .. } => {}
            other => panic!("unexpected call event: {other:?}"),
        }
    }
    a.teardown().await;
}

#[tokio::test]
async fn responder_video_in_audio_only_call_reaches_stable() {
    let url = start_coordinator().await;
    let (mut a, mut a_events, mut b, mut b_events) = stable_audio_call(&url).await;
    let a_id = a.connection_id().to_owned();
    let b_id = b.connection_id().to_owned();

    // B is the responder; its request names video so A, which has no video
    // sender of its own, re-offers with a receive m-line for it.
    let video = LocalMedia::new().with_video("bob").video().unwrap();
    b.attach_track_everywhere(video).await; // sends renegotiate-request
    pump(&mut a).await; // A prepares the receive transceiver and re-offers
    pump(&mut b).await; // B answers, video sender included
    pump(&mut a).await; // A applies the answer
    expect_stable(&mut b_events, &a_id).await;
    expect_stable(&mut a_events, &b_id).await;

    a.teardown().await;
    b.teardown().await;
}

#[tokio::test]
async fn trickled_candidate_waits_with_its_gated_offer() {
    let url = start_coordinator().await;

    let mut t = raw_join(&url, "r1").await;
    let (mut a, _a_events) = CallOrchestrator::join(&url, "r1", local_config())
        .await
        .unwrap();
    let a_id = a.connection_id().to_owned();
    match timeout(STEP_TIMEOUT, t.receive()).await.unwrap().unwrap() {
        ServerEvent::ParticipantJoined { connection_id } => assert_eq!(connection_id, a_id),
        other => panic!("expected participant:joined, got {other:?}"),
    }

    // The existing member offers toward the joiner and trickles a candidate
    // right behind the offer, while A's media is still missing.
    let (offerer, _events) = PeerSession::new(&a_id, Role::Initiator, &local_config())
        .await
        .unwrap();
    offerer
        .attach_local_track(LocalMedia::new().with_audio("trickle").audio().unwrap())
        .await
        .unwrap();
    let payload = offerer.create_offer().await.unwrap();
    t.send(ClientEvent::Offer {
        to: a_id.clone(),
        payload,
    })
    .await
    .unwrap();
    t.send(ClientEvent::Candidate {
        to: a_id.clone(),
        payload: HOST_CANDIDATE.to_owned(),
    })
    .await
    .unwrap();

    pump(&mut a).await; // offer gated on media
    pump(&mut a).await; // candidate waits with it
    assert_eq!(a.session_count(), 0);
    assert_eq!(
        a.deferred_signal_count(),
        2,
        "the candidate must wait with its offer"
    );

    a.on_local_media_ready(LocalMedia::new().with_audio("alice"))
        .await;
    assert_eq!(a.deferred_signal_count(), 0);
    assert_eq!(a.session_count(), 1);

    // The gated offer was answered once media arrived.
    match timeout(STEP_TIMEOUT, t.receive()).await.unwrap().unwrap() {
        ServerEvent::Answer { from, .. } => assert_eq!(from, a_id),
        other => panic!("expected signal:answer, got {other:?}"),
    }

    offerer.close().await.unwrap();
    a.teardown().await;
}

#[tokio::test]
async fn gated_signals_from_a_departed_sender_are_purged() {
    let url = start_coordinator().await;

    let mut t = raw_join(&url, "r1").await;
    let (mut a, _a_events) = CallOrchestrator::join(&url, "r1", local_config())
        .await
        .unwrap();
    let a_id = a.connection_id().to_owned();
    match timeout(STEP_TIMEOUT, t.receive()).await.unwrap().unwrap() {
        ServerEvent::ParticipantJoined { .. } => {}
        other => panic!("expected participant:joined, got {other:?}"),
    }

    let (offerer, _events) = PeerSession::new(&a_id, Role::Initiator, &local_config())
        .await
        .unwrap();
    offerer
        .attach_local_track(LocalMedia::new().with_audio("trickle").audio().unwrap())
        .await
        .unwrap();
    let payload = offerer.create_offer().await.unwrap();
    t.send(ClientEvent::Offer {
        to: a_id.clone(),
        payload,
    })
    .await
    .unwrap();
    t.send(ClientEvent::Candidate {
        to: a_id,
        payload: HOST_CANDIDATE.to_owned(),
    })
    .await
    .unwrap();
    pump(&mut a).await;
    pump(&mut a).await;
    assert_eq!(a.deferred_signal_count(), 2);

    // The sender drops; its gated offer and candidate go with it.
    drop(t);
    pump(&mut a).await; // participant:left
    assert_eq!(a.deferred_signal_count(), 0);

    a.on_local_media_ready(LocalMedia::new().with_audio("alice"))
        .await;
    assert_eq!(a.session_count(), 0);

    offerer.close().await.unwrap();
    a.teardown().await;
}
