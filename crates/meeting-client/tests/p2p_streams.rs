//! P2P side-channel tests: handshake over the data channel, stream
//! announcements, nested per-stream signaling and screen-share
//! publication.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use client_test_utils::{MockMediaPeer, MockPeerProvider, TransportHarness};
use meeting_client::peer::{MediaKind, MediaPeer, MediaStream, MediaTrack, PeerEvent};
use meeting_client::{Client, ClientEvent, ClientOptions};
use serde_json::{json, Value};
use signaling_protocol::envelope::{Envelope, Hello, Payload, UserIdentity};
use signaling_protocol::webrtc::{WebRtcMessage, WebRtcSubtype};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Rig {
    client: Client,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    harness: TransportHarness,
    provider: Arc<MockPeerProvider>,
}

fn rig() -> Rig {
    let provider = MockPeerProvider::new();
    let (handle, transport_events, harness) = TransportHarness::new();
    let (client, events) = Client::with_transport(
        ClientOptions::new("https://meet.example.com"),
        provider.clone(),
        handle,
        transport_events,
    );
    Rig {
        client,
        events,
        harness,
        provider,
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Wait for a condition driven by background tasks.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Establish a call from "alice" to "bob" and bring the parent data
/// channel up, completing the side-channel handshake. Returns the
/// parent mock peer.
async fn connected_parent(rig: &mut Rig) -> Arc<MockMediaPeer> {
    rig.harness.push_message(Envelope::new(Payload::Hello(Hello {
        identity: UserIdentity {
            id: "alice".to_string(),
            name: String::new(),
        },
    })));
    loop {
        if matches!(next_event(&mut rig.events).await, ClientEvent::Hello { .. }) {
            break;
        }
    }

    let call = {
        let client = rig.client.clone();
        tokio::spawn(async move { client.do_call("bob").await })
    };
    let (envelope, reply) = rig.harness.expect_request().await;
    let Payload::Webrtc(request) = &envelope.payload else {
        panic!("expected webrtc request");
    };
    let mut answer = WebRtcMessage::new(WebRtcSubtype::WebrtcCall);
    answer.source = "bob".to_string();
    answer.channel = "ch-1".to_string();
    answer.hash = "H".to_string();
    answer.state = "b0b0b0b0b0b0".to_string();
    answer.data = Some(json!({"accept": true, "state": request.state}));
    reply
        .send(Ok(Envelope {
            id: 100,
            reply_to: Some(envelope.id),
            payload: Payload::Webrtc(answer),
        }))
        .unwrap();
    call.await.unwrap().unwrap();
    let _ = rig.harness.expect_send().await; // renegotiate wake-up

    let parent = rig.provider.peer(0);
    parent.set_connected(true);
    parent.emit(PeerEvent::Connect);

    // Our handshake goes out over the data channel.
    let parent_for_wait = Arc::clone(&parent);
    eventually(move || !parent_for_wait.sent_texts().is_empty()).await;
    let handshake: Value = serde_json::from_str(&parent.take_sent_texts()[0]).unwrap();
    assert_eq!(handshake["type"], "p2p");
    assert_eq!(handshake["subtype"], "handshake");
    assert_eq!(handshake["v"], 1);
    let our_ts = handshake["ts"].as_i64().unwrap();
    assert!(our_ts > 0);

    // The remote handshake gets a reply echoing its timestamp.
    parent.emit(PeerEvent::Data(
        json!({"type": "p2p", "subtype": "handshake", "ts": 555, "v": 1}).to_string(),
    ));
    let parent_for_wait = Arc::clone(&parent);
    eventually(move || !parent_for_wait.sent_texts().is_empty()).await;
    let reply_msg: Value = serde_json::from_str(&parent.take_sent_texts()[0]).unwrap();
    assert_eq!(reply_msg["subtype"], "handshake_reply");
    assert_eq!(reply_msg["ts"], 555);

    // Their reply to ours completes the handshake.
    parent.emit(PeerEvent::Data(
        json!({"type": "p2p", "subtype": "handshake_reply", "ts": our_ts, "v": 1}).to_string(),
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    parent
}

#[tokio::test]
async fn test_remote_screenshare_announcement() {
    let mut rig = rig();
    let parent = connected_parent(&mut rig).await;

    parent.emit(PeerEvent::Data(
        json!({
            "type": "p2p",
            "subtype": "announce_streams",
            "v": 1,
            "streams": [
                {"id": "s1", "kind": "screenshare", "token": "00ff00ff00ff00ff", "v": 1},
            ],
        })
        .to_string(),
    ));

    // A receive-only sub-connection comes up; being the non-initiator of
    // the parent we wake the announcer up with a noop renegotiate.
    let provider = Arc::clone(&rig.provider);
    eventually(move || provider.created_count() == 2).await;
    let sub = rig.provider.last().unwrap();
    assert!(sub.recv_video);
    assert!(!sub.initiator);
    assert!(sub.stream_ids.is_empty());

    let parent_for_wait = Arc::clone(&parent);
    eventually(move || !parent_for_wait.sent_texts().is_empty()).await;
    let wake: Value = serde_json::from_str(&parent.take_sent_texts()[0]).unwrap();
    assert_eq!(wake["type"], "webrtc");
    assert_eq!(wake["subtype"], "webrtc_signal");
    assert_eq!(wake["source"], "00ff00ff00ff00ff");
    assert_eq!(wake["data"], json!({"renegotiate": true, "noop": true}));
}

#[tokio::test]
async fn test_nested_signal_routing_by_token() {
    let mut rig = rig();
    let parent = connected_parent(&mut rig).await;

    parent.emit(PeerEvent::Data(
        json!({
            "type": "p2p",
            "subtype": "announce_streams",
            "v": 1,
            "streams": [
                {"id": "s1", "kind": "screenshare", "token": "00ff00ff00ff00ff", "v": 1},
            ],
        })
        .to_string(),
    ));
    let provider = Arc::clone(&rig.provider);
    eventually(move || provider.created_count() == 2).await;
    let sub = rig.provider.peer(1);

    // A real signal reaches the sub-connection.
    parent.emit(PeerEvent::Data(
        json!({
            "type": "webrtc",
            "subtype": "webrtc_signal",
            "source": "00ff00ff00ff00ff",
            "pcid": "remote-sub-1",
            "v": 20_180_703_u64,
            "data": {"sdp": "sub-offer", "type": "offer"},
        })
        .to_string(),
    ));
    let sub_for_wait = Arc::clone(&sub);
    eventually(move || !sub_for_wait.received_signals().is_empty()).await;
    assert_eq!(
        sub.received_signals(),
        vec![json!({"sdp": "sub-offer", "type": "offer"})]
    );

    // A noop wake-up is dropped before the connection.
    parent.emit(PeerEvent::Data(
        json!({
            "type": "webrtc",
            "subtype": "webrtc_signal",
            "source": "00ff00ff00ff00ff",
            "pcid": "remote-sub-1",
            "v": 20_180_703_u64,
            "data": {"renegotiate": true, "noop": true},
        })
        .to_string(),
    ));
    // An unknown token is ignored entirely.
    parent.emit(PeerEvent::Data(
        json!({
            "type": "webrtc",
            "subtype": "webrtc_signal",
            "source": "deadbeefdeadbeef",
            "pcid": "remote-sub-9",
            "v": 20_180_703_u64,
            "data": {"sdp": "stray", "type": "offer"},
        })
        .to_string(),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sub.received_signals().len(), 1);
}

#[tokio::test]
async fn test_outdated_nested_signal_is_dropped() {
    let mut rig = rig();
    let parent = connected_parent(&mut rig).await;

    parent.emit(PeerEvent::Data(
        json!({
            "type": "p2p",
            "subtype": "announce_streams",
            "v": 1,
            "streams": [
                {"id": "s1", "kind": "screenshare", "token": "00ff00ff00ff00ff", "v": 1},
            ],
        })
        .to_string(),
    ));
    let provider = Arc::clone(&rig.provider);
    eventually(move || provider.created_count() == 2).await;
    let sub = rig.provider.peer(1);

    // A nested signal with an outdated version never reaches the
    // sub-connection, and its pcid is not bound either.
    parent.emit(PeerEvent::Data(
        json!({
            "type": "webrtc",
            "subtype": "webrtc_signal",
            "source": "00ff00ff00ff00ff",
            "pcid": "remote-sub-1",
            "v": 20_180_702_u64,
            "data": {"sdp": "old-offer", "type": "offer"},
        })
        .to_string(),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sub.received_signals().is_empty());

    // The same payload at the current version goes through.
    parent.emit(PeerEvent::Data(
        json!({
            "type": "webrtc",
            "subtype": "webrtc_signal",
            "source": "00ff00ff00ff00ff",
            "pcid": "remote-sub-1",
            "v": 20_180_703_u64,
            "data": {"sdp": "fresh-offer", "type": "offer"},
        })
        .to_string(),
    ));
    let sub_for_wait = Arc::clone(&sub);
    eventually(move || !sub_for_wait.received_signals().is_empty()).await;
    assert_eq!(
        sub.received_signals(),
        vec![json!({"sdp": "fresh-offer", "type": "offer"})]
    );
}

#[tokio::test]
async fn test_withdrawn_stream_tears_sub_connection_down() {
    let mut rig = rig();
    let parent = connected_parent(&mut rig).await;

    parent.emit(PeerEvent::Data(
        json!({
            "type": "p2p",
            "subtype": "announce_streams",
            "v": 1,
            "streams": [
                {"id": "s1", "kind": "screenshare", "token": "00ff00ff00ff00ff", "v": 1},
            ],
        })
        .to_string(),
    ));
    let provider = Arc::clone(&rig.provider);
    eventually(move || provider.created_count() == 2).await;
    let sub = rig.provider.peer(1);

    parent.emit(PeerEvent::Data(
        json!({"type": "p2p", "subtype": "announce_streams", "v": 1, "streams": []})
            .to_string(),
    ));
    let sub_for_wait = Arc::clone(&sub);
    eventually(move || sub_for_wait.destroyed()).await;
}

#[tokio::test]
async fn test_publish_screenshare() {
    let mut rig = rig();
    let parent = connected_parent(&mut rig).await;

    let stream = MediaStream::new("deck", vec![MediaTrack::new("v", MediaKind::Video)]);
    let id = rig.client.start_screen_share(stream).await.unwrap();
    assert_eq!(id, "deck");

    // The announcement carries a 16-hex routing token.
    let parent_for_wait = Arc::clone(&parent);
    eventually(move || !parent_for_wait.sent_texts().is_empty()).await;
    let announce: Value = serde_json::from_str(&parent.take_sent_texts()[0]).unwrap();
    assert_eq!(announce["subtype"], "announce_streams");
    let streams = announce["streams"].as_array().unwrap();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0]["id"], "deck");
    assert_eq!(streams[0]["kind"], "screenshare");
    let token = streams[0]["token"].as_str().unwrap().to_string();
    assert_eq!(token.len(), 16);

    // The receiver wakes us up; our send-side sub-connection comes up
    // carrying the stream.
    parent.emit(PeerEvent::Data(
        json!({
            "type": "webrtc",
            "subtype": "webrtc_signal",
            "source": token,
            "pcid": "recv-sub-1",
            "v": 20_180_703_u64,
            "data": {"renegotiate": true, "noop": true},
        })
        .to_string(),
    ));
    let provider = Arc::clone(&rig.provider);
    eventually(move || provider.created_count() == 2).await;
    let sub = rig.provider.last().unwrap();
    assert_eq!(sub.stream_ids, vec!["deck"]);
    assert!(!sub.recv_video);
    // The noop itself never reached the connection.
    assert!(sub.peer.received_signals().is_empty());

    // Withdrawing re-announces without the stream and drops the
    // sub-connection.
    rig.client.stop_screen_share("deck").await.unwrap();
    let parent_for_wait = Arc::clone(&parent);
    eventually(move || !parent_for_wait.sent_texts().is_empty()).await;
    let announce: Value = serde_json::from_str(&parent.take_sent_texts()[0]).unwrap();
    assert_eq!(announce["subtype"], "announce_streams");
    assert!(announce["streams"].as_array().unwrap().is_empty());
    assert!(rig.provider.peer(1).destroyed());
}

#[tokio::test]
async fn test_sub_connection_recovery() {
    let mut rig = rig();
    let parent = connected_parent(&mut rig).await;

    parent.emit(PeerEvent::Data(
        json!({
            "type": "p2p",
            "subtype": "announce_streams",
            "v": 1,
            "streams": [
                {"id": "s1", "kind": "screenshare", "token": "00ff00ff00ff00ff", "v": 1},
            ],
        })
        .to_string(),
    ));
    let provider = Arc::clone(&rig.provider);
    eventually(move || provider.created_count() == 2).await;
    let _ = parent.take_sent_texts(); // initial wake-up

    // A sub-connection error triggers delayed recreation plus a fresh
    // wake-up, as we are not the initiator.
    rig.provider
        .peer(1)
        .emit(PeerEvent::Error("dtls failure".to_string()));
    let provider = Arc::clone(&rig.provider);
    eventually(move || provider.created_count() == 3).await;
    assert!(rig.provider.peer(1).destroyed());

    let parent_for_wait = Arc::clone(&parent);
    eventually(move || !parent_for_wait.sent_texts().is_empty()).await;
    let wake: Value = serde_json::from_str(&parent.take_sent_texts()[0]).unwrap();
    assert_eq!(wake["data"], json!({"renegotiate": true, "noop": true}));
    assert_eq!(wake["pcid"], "pc-3");
}

#[tokio::test]
async fn test_duplicate_handshake_is_ignored() {
    let mut rig = rig();
    let parent = connected_parent(&mut rig).await;
    let _ = parent.take_sent_texts();

    parent.emit(PeerEvent::Data(
        json!({"type": "p2p", "subtype": "handshake", "ts": 777, "v": 1}).to_string(),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    // No reply goes out once the channel is ready.
    assert!(parent.sent_texts().is_empty());
}
