//! Call flow tests: placing, answering, rejecting and tearing down 1:1
//! calls, signal routing, and peer recovery.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use client_test_utils::{MockPeerProvider, TransportHarness};
use meeting_client::peer::{MediaPeer, PeerEvent};
use meeting_client::{Client, ClientEvent, ClientOptions};
use serde_json::json;
use signaling_protocol::envelope::{Envelope, Hello, Payload, UserIdentity};
use signaling_protocol::webrtc::{WebRtcMessage, WebRtcSubtype};
use signaling_protocol::PROTOCOL_VERSION;
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

fn hello(user: &str) -> Envelope {
    Envelope::new(Payload::Hello(Hello {
        identity: UserIdentity {
            id: user.to_string(),
            name: String::new(),
        },
    }))
}

fn webrtc(subtype: WebRtcSubtype, build: impl FnOnce(&mut WebRtcMessage)) -> Envelope {
    let mut msg = WebRtcMessage::new(subtype);
    build(&mut msg);
    Envelope::new(Payload::Webrtc(msg))
}

fn webrtc_payload(envelope: &Envelope) -> &WebRtcMessage {
    match &envelope.payload {
        Payload::Webrtc(msg) => msg,
        other => panic!("expected a webrtc envelope, got {other:?}"),
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn expect_hello(rig: &mut Rig, user: &str) {
    rig.harness.push_message(hello(user));
    match next_event(&mut rig.events).await {
        ClientEvent::Hello { user: got } => assert_eq!(got, user),
        other => panic!("expected hello event, got {other:?}"),
    }
}

/// Push a marker envelope and wait for it, guaranteeing every prior
/// inbound message was processed.
async fn settle(rig: &mut Rig) {
    rig.harness.push_message(Envelope::new(Payload::Chats(
        signaling_protocol::envelope::Chats::default(),
    )));
    loop {
        if matches!(next_event(&mut rig.events).await, ClientEvent::Chats(_)) {
            break;
        }
    }
}

/// Drive a full outbound call as "alice" to "bob" and return the local
/// state nonce.
async fn establish_call(rig: &mut Rig) -> String {
    expect_hello(rig, "alice").await;

    let call = {
        let client = rig.client.clone();
        tokio::spawn(async move { client.do_call("bob").await })
    };

    let (envelope, reply) = rig.harness.expect_request().await;
    let msg = webrtc_payload(&envelope).clone();
    assert_eq!(msg.subtype, WebRtcSubtype::WebrtcCall);
    assert_eq!(msg.target, "bob");
    assert!(msg.initiator);
    assert_eq!(msg.state.len(), 12);
    assert_eq!(msg.v, PROTOCOL_VERSION);
    assert!(msg.channel.is_empty());

    let reply_env = Envelope {
        id: 100,
        reply_to: Some(envelope.id),
        payload: Payload::Webrtc({
            let mut answer = WebRtcMessage::new(WebRtcSubtype::WebrtcCall);
            answer.source = "bob".to_string();
            answer.channel = "ch-1".to_string();
            answer.hash = "H".to_string();
            answer.state = "b0b0b0b0b0b0".to_string();
            answer.data = Some(json!({"accept": true, "state": msg.state}));
            answer
        }),
    };
    reply.send(Ok(reply_env)).unwrap();

    let channel = call.await.unwrap().unwrap();
    assert_eq!(channel, "ch-1");
    msg.state
}

#[tokio::test]
async fn test_place_call() {
    let mut rig = rig();
    let local_state = establish_call(&mut rig).await;

    // "alice" < "bob": the remote side is the initiator, so a fresh
    // non-initiator peer was created and a renegotiate signal injected
    // to unblock it.
    assert_eq!(rig.provider.created_count(), 1);
    let info = rig.provider.last().unwrap();
    assert!(!info.initiator);

    let signal = rig.harness.expect_send().await;
    let msg = webrtc_payload(&signal);
    assert_eq!(msg.subtype, WebRtcSubtype::WebrtcSignal);
    assert_eq!(msg.target, "bob");
    assert_eq!(msg.channel, "ch-1");
    assert_eq!(msg.hash, "H");
    assert_eq!(msg.state, local_state);
    assert_eq!(msg.pcid, "pc-1");
    assert_eq!(msg.data, Some(json!({"renegotiate": true})));

    loop {
        match next_event(&mut rig.events).await {
            ClientEvent::OutgoingCall { user, .. } => {
                assert_eq!(user, "bob");
                break;
            }
            other => panic!("expected outgoing call event, got {other:?}"),
        }
    }

    let status = rig.client.status().await.unwrap();
    assert_eq!(status.channel, "ch-1");
    assert_eq!(status.peers.len(), 1);
    let peer = &status.peers[0];
    assert_eq!(peer.user, "bob");
    assert_eq!(peer.hash, "H");
    assert_eq!(peer.remote_state, "b0b0b0b0b0b0");
    assert!(!peer.initiator);
    assert_eq!(peer.pc_id.as_deref(), Some("pc-1"));
}

#[tokio::test]
async fn test_call_preconditions() {
    let mut rig = rig();
    // No hello yet.
    assert!(rig.client.do_call("bob").await.is_err());

    establish_call(&mut rig).await;
    let _ = rig.harness.expect_send().await; // renegotiate signal

    // Channel occupied.
    let err = rig.client.do_call("carol").await.unwrap_err();
    assert_eq!(err.code(), "already_have_channel");
}

#[tokio::test]
async fn test_busy_reject() {
    let mut rig = rig();
    establish_call(&mut rig).await;
    let _ = rig.harness.expect_send().await; // renegotiate signal

    rig.harness.push_message(webrtc(WebRtcSubtype::WebrtcCall, |msg| {
        msg.initiator = true;
        msg.source = "carol".to_string();
        msg.target = "alice".to_string();
        msg.channel = "ch-2".to_string();
        msg.state = "cccccccccccc".to_string();
        msg.hash = "HC".to_string();
        msg.transaction = Some("t1".to_string());
    }));

    let reject = rig.harness.expect_send().await;
    let msg = webrtc_payload(&reject);
    assert_eq!(msg.subtype, WebRtcSubtype::WebrtcCall);
    assert_eq!(msg.target, "carol");
    assert_eq!(msg.transaction.as_deref(), Some("t1"));
    assert_eq!(
        msg.data,
        Some(json!({
            "accept": false,
            "reason": "reject_busy",
            "state": "cccccccccccc",
        }))
    );

    let status = rig.client.status().await.unwrap();
    assert_eq!(status.channel, "ch-1");
    assert!(status.peers.iter().all(|p| p.user != "carol"));
}

#[tokio::test]
async fn test_hash_mismatch_is_dropped() {
    let mut rig = rig();
    let local_state = establish_call(&mut rig).await;
    let _ = rig.harness.expect_send().await; // renegotiate signal
    let created_before = rig.provider.created_count();

    rig.harness.push_message(webrtc(WebRtcSubtype::WebrtcCall, |msg| {
        msg.source = "bob".to_string();
        msg.hash = "X".to_string();
        msg.state = "b1b1b1b1b1b1".to_string();
        msg.data = Some(json!({"accept": true, "state": local_state}));
    }));
    settle(&mut rig).await;

    let status = rig.client.status().await.unwrap();
    assert_eq!(status.peers[0].hash, "H");
    assert_eq!(status.peers[0].remote_state, "b0b0b0b0b0b0");
    assert_eq!(rig.provider.created_count(), created_before);
}

#[tokio::test]
async fn test_outdated_version_is_dropped() {
    let mut rig = rig();
    expect_hello(&mut rig, "alice").await;

    rig.harness.push_message(webrtc(WebRtcSubtype::WebrtcCall, |msg| {
        msg.initiator = true;
        msg.source = "carol".to_string();
        msg.channel = "ch-5".to_string();
        msg.state = "cccccccccccc".to_string();
        msg.v = PROTOCOL_VERSION - 1;
    }));
    settle(&mut rig).await;

    let status = rig.client.status().await.unwrap();
    assert!(status.channel.is_empty());
    assert!(status.peers.is_empty());
}

#[tokio::test]
async fn test_abort_call() {
    let mut rig = rig();
    expect_hello(&mut rig, "alice").await;

    let call = {
        let client = rig.client.clone();
        tokio::spawn(async move { client.do_call("bob").await })
    };
    let (envelope, reply) = rig.harness.expect_request().await;
    let state = webrtc_payload(&envelope).state.clone();

    let reply_env = Envelope {
        id: 100,
        reply_to: Some(envelope.id),
        payload: Payload::Webrtc({
            let mut answer = WebRtcMessage::new(WebRtcSubtype::WebrtcCall);
            answer.source = "bob".to_string();
            answer.data = Some(json!({
                "accept": false,
                "state": state,
                "reason": "busy elsewhere",
            }));
            answer
        }),
    };
    reply.send(Ok(reply_env)).unwrap();
    call.await.unwrap().unwrap();

    loop {
        match next_event(&mut rig.events).await {
            ClientEvent::AbortCall { user, reason } => {
                assert_eq!(user, "bob");
                assert_eq!(reason, "busy elsewhere");
                break;
            }
            ClientEvent::Hello { .. } => {}
            other => panic!("expected abort event, got {other:?}"),
        }
    }
    let status = rig.client.status().await.unwrap();
    assert!(status.peers.is_empty());
}

#[tokio::test]
async fn test_abort_reason_defaults() {
    let mut rig = rig();
    expect_hello(&mut rig, "alice").await;

    let call = {
        let client = rig.client.clone();
        tokio::spawn(async move { client.do_call("bob").await })
    };
    let (envelope, reply) = rig.harness.expect_request().await;
    let state = webrtc_payload(&envelope).state.clone();
    let reply_env = Envelope {
        id: 100,
        reply_to: Some(envelope.id),
        payload: Payload::Webrtc({
            let mut answer = WebRtcMessage::new(WebRtcSubtype::WebrtcCall);
            answer.source = "bob".to_string();
            answer.data = Some(json!({"accept": false, "state": state}));
            answer
        }),
    };
    reply.send(Ok(reply_env)).unwrap();
    call.await.unwrap().unwrap();

    loop {
        match next_event(&mut rig.events).await {
            ClientEvent::AbortCall { reason, .. } => {
                assert_eq!(reason, "no reason given");
                break;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_call_reply_timeout_clears_peer() {
    let mut rig = rig();
    expect_hello(&mut rig, "alice").await;

    let call = {
        let client = rig.client.clone();
        tokio::spawn(async move { client.do_call("bob").await })
    };
    let (_, reply) = rig.harness.expect_request().await;
    reply
        .send(Err(meeting_client::ClientError::Timeout))
        .unwrap();

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.code(), "timeout");
    let status = rig.client.status().await.unwrap();
    assert!(status.peers.is_empty());
    assert!(status.channel.is_empty());
}

#[tokio::test]
async fn test_incoming_call_answer_and_signal() {
    let mut rig = rig();
    expect_hello(&mut rig, "bob").await;

    rig.harness.push_message(webrtc(WebRtcSubtype::WebrtcCall, |msg| {
        msg.initiator = true;
        msg.source = "alice".to_string();
        msg.target = "bob".to_string();
        msg.channel = "ch-9".to_string();
        msg.state = "aaaaaaaaaaaa".to_string();
        msg.hash = "HH".to_string();
        msg.transaction = Some("tx-1".to_string());
    }));
    match next_event(&mut rig.events).await {
        ClientEvent::IncomingCall { user, .. } => assert_eq!(user, "alice"),
        other => panic!("expected incoming call, got {other:?}"),
    }

    let answering = {
        let client = rig.client.clone();
        tokio::spawn(async move { client.do_answer("alice").await })
    };
    let answer = rig.harness.expect_send().await;
    let msg = webrtc_payload(&answer);
    assert_eq!(msg.subtype, WebRtcSubtype::WebrtcCall);
    assert_eq!(msg.target, "alice");
    assert_eq!(msg.channel, "ch-9");
    assert_eq!(msg.hash, "HH");
    assert_eq!(msg.transaction.as_deref(), Some("tx-1"));
    assert_eq!(
        msg.data,
        Some(json!({"accept": true, "state": "aaaaaaaaaaaa"}))
    );
    assert_eq!(answering.await.unwrap().unwrap(), "ch-9");

    // First remote signal: the callee-side peer comes up on demand.
    // "bob" > "alice", so this side is the initiator.
    rig.harness
        .push_message(webrtc(WebRtcSubtype::WebrtcSignal, |msg| {
            msg.source = "alice".to_string();
            msg.channel = "ch-9".to_string();
            msg.state = "aaaaaaaaaaaa".to_string();
            msg.pcid = "r-1".to_string();
            msg.data = Some(json!({"sdp": "offer-1", "type": "offer"}));
        }));
    settle(&mut rig).await;

    assert_eq!(rig.provider.created_count(), 1);
    let info = rig.provider.last().unwrap();
    assert!(info.initiator);
    assert_eq!(
        info.peer.received_signals(),
        vec![json!({"sdp": "offer-1", "type": "offer"})]
    );
}

#[tokio::test]
async fn test_remote_pc_restart_recreates_local_peer() {
    let mut rig = rig();
    expect_hello(&mut rig, "bob").await;

    rig.harness.push_message(webrtc(WebRtcSubtype::WebrtcCall, |msg| {
        msg.initiator = true;
        msg.source = "alice".to_string();
        msg.target = "bob".to_string();
        msg.channel = "ch-9".to_string();
        msg.state = "aaaaaaaaaaaa".to_string();
        msg.hash = "HH".to_string();
    }));

    let signal = |pcid: &str, sdp: &str| {
        webrtc(WebRtcSubtype::WebrtcSignal, |msg| {
            msg.source = "alice".to_string();
            msg.channel = "ch-9".to_string();
            msg.state = "aaaaaaaaaaaa".to_string();
            msg.pcid = pcid.to_string();
            msg.data = Some(json!({"sdp": sdp, "type": "offer"}));
        })
    };

    // First signal creates the peer; the second binds the remote id.
    rig.harness.push_message(signal("r-1", "offer-1"));
    rig.harness.push_message(signal("r-1", "offer-2"));
    settle(&mut rig).await;
    assert_eq!(rig.provider.created_count(), 1);
    let status = rig.client.status().await.unwrap();
    assert_eq!(status.peers[0].remote_pc_id, "r-1");

    // A different remote id means the other side restarted: the local
    // peer is rebuilt and the signal still delivered.
    rig.harness.push_message(signal("r-2", "offer-3"));
    settle(&mut rig).await;
    assert_eq!(rig.provider.created_count(), 2);
    assert!(rig.provider.peer(0).destroyed());
    assert_eq!(
        rig.provider.peer(1).received_signals(),
        vec![json!({"sdp": "offer-3", "type": "offer"})]
    );
    let status = rig.client.status().await.unwrap();
    assert_eq!(status.peers[0].remote_pc_id, "r-2");
}

#[tokio::test]
async fn test_remote_hangup() {
    let mut rig = rig();
    establish_call(&mut rig).await;
    let _ = rig.harness.expect_send().await; // renegotiate signal

    rig.harness
        .push_message(webrtc(WebRtcSubtype::WebrtcHangup, |msg| {
            msg.source = "bob".to_string();
            msg.channel = "ch-1".to_string();
            msg.state = "b0b0b0b0b0b0".to_string();
            msg.data = Some(json!({"reason": "left"}));
        }));

    loop {
        match next_event(&mut rig.events).await {
            ClientEvent::Hangup { user, details } => {
                assert_eq!(user, "bob");
                assert_eq!(details, Some(json!({"reason": "left"})));
                break;
            }
            ClientEvent::OutgoingCall { .. } => {}
            other => panic!("expected hangup event, got {other:?}"),
        }
    }
    let status = rig.client.status().await.unwrap();
    assert!(status.peers.is_empty());
    // The last peer is gone, so the channel identity is gone too.
    assert!(status.channel.is_empty());
}

#[tokio::test]
async fn test_hangup_with_reason_notifies_server() {
    let mut rig = rig();
    establish_call(&mut rig).await;
    let _ = rig.harness.expect_send().await; // renegotiate signal

    let hangup = {
        let client = rig.client.clone();
        tokio::spawn(async move { client.do_hangup(None, "hangup").await })
    };
    let envelope = rig.harness.expect_send().await;
    let msg = webrtc_payload(&envelope);
    assert_eq!(msg.subtype, WebRtcSubtype::WebrtcHangup);
    assert_eq!(msg.target, "bob");
    assert_eq!(msg.channel, "ch-1");
    assert_eq!(msg.data, Some(json!({"reason": "hangup"})));
    assert_eq!(hangup.await.unwrap().unwrap(), "ch-1");

    let status = rig.client.status().await.unwrap();
    assert!(status.channel.is_empty());
    assert!(status.peers.is_empty());
    assert!(rig.provider.peer(0).destroyed());
}

#[tokio::test]
async fn test_local_hangup_sends_nothing() {
    let mut rig = rig();
    establish_call(&mut rig).await;
    let _ = rig.harness.expect_send().await; // renegotiate signal

    rig.client.do_hangup(None, "").await.unwrap();
    let status = rig.client.status().await.unwrap();
    assert!(status.channel.is_empty());
    assert!(status.peers.is_empty());
    assert!(rig.harness.try_next_command().is_none());
}

#[tokio::test]
async fn test_reject_is_local_teardown_plus_decline() {
    let mut rig = rig();
    expect_hello(&mut rig, "bob").await;

    rig.harness.push_message(webrtc(WebRtcSubtype::WebrtcCall, |msg| {
        msg.initiator = true;
        msg.source = "alice".to_string();
        msg.target = "bob".to_string();
        msg.channel = "ch-9".to_string();
        msg.state = "aaaaaaaaaaaa".to_string();
        msg.hash = "HH".to_string();
        msg.transaction = Some("tx-2".to_string());
    }));
    loop {
        if matches!(
            next_event(&mut rig.events).await,
            ClientEvent::IncomingCall { .. }
        ) {
            break;
        }
    }

    let rejecting = {
        let client = rig.client.clone();
        tokio::spawn(async move { client.do_reject("alice", "not now").await })
    };
    let decline = rig.harness.expect_send().await;
    let msg = webrtc_payload(&decline);
    assert_eq!(msg.transaction.as_deref(), Some("tx-2"));
    assert_eq!(
        msg.data,
        Some(json!({
            "accept": false,
            "state": "aaaaaaaaaaaa",
            "reason": "not now",
        }))
    );

    rejecting.await.unwrap().unwrap();
    // Reject never sends a hangup envelope.
    assert!(rig.harness.try_next_command().is_none());
    let status = rig.client.status().await.unwrap();
    assert!(status.peers.is_empty());
}

#[tokio::test]
async fn test_peer_error_triggers_recovery() {
    let mut rig = rig();
    establish_call(&mut rig).await;
    let _ = rig.harness.expect_send().await; // renegotiate signal

    rig.provider.peer(0).emit(PeerEvent::Error("ice failed".to_string()));

    // Recovery fires after its delay: a fresh non-initiator peer plus a
    // renegotiate wake-up.
    let signal = rig.harness.expect_send().await;
    let msg = webrtc_payload(&signal);
    assert_eq!(msg.subtype, WebRtcSubtype::WebrtcSignal);
    assert_eq!(msg.pcid, "pc-2");
    assert_eq!(msg.data, Some(json!({"renegotiate": true})));

    assert_eq!(rig.provider.created_count(), 2);
    assert!(rig.provider.peer(0).destroyed());
    let status = rig.client.status().await.unwrap();
    assert_eq!(status.peers[0].pc_id.as_deref(), Some("pc-2"));
}

#[tokio::test]
async fn test_stale_peer_events_are_ignored() {
    let mut rig = rig();
    establish_call(&mut rig).await;
    let _ = rig.harness.expect_send().await; // renegotiate signal

    rig.provider.peer(0).emit(PeerEvent::Error("ice failed".to_string()));
    let _ = rig.harness.expect_send().await; // recovery renegotiate
    assert_eq!(rig.provider.created_count(), 2);

    // Events from the replaced connection must not mutate state.
    rig.provider.peer(0).emit(PeerEvent::Close);
    settle(&mut rig).await;
    let status = rig.client.status().await.unwrap();
    assert_eq!(status.peers[0].pc_id.as_deref(), Some("pc-2"));
}
