//! End-to-end tests over real WebSocket connections.
//!
//! Each test starts a server on a free port and drives it with
//! `RealtimeClient`s or raw tungstenite sockets.

use duet_realtime::client::{ClientNotice, ConnectionState, RealtimeClient, ReconnectPolicy};
use duet_realtime::protocol::{CallType, ClientEvent, DrawingStroke, Point, ServerEvent, SessionId, UserId};
use duet_realtime::server::{RealtimeServer, ServerConfig};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16) -> ServerConfig {
    ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        outbound_capacity: 64,
        ..ServerConfig::default()
    }
}

fn spawn_server(port: u16) {
    let server = RealtimeServer::new(test_config(port)).unwrap();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    spawn_server(port);
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn connect_client(port: u16) -> (RealtimeClient, mpsc::Receiver<ClientNotice>) {
    let mut client = RealtimeClient::new(format!("ws://127.0.0.1:{port}"));
    let mut notices = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    match timeout(Duration::from_secs(1), notices.recv()).await {
        Ok(Some(ClientNotice::Connected)) => {}
        other => panic!("Expected Connected, got {other:?}"),
    }
    (client, notices)
}

/// Next server event, skipping connection notices.
async fn next_event(notices: &mut mpsc::Receiver<ClientNotice>) -> ServerEvent {
    loop {
        match timeout(Duration::from_secs(2), notices.recv()).await {
            Ok(Some(ClientNotice::Event(event))) => return event,
            Ok(Some(_)) => continue,
            other => panic!("Expected a server event, got {other:?}"),
        }
    }
}

/// Assert nothing arrives for a short while.
async fn assert_quiet(notices: &mut mpsc::Receiver<ClientNotice>) {
    if let Ok(Some(notice)) = timeout(Duration::from_millis(150), notices.recv()).await {
        panic!("Expected no event, got {notice:?}");
    }
}

fn sid(s: &str) -> SessionId {
    SessionId::parse(s).unwrap()
}

fn gold_stroke() -> DrawingStroke {
    DrawingStroke {
        id: "s1".into(),
        user_id: UserId::from(1),
        points: vec![Point::new(10.0, 10.0)],
        color: "#d4af37".into(),
        brush_size: 3.0,
        opacity: 100.0,
        timestamp: 0,
    }
}

fn synced_strokes(event: ServerEvent) -> Vec<DrawingStroke> {
    match event {
        ServerEvent::WhiteboardSync { strokes, .. } => strokes,
        other => panic!("Expected WhiteboardSync, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let result = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}")).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_ping_pong() {
    let port = start_test_server().await;
    let (client, mut events) = connect_client(port).await;

    client.send_ping().await.unwrap();
    assert_eq!(next_event(&mut events).await, ServerEvent::Pong);
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_raw_frames_and_numeric_ids() {
    let port = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    ws.send(Message::Text("not json".into())).await.unwrap();
    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let reply = ServerEvent::decode(reply.to_text().unwrap()).unwrap();
    assert!(matches!(reply, ServerEvent::Error { .. }));

    // Integer ids on input; string ids on output.
    let join = json!({"event": "whiteboard:join", "data": {"sessionId": "wb-raw", "userId": 42}});
    ws.send(Message::Text(join.to_string().into())).await.unwrap();
    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(value["event"], "whiteboard:sync");
    assert_eq!(value["data"]["participants"], json!(["42"]));
}

#[tokio::test]
async fn test_presence_online_and_offline() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect_client(port).await;
    let (bob, mut bob_events) = connect_client(port).await;

    alice.join_user(UserId::from(1), Some(UserId::from(2)), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    bob.join_user(UserId::from(2), Some(UserId::from(1)), None).await.unwrap();

    assert_eq!(next_event(&mut alice_events).await, ServerEvent::UserOnline { user_id: UserId::from(2) });
    assert_eq!(next_event(&mut bob_events).await, ServerEvent::UserOnline { user_id: UserId::from(1) });

    bob.disconnect().await;
    assert_eq!(next_event(&mut alice_events).await, ServerEvent::UserOffline { user_id: UserId::from(2) });
}

#[tokio::test]
async fn test_whiteboard_scenario_two_users() {
    let port = start_test_server().await;
    let (a, mut a_events) = connect_client(port).await;
    let (b, mut b_events) = connect_client(port).await;
    let wb = sid("wb-1");

    a.join_whiteboard(wb.clone(), UserId::from(1), Some(UserId::from(2)), Some("A".into()))
        .await
        .unwrap();
    assert!(synced_strokes(next_event(&mut a_events).await).is_empty());

    b.join_whiteboard(wb.clone(), UserId::from(2), Some(UserId::from(1)), Some("B".into()))
        .await
        .unwrap();
    assert!(synced_strokes(next_event(&mut b_events).await).is_empty());
    assert!(matches!(next_event(&mut a_events).await, ServerEvent::UserJoined { .. }));

    // A draws; B receives it verbatim, A gets no echo.
    a.send_stroke(wb.clone(), gold_stroke()).await.unwrap();
    assert_eq!(
        next_event(&mut b_events).await,
        ServerEvent::StrokeReceived { session_id: wb.clone(), stroke: gold_stroke() }
    );
    assert_quiet(&mut a_events).await;

    // B re-joins as after a reconnect and gets the log.
    b.join_whiteboard(wb.clone(), UserId::from(2), Some(UserId::from(1)), Some("B".into()))
        .await
        .unwrap();
    assert_eq!(synced_strokes(next_event(&mut b_events).await), vec![gold_stroke()]);
    assert!(matches!(next_event(&mut a_events).await, ServerEvent::UserJoined { .. }));

    // A clears; both are told, including A.
    a.send(ClientEvent::WhiteboardClear { session_id: wb.clone() }).await.unwrap();
    let cleared = ServerEvent::Cleared { session_id: wb.clone(), cleared_by: UserId::from(1) };
    assert_eq!(next_event(&mut a_events).await, cleared);
    assert_eq!(next_event(&mut b_events).await, cleared);

    a.join_whiteboard(wb.clone(), UserId::from(1), Some(UserId::from(2)), None)
        .await
        .unwrap();
    assert!(synced_strokes(next_event(&mut a_events).await).is_empty());
}

#[tokio::test]
async fn test_cursor_reaches_peer_only() {
    let port = start_test_server().await;
    let (a, mut a_events) = connect_client(port).await;
    let (b, mut b_events) = connect_client(port).await;
    let wb = sid("wb-cursor");

    a.join_whiteboard(wb.clone(), UserId::from(1), Some(UserId::from(2)), Some("Ada".into()))
        .await
        .unwrap();
    next_event(&mut a_events).await;
    b.join_whiteboard(wb.clone(), UserId::from(2), None, None).await.unwrap();
    next_event(&mut b_events).await;
    next_event(&mut a_events).await;

    a.send(ClientEvent::WhiteboardCursor { session_id: wb.clone(), x: 150.0, y: 250.0 })
        .await
        .unwrap();
    match next_event(&mut b_events).await {
        ServerEvent::CursorMoved { cursor, .. } => {
            assert_eq!(cursor.user_id, UserId::from(1));
            assert_eq!(cursor.username, "Ada");
            assert_eq!((cursor.x, cursor.y), (150.0, 250.0));
        }
        other => panic!("Expected CursorMoved, got {other:?}"),
    }
    assert_quiet(&mut a_events).await;
}

#[tokio::test]
async fn test_call_handshake_over_sockets() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect_client(port).await;
    let (bob, mut bob_events) = connect_client(port).await;
    alice.join_user(UserId::from(1), None, None).await.unwrap();
    bob.join_user(UserId::from(2), None, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    alice
        .send(ClientEvent::CallInitiate { to_user_id: UserId::from(2), call_type: CallType::Video })
        .await
        .unwrap();
    let call_id = match next_event(&mut bob_events).await {
        ServerEvent::CallIncoming { call_id, from_user_id, call_type } => {
            assert_eq!(from_user_id, UserId::from(1));
            assert_eq!(call_type, CallType::Video);
            call_id
        }
        other => panic!("Expected CallIncoming, got {other:?}"),
    };

    bob.send(ClientEvent::CallAccept { call_id: call_id.clone(), to_user_id: UserId::from(1) })
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut alice_events).await,
        ServerEvent::CallAccepted { call_id: call_id.clone(), from_user_id: UserId::from(2) }
    );

    let offer = json!({"type": "offer", "sdp": "v=0\r\n"});
    alice
        .send(ClientEvent::WebRtcOffer {
            to_user_id: UserId::from(2),
            payload: offer.clone(),
            call_id: Some(call_id.clone()),
        })
        .await
        .unwrap();
    match next_event(&mut bob_events).await {
        ServerEvent::OfferReceived { payload, .. } => assert_eq!(payload, offer),
        other => panic!("Expected OfferReceived, got {other:?}"),
    }

    bob.send(ClientEvent::CallEnd { to_user_id: UserId::from(1), call_id: Some(call_id) })
        .await
        .unwrap();
    assert!(matches!(next_event(&mut alice_events).await, ServerEvent::CallEnded { .. }));
}

#[tokio::test]
async fn test_call_to_offline_user() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect_client(port).await;
    alice.join_user(UserId::from(1), None, None).await.unwrap();

    alice
        .send(ClientEvent::CallInitiate { to_user_id: UserId::from(99), call_type: CallType::Audio })
        .await
        .unwrap();
    match next_event(&mut alice_events).await {
        ServerEvent::CallError { to_user_id, message } => {
            assert_eq!(to_user_id, Some(UserId::from(99)));
            assert!(message.contains("offline"));
        }
        other => panic!("Expected CallError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reconnect_replays_join() {
    let port = free_port().await;
    let policy = ReconnectPolicy {
        max_attempts: 20,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        multiplier: 2.0,
    };
    let mut client = RealtimeClient::with_policy(format!("ws://127.0.0.1:{port}"), policy);
    let mut events = client.take_event_rx().unwrap();

    // Remembered while offline, replayed once connected.
    let wb = sid("wb-late");
    let result = client
        .join_whiteboard(wb.clone(), UserId::from(1), None, None)
        .await;
    assert!(result.is_err());

    let server = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        spawn_server(port);
    });
    client.connect().await.unwrap();
    server.await.unwrap();

    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    match next_event(&mut events).await {
        ServerEvent::WhiteboardSync { session_id, .. } => assert_eq!(session_id, wb),
        other => panic!("Expected WhiteboardSync, got {other:?}"),
    }
}

#[tokio::test]
async fn test_superseded_login_keeps_user_online() {
    let port = start_test_server().await;
    let (laptop, _laptop_events) = connect_client(port).await;
    let (phone, mut phone_events) = connect_client(port).await;
    let (peer, mut peer_events) = connect_client(port).await;

    peer.join_user(UserId::from(2), None, None).await.unwrap();
    laptop.join_user(UserId::from(1), None, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    phone.join_user(UserId::from(1), None, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    laptop.disconnect().await;
    assert_quiet(&mut peer_events).await;

    // Calls still reach the newer connection.
    peer.send(ClientEvent::CallInitiate { to_user_id: UserId::from(1), call_type: CallType::Audio })
        .await
        .unwrap();
    assert!(matches!(next_event(&mut phone_events).await, ServerEvent::CallIncoming { .. }));
    assert_quiet(&mut peer_events).await;
}
