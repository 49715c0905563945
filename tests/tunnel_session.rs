//! Integration tests for the tunnel client.
//!
//! Each test stands up an in-process backend (raw TCP for the bootstrap
//! probe, `tokio-tungstenite`'s accept side for the tunnel endpoint) plus a
//! fake local relay, then drives a real `TunnelClient` through the public
//! API: bootstrap, session, framing, teardown.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use edgetun::state::TunnelEventType;
use edgetun::tunnel::TunnelClient;

const RELAY_REPLY: &[u8] = b"HTTP/1.1 200 OK\r\n\r\nOK";

/// Serve the bootstrap probe: read the upgrade request, answer a plain 200.
async fn serve_probe(listener: &TcpListener) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 2048];
    let _ = stream.read(&mut buf).await.unwrap();
    stream
        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
        .await
        .unwrap();
    stream.flush().await.unwrap();
}

/// Fake local relay: answer every read with a canned HTTP response.
async fn spawn_relay() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let Ok(n) = conn.read(&mut buf).await else { break };
                    if n == 0 {
                        break;
                    }
                    if conn.write_all(RELAY_REPLY).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Read the next data frame, skipping ping/pong traffic.
async fn expect_binary(ws: &mut WebSocketStream<TcpStream>) -> Vec<u8> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed while waiting for a frame")
            .expect("read error while waiting for a frame");
        match message {
            Message::Binary(payload) => return payload,
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

#[tokio::test]
async fn request_roundtrip_with_ordered_response_ids() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = listener.local_addr().unwrap();
    let relay_addr = spawn_relay().await;

    let backend = tokio::spawn(async move {
        serve_probe(&listener).await;

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        // request 0001 gets the relay's reply back under response id 0000
        ws.send(Message::Binary(b"0001GET / HTTP/1.1\r\n\r\n".to_vec()))
            .await
            .unwrap();
        let response = expect_binary(&mut ws).await;
        assert_eq!(&response[..4], b"0000");
        assert_eq!(&response[4..], RELAY_REPLY);

        // an empty payload is dropped: no relay write, no response frame
        ws.send(Message::Binary(b"002a".to_vec())).await.unwrap();

        // the next real request gets response id 0001, not 0002
        ws.send(Message::Binary(b"0007PING".to_vec())).await.unwrap();
        let response = expect_binary(&mut ws).await;
        assert_eq!(&response[..4], b"0001");
        assert_eq!(&response[4..], RELAY_REPLY);

        ws
    });

    let mut client = TunnelClient::new(&format!("ws://{ws_addr}"), &relay_addr.to_string());
    client.test_connection(None, None, None).await.unwrap();
    assert_eq!(
        client.dest_url(),
        Some(format!("ws://{ws_addr}/api/v1/edgedevice/connection/tunnel").as_str())
    );

    let session = client.start().unwrap();

    let mut ws = tokio::time::timeout(Duration::from_secs(30), backend)
        .await
        .expect("backend assertions timed out")
        .unwrap();

    // stop, then let the peer close: at most the in-flight iteration remains
    client.stop();
    ws.close(None).await.unwrap();
    tokio::time::timeout(Duration::from_secs(30), session)
        .await
        .expect("session loop did not exit after stop")
        .unwrap();
    assert!(!client.connected());
}

#[tokio::test(start_paused = true)]
async fn dial_retry_ceiling_stops_the_loop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = listener.local_addr().unwrap();
    let relay_addr = spawn_relay().await;

    let probe = tokio::spawn(async move {
        serve_probe(&listener).await;
        listener
    });

    let mut client = TunnelClient::new(&format!("ws://{ws_addr}"), &relay_addr.to_string());
    client.test_connection(None, None, None).await.unwrap();

    // close the listening port so every session dial is refused
    let listener = probe.await.unwrap();
    drop(listener);

    let session = client.start().unwrap();
    tokio::time::timeout(Duration::from_secs(3600), session)
        .await
        .expect("session loop did not hit the retry ceiling")
        .unwrap();

    assert!(!client.connected());
    let stats = client.stats();
    assert_eq!(stats.reconnects.load(std::sync::atomic::Ordering::Relaxed), 50);
    let events = stats.recent_events().await;
    assert!(events
        .iter()
        .all(|e| e.event_type == TunnelEventType::ReconnectAttempt));
}

#[tokio::test(start_paused = true)]
async fn ping_timeout_tears_down_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = listener.local_addr().unwrap();
    let relay_addr = spawn_relay().await;

    tokio::spawn(async move {
        serve_probe(&listener).await;
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        // hold the socket open but never read: no pongs ever come back
        let _ws = ws;
        std::future::pending::<()>().await;
    });

    let mut client = TunnelClient::new(&format!("ws://{ws_addr}"), &relay_addr.to_string())
        .with_ping_timeout(Duration::from_secs(3));
    client.test_connection(None, None, None).await.unwrap();

    let session = client.start().unwrap();
    // observed between iterations, so the loop ends once the pinger fires
    client.stop();

    tokio::time::timeout(Duration::from_secs(300), session)
        .await
        .expect("ping timeout did not tear down the session")
        .unwrap();

    let events = client.stats().recent_events().await;
    assert!(events
        .iter()
        .any(|e| e.event_type == TunnelEventType::PongTimeout));
    assert!(!client.connected());
}
