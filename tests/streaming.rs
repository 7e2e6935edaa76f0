//! Buffered-versus-streamed delivery around the proxied-stream threshold,
//! and streamed sending from a reader source.

mod common;

use std::time::Duration;

use framelink::{ClientConfig, LinkClient, Metadata, ServerConfig};

use common::{client_probe, init_tracing, next_event, server_probe, start_server, ServerEvent};

/// A small threshold so the suite exercises both paths cheaply.
const THRESHOLD: u64 = 4096;

fn config_with_threshold() -> ServerConfig {
    ServerConfig {
        max_proxied_stream_size: THRESHOLD,
        ..ServerConfig::default()
    }
}

async fn connect(addr: &str) -> LinkClient {
    let (client_handler, _events) = client_probe();
    LinkClient::connect(
        ClientConfig {
            server_address: addr.to_string(),
            ..ClientConfig::default()
        },
        client_handler,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn payload_below_threshold_is_buffered() {
    init_tracing();
    let (handler, mut events) = server_probe();
    let (server, addr) = start_server(config_with_threshold(), handler).await;
    let client = connect(&addr).await;

    match next_event(&mut events, Duration::from_secs(2)).await {
        ServerEvent::Connected(_) => {}
        other => panic!("expected Connected, got {other:?}"),
    }

    // One byte under the threshold takes the buffered path.
    let payload = vec![0x5A_u8; (THRESHOLD - 1) as usize];
    client.send(&payload).await.unwrap();

    match next_event(&mut events, Duration::from_secs(2)).await {
        ServerEvent::Message(_, message) => {
            assert_eq!(message.payload.len() as u64, THRESHOLD - 1);
            assert!(message.payload.iter().all(|b| *b == 0x5A));
        }
        other => panic!("expected buffered Message, got {other:?}"),
    }

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn payload_at_threshold_is_streamed() {
    init_tracing();
    let (handler, mut events) = server_probe();
    let (server, addr) = start_server(config_with_threshold(), handler).await;
    let client = connect(&addr).await;

    match next_event(&mut events, Duration::from_secs(2)).await {
        ServerEvent::Connected(_) => {}
        other => panic!("expected Connected, got {other:?}"),
    }

    // Exactly the threshold takes the streaming path.
    let payload = vec![0xC3_u8; THRESHOLD as usize];
    client.send(&payload).await.unwrap();

    match next_event(&mut events, Duration::from_secs(2)).await {
        ServerEvent::Stream {
            length, prefix, ..
        } => {
            assert_eq!(length, THRESHOLD);
            assert!(prefix.iter().all(|b| *b == 0xC3));
        }
        other => panic!("expected Stream, got {other:?}"),
    }

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn session_continues_after_streamed_delivery() {
    init_tracing();
    let (handler, mut events) = server_probe();
    let (server, addr) = start_server(config_with_threshold(), handler).await;
    let client = connect(&addr).await;

    match next_event(&mut events, Duration::from_secs(2)).await {
        ServerEvent::Connected(_) => {}
        other => panic!("expected Connected, got {other:?}"),
    }

    let big = vec![1u8; (THRESHOLD * 4) as usize];
    client.send(&big).await.unwrap();
    client.send(b"after").await.unwrap();

    match next_event(&mut events, Duration::from_secs(2)).await {
        ServerEvent::Stream { length, .. } => assert_eq!(length, THRESHOLD * 4),
        other => panic!("expected Stream, got {other:?}"),
    }
    match next_event(&mut events, Duration::from_secs(2)).await {
        ServerEvent::Message(_, message) => assert_eq!(&message.payload[..], b"after"),
        other => panic!("expected Message, got {other:?}"),
    }

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn send_stream_draws_from_reader() {
    init_tracing();
    let (handler, mut events) = server_probe();
    let (server, addr) = start_server(config_with_threshold(), handler).await;
    let client = connect(&addr).await;

    match next_event(&mut events, Duration::from_secs(2)).await {
        ServerEvent::Connected(_) => {}
        other => panic!("expected Connected, got {other:?}"),
    }

    // Stream a payload out of an in-memory reader without buffering it
    // into a message first.
    let payload = vec![0x7E_u8; (THRESHOLD * 2) as usize];
    let mut source = std::io::Cursor::new(payload.clone());
    client
        .send_stream(Metadata::new(), payload.len() as u64, &mut source)
        .await
        .unwrap();

    match next_event(&mut events, Duration::from_secs(2)).await {
        ServerEvent::Stream {
            length, prefix, ..
        } => {
            assert_eq!(length, THRESHOLD * 2);
            assert!(prefix.iter().all(|b| *b == 0x7E));
        }
        other => panic!("expected Stream, got {other:?}"),
    }

    client.disconnect().await;
    server.shutdown().await;
}
