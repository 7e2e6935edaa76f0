//! TLS-wrapped sessions: self-signed round trips and mutual authentication.

mod common;

use std::time::Duration;

use framelink::cert::generate_self_signed_cert;
use framelink::{ClientConfig, LinkClient, ServerConfig, TlsSettings};

use common::{
    client_probe, init_tracing, next_event, server_probe, start_server, ClientEvent, ServerEvent,
};

fn server_tls() -> TlsSettings {
    let (cert_der, key_der) = generate_self_signed_cert("localhost").unwrap();
    TlsSettings {
        cert_der: Some(cert_der),
        key_der: Some(key_der),
        ..TlsSettings::default()
    }
}

#[tokio::test]
async fn tls_round_trip_with_self_signed_cert() {
    init_tracing();
    let (handler, mut events) = server_probe();
    let config = ServerConfig {
        tls: Some(server_tls()),
        ..ServerConfig::default()
    };
    let (server, addr) = start_server(config, handler).await;

    let (client_handler, mut client_events) = client_probe();
    let client = LinkClient::connect(
        ClientConfig {
            server_address: addr,
            tls: Some(TlsSettings::default()),
            ..ClientConfig::default()
        },
        client_handler,
    )
    .await
    .unwrap();

    match next_event(&mut events, Duration::from_secs(5)).await {
        ServerEvent::Connected(_) => {}
        other => panic!("expected Connected, got {other:?}"),
    }

    client.send(b"over-tls").await.unwrap();
    match next_event(&mut events, Duration::from_secs(2)).await {
        ServerEvent::Message(_, message) => assert_eq!(&message.payload[..], b"over-tls"),
        other => panic!("expected Message, got {other:?}"),
    }

    // And the other direction.
    let endpoint = server.connected_clients().await.pop().unwrap();
    server.send(&endpoint, b"tls-reply").await.unwrap();
    match next_event(&mut client_events, Duration::from_secs(2)).await {
        ClientEvent::Message(message) => assert_eq!(&message.payload[..], b"tls-reply"),
        other => panic!("expected Message, got {other:?}"),
    }

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn mutual_tls_round_trip() {
    init_tracing();
    let (handler, mut events) = server_probe();

    let mut server_settings = server_tls();
    server_settings.mutually_authenticate = true;
    let config = ServerConfig {
        tls: Some(server_settings),
        ..ServerConfig::default()
    };
    let (server, addr) = start_server(config, handler).await;

    // The client presents its own self-signed certificate.
    let (client_cert, client_key) = generate_self_signed_cert("client.local").unwrap();
    let (client_handler, _client_events) = client_probe();
    let client = LinkClient::connect(
        ClientConfig {
            server_address: addr,
            tls: Some(TlsSettings {
                cert_der: Some(client_cert),
                key_der: Some(client_key),
                mutually_authenticate: true,
                ..TlsSettings::default()
            }),
            ..ClientConfig::default()
        },
        client_handler,
    )
    .await
    .unwrap();

    match next_event(&mut events, Duration::from_secs(5)).await {
        ServerEvent::Connected(_) => {}
        other => panic!("expected Connected, got {other:?}"),
    }

    client.send(b"mutually-verified").await.unwrap();
    match next_event(&mut events, Duration::from_secs(2)).await {
        ServerEvent::Message(_, message) => {
            assert_eq!(&message.payload[..], b"mutually-verified")
        }
        other => panic!("expected Message, got {other:?}"),
    }

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn tls_sync_exchange() {
    init_tracing();
    let (handler, mut events) = server_probe();
    let config = ServerConfig {
        tls: Some(server_tls()),
        ..ServerConfig::default()
    };
    let (server, addr) = start_server(config, handler).await;

    let (client_handler, _client_events) = client_probe();
    let client = LinkClient::connect(
        ClientConfig {
            server_address: addr,
            tls: Some(TlsSettings::default()),
            ..ClientConfig::default()
        },
        client_handler,
    )
    .await
    .unwrap();

    match next_event(&mut events, Duration::from_secs(5)).await {
        ServerEvent::Connected(_) => {}
        other => panic!("expected Connected, got {other:?}"),
    }

    let response = client.send_and_wait(5000, b"ping").await.unwrap();
    assert_eq!(&response.payload[..], b"pong");

    client.disconnect().await;
    server.shutdown().await;
}
