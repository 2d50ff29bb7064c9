//! Route-level session tests against real local peers.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use termgate_core::{Error, Message, RequestParams};
use termgate_server::exec::CommandResolver;
use termgate_server::telnet::{IAC, OPT_NAWS, SB, SE};
use termgate_server::{Gateway, GatewayConfig, Route};
use termgate_test_utils::{binary_payload, mock_client, stderr_text};

fn gateway() -> Gateway {
    let config = GatewayConfig {
        dial_timeout: Duration::from_secs(2),
        ..GatewayConfig::default()
    };
    Gateway::new(config, Arc::new(CommandResolver::with_roots(Vec::new())))
}

#[tokio::test]
async fn telnet_route_relays_resize_and_input() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"login: ").await.unwrap();

        let mut naws = [0u8; 9];
        stream.read_exact(&mut naws).await.unwrap();

        let mut payload = vec![0u8; 4096];
        stream.read_exact(&mut payload).await.unwrap();

        stream.write_all(b"bye\r\n").await.unwrap();
        stream.shutdown().await.unwrap();
        (naws, payload)
    });

    let params = RequestParams::from_pairs([
        ("hostname", "127.0.0.1".to_string()),
        ("port", port.to_string()),
    ]);
    let (conn, mut client) = mock_client(params);
    let gw = gateway();
    let session = tokio::spawn(async move { gw.handle(Route::Telnet, conn).await });

    let mut banner = Vec::new();
    while banner.len() < b"login: ".len() {
        let frame = client.next_frame().await.unwrap();
        banner.extend(binary_payload(&[frame]));
    }
    assert_eq!(banner, b"login: ");

    client.send_message(&Message::resize(40, 100));
    let input: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
    client.send_binary(input.clone());

    let (naws, payload) = server.await.unwrap();
    assert_eq!(naws, [IAC, SB, OPT_NAWS, 0, 100, 0, 40, IAC, SE]);
    assert_eq!(payload, input);

    session.await.unwrap().unwrap();
    let frames = client.frames_until_closed().await;
    assert_eq!(binary_payload(&frames), b"bye\r\n");
    assert!(frames.iter().all(|f| stderr_text(f).is_none()));
}

#[tokio::test]
async fn telnet_route_reports_refused_dial() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let params = RequestParams::from_pairs([
        ("hostname", "127.0.0.1".to_string()),
        ("port", port.to_string()),
    ]);
    let (conn, mut client) = mock_client(params);
    let err = gateway().handle(Route::Telnet, conn).await.unwrap_err();
    assert!(matches!(err, Error::DialFailed { .. }));

    let frames = client.frames_until_closed().await;
    let text = frames.iter().find_map(stderr_text).unwrap();
    assert!(text.starts_with("Failed to dial"), "{text}");
}

#[tokio::test]
async fn ssh_route_reports_refused_dial() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let params = RequestParams::from_pairs([
        ("hostname", "127.0.0.1".to_string()),
        ("port", port.to_string()),
        ("user", "admin".to_string()),
        ("password", "secret".to_string()),
    ]);
    let (conn, mut client) = mock_client(params);
    let err = gateway().handle(Route::SshShell, conn).await.unwrap_err();
    assert!(matches!(err, Error::DialFailed { .. }));

    let frames = client.frames_until_closed().await;
    let text = frames.iter().find_map(stderr_text).unwrap();
    assert!(text.starts_with("Failed to dial"), "{text}");
}

#[tokio::test]
async fn ssh_exec_requires_a_command() {
    let params = RequestParams::from_pairs([("hostname", "127.0.0.1"), ("user", "admin")]);
    let (conn, mut client) = mock_client(params);
    let err = gateway().handle(Route::SshExec, conn).await.unwrap_err();
    assert!(matches!(err, Error::InvalidParam { ref name, .. } if name == "cmd"));
    assert!(!client.frames_until_closed().await.is_empty());
}

#[tokio::test]
#[cfg(unix)]
async fn exec_route_feeds_stdin_when_enabled() {
    let params = RequestParams::from_pairs([("exec", "cat"), ("stdin", "on")]);
    let (conn, mut client) = mock_client(params);
    let gw = gateway();
    let session = tokio::spawn(async move { gw.handle(Route::Exec, conn).await });

    client.send_binary(&b"ping\n"[..]);
    let mut echoed = Vec::new();
    while echoed.len() < 5 {
        let frame = client.next_frame().await.unwrap();
        echoed.extend(binary_payload(&[frame]));
    }
    assert_eq!(echoed, b"ping\n");

    client.hang_up();
    session.await.unwrap().unwrap();
}
