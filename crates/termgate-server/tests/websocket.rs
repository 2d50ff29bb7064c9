//! End-to-end tests through the WebSocket front door.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use termgate_core::protocol::MessageType;
use termgate_server::exec::CommandResolver;
use termgate_server::{Gateway, GatewayConfig, ws};

async fn start_server() -> SocketAddr {
    let gateway = Arc::new(Gateway::new(
        GatewayConfig::default(),
        Arc::new(CommandResolver::with_roots(Vec::new())),
    ));
    let app = ws::router(gateway, None);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Collect binary payload and text frames until the server closes.
async fn drain<S>(ws: &mut S) -> (Vec<u8>, Vec<String>)
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut binary = Vec::new();
    let mut text = Vec::new();
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Binary(data)) => binary.extend_from_slice(&data),
            Ok(Message::Text(t)) => text.push(t.to_string()),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    (binary, text)
}

#[tokio::test]
#[cfg(unix)]
async fn exec_over_websocket() {
    let addr = start_server().await;
    let url = format!("ws://{}/cmd?exec=sh&arg0=-c&arg1=echo%20hi", addr);
    let (mut ws, _) = connect_async(url).await.unwrap();

    let (binary, text) = drain(&mut ws).await;
    assert_eq!(binary, b"hi\n");
    assert!(text.is_empty(), "unexpected control messages: {text:?}");
}

#[tokio::test]
#[cfg(unix)]
async fn stdin_over_websocket() {
    let addr = start_server().await;
    let url = format!("ws://{}/cmd?exec=head&arg0=-n1&stdin=on", addr);
    let (mut ws, _) = connect_async(url).await.unwrap();

    ws.send(Message::Binary(b"typed\n".to_vec().into())).await.unwrap();
    let (binary, _) = drain(&mut ws).await;
    assert_eq!(binary, b"typed\n");
}

#[tokio::test]
async fn errors_arrive_as_control_messages() {
    let addr = start_server().await;
    let url = format!("ws://{}/ssh?user=admin", addr);
    let (mut ws, _) = connect_async(url).await.unwrap();

    let (binary, text) = drain(&mut ws).await;
    assert!(binary.is_empty());
    let message = termgate_core::Message::parse(&text[0]).unwrap();
    assert_eq!(message.kind, MessageType::Stderr);
    assert!(String::from_utf8_lossy(&message.data).contains("hostname"));
}

#[tokio::test]
async fn unknown_paths_are_not_found() {
    let addr = start_server().await;
    let err = connect_async(format!("ws://{}/nope", addr)).await.unwrap_err();
    assert!(err.to_string().contains("404"), "{err}");
}
