//! WebSocket front door.
//!
//! Each route upgrades to a WebSocket and hands the socket, wrapped as a
//! [`ClientConnection`], to the [`Gateway`]. Query parameters become the
//! request parameters; repeated names keep every value.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tower_http::services::ServeDir;
use tracing::debug;

use termgate_core::{ClientConnection, Error, Frame, FrameSink, FrameSource, RequestParams, Result};

use crate::bridge::{Gateway, Route};

struct WsSource {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(ws_error(e))),
            };
            match msg {
                WsMessage::Text(text) => return Some(Ok(Frame::Text(text.to_string()))),
                WsMessage::Binary(data) => return Some(Ok(Frame::Binary(data))),
                WsMessage::Close(_) => return None,
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            }
        }
    }
}

struct WsSink {
    sink: SplitSink<WebSocket, WsMessage>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let msg = match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Binary(data) => WsMessage::Binary(data),
        };
        self.sink.send(msg).await.map_err(ws_error)
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await.map_err(ws_error)
    }
}

fn ws_error(e: axum::Error) -> Error {
    Error::Transport {
        message: format!("websocket: {}", e),
    }
}

/// Wrap an upgraded socket.
pub fn ws_connection(socket: WebSocket, params: RequestParams) -> ClientConnection {
    let (sink, stream) = socket.split();
    ClientConnection::new(
        params,
        Box::new(WsSource { stream }),
        Box::new(WsSink { sink }),
    )
}

/// One WebSocket route per [`Route`], with static files from `static_dir`
/// for everything else.
pub fn router(gateway: Arc<Gateway>, static_dir: Option<PathBuf>) -> Router {
    let mut router = Router::new();
    for route in Route::ALL {
        router = router.route(
            &route.path(),
            get(
                move |State(gateway): State<Arc<Gateway>>,
                      Query(query): Query<Vec<(String, String)>>,
                      ws: WebSocketUpgrade| async move {
                    upgrade(gateway, route, query, ws)
                },
            ),
        );
    }
    if let Some(dir) = static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }
    router.with_state(gateway)
}

fn upgrade(
    gateway: Arc<Gateway>,
    route: Route,
    query: Vec<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let params = RequestParams::from_pairs(query);
    ws.on_upgrade(move |socket| async move {
        let conn = ws_connection(socket, params);
        if let Err(e) = gateway.handle(route, conn).await {
            debug!(route = route.name(), error = %e, "websocket session ended with error");
        }
    })
}
