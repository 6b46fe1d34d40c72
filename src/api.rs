use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, info};

use crate::relay::RelayState;
use crate::session::Session;

const NOSTR_JSON: &str = "application/nostr+json";
const MAX_REQUEST_BODY: usize = 64 * 1024;
const PLAIN_HINT: &str = "nothing to see here, you must use a nip-29 powered client";

/// NIP-11 relay information document.
#[derive(Debug, Serialize)]
pub struct RelayInformation {
    pub name: String,
    pub description: String,
    pub pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub supported_nips: Vec<u16>,
    pub software: String,
    pub version: String,
}

impl RelayInformation {
    pub fn from_state(relay: &RelayState) -> Self {
        let info = &relay.config.relay;
        Self {
            name: info.name.clone(),
            description: info.description.clone(),
            pubkey: relay.pubkey().to_hex(),
            contact: info.contact.clone(),
            icon: info.icon.clone(),
            supported_nips: vec![1, 9, 11, 29, 42, 45],
            software: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

pub fn router(relay: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY))
        .with_state(relay)
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    relay: Arc<RelayState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Relay listening on {}", addr);

    axum::serve(
        listener,
        router(relay).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .with_context(|| "Relay server error")?;

    Ok(())
}

async fn handle_root(
    State(relay): State<Arc<RelayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Ok(ws) = ws {
        return ws.on_upgrade(move |socket| serve_socket(socket, relay, peer));
    }

    let wants_info = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains(NOSTR_JSON));

    if wants_info {
        let body = match serde_json::to_string(&RelayInformation::from_state(&relay)) {
            Ok(body) => body,
            Err(e) => return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        };
        (
            [
                (header::CONTENT_TYPE, NOSTR_JSON),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            ],
            body,
        )
            .into_response()
    } else {
        PLAIN_HINT.into_response()
    }
}

async fn serve_socket(socket: WebSocket, relay: Arc<RelayState>, peer: SocketAddr) {
    info!(%peer, "client connected");

    let (mut sink, mut incoming) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(relay.config.policy.queue_capacity);

    // Writer runs on its own so handlers can queue frames while subscriptions
    // are filling the same queue.
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session::new(relay, tx);
    if session.greet().await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            message = incoming.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = session.handle(text.as_str()).await {
                        debug!(%peer, "Dropping session: {}", e);
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%peer, "WebSocket error: {}", e);
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    session.close();
    info!(%peer, authed = ?session.authed(), "client disconnected");
}
