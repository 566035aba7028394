//! HTTP gateway
//!
//! - `GET /read/:channel` local history as `[{date, value}]`
//! - `GET /read_all/:channel` fan-out read across the mesh
//! - `POST /write/:channel` write a JSON body through the write path
//! - `POST /connect` open a peer link with channel intents
//!
//! Write and connect answer success as soon as the work is dispatched unless
//! `gateway.surface_errors` is set.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use skein_core::{ChannelName, PeerKey, SkeinError, SkeinResult, SubscriptionIntent};

use crate::channel::blocking;
use crate::Node;

/// Body of `POST /connect`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectRequest {
    pub host: String,
    #[serde(deserialize_with = "port_number")]
    pub port: u16,
    pub subscriptions: Vec<SubscriptionIntent>,
}

impl ConnectRequest {
    pub fn parse(body: &[u8]) -> SkeinResult<Self> {
        let request: ConnectRequest = serde_json::from_slice(body)
            .map_err(|e| SkeinError::MalformedConnectRequest(e.to_string()))?;
        if request.host.trim().is_empty() {
            return Err(SkeinError::MalformedConnectRequest("host is empty".into()));
        }
        Ok(request)
    }

    pub fn key(&self) -> PeerKey {
        PeerKey::new(self.host.clone(), self.port)
    }
}

/// Accept the port as a number or a numeric string
fn port_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Clone)]
struct GatewayState {
    node: Arc<Node>,
    surface_errors: bool,
}

pub fn router(node: Arc<Node>) -> Router {
    let body_limit = node.config().gateway.max_body_bytes;
    let surface_errors = node.config().gateway.surface_errors;
    let state = GatewayState {
        node,
        surface_errors,
    };

    Router::new()
        .route("/read/:channel", get(read_channel))
        .route("/read_all/:channel", get(read_all_channel))
        .route("/write/:channel", post(write_channel))
        .route("/connect", post(connect))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Serve the gateway on `listener` until `shutdown` resolves
pub async fn serve(
    node: Arc<Node>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> SkeinResult<()> {
    let addr = listener.local_addr()?;
    info!(%addr, node = %node.name(), "gateway listening");
    axum::serve(listener, router(node))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| SkeinError::TransportError(e.to_string()))
}

fn failure(e: &SkeinError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

async fn read_channel(State(state): State<GatewayState>, Path(channel): Path<String>) -> Response {
    let channel = ChannelName::from(channel);
    let node = Arc::clone(&state.node);
    let target = channel.clone();
    match blocking(move || node.read(&target)).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => {
            error!(%channel, error = %e, "read failed");
            failure(&e)
        }
    }
}

async fn read_all_channel(
    State(state): State<GatewayState>,
    Path(channel): Path<String>,
) -> Response {
    let channel = ChannelName::from(channel);
    Json(state.node.read_all(&channel).await).into_response()
}

async fn write_channel(
    State(state): State<GatewayState>,
    Path(channel): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let channel = ChannelName::from(channel);
    let node = Arc::clone(&state.node);
    let target = channel.clone();
    if let Err(e) = blocking(move || node.write(&target, body)).await {
        error!(%channel, error = %e, "gateway write failed");
        if state.surface_errors {
            return failure(&e);
        }
    }
    Json(json!({ "thanks": true })).into_response()
}

async fn connect(State(state): State<GatewayState>, body: Bytes) -> Response {
    let request = match ConnectRequest::parse(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "rejecting connect request");
            return failure(&e);
        }
    };
    let key = request.key();

    if state.surface_errors {
        if let Err(e) = state.node.connect_to_peer(key, request.subscriptions).await {
            return failure(&e);
        }
    } else {
        let node = Arc::clone(&state.node);
        tokio::spawn(async move {
            if let Err(e) = node.connect_to_peer(key.clone(), request.subscriptions).await {
                error!(peer = %key, error = %e, "connect failed");
            }
        });
    }

    Json(json!({ "message": "connection successful" })).into_response()
}
