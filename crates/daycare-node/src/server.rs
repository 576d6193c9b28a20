//! HTTP and WebSocket surface of a daycare host.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, State};
use axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use axum::http::HeaderValue;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use daycare_spec::{
    DaycareRequest, DaycareResponse, TRANSCRIPT_DATA_LIMIT, TRANSCRIPT_EVENT_COUNT_LIMIT,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::limiter::Limiter;
use crate::runtime::ContainerRuntime;
use crate::session::{run_session, ResponseSink, SinkError};
use crate::uid::UidPool;
use crate::validate::ActionRoute;

/// Shared by every session on this host.
#[derive(Clone)]
pub struct DaycareState {
    pub secret: Arc<[u8]>,
    pub hostname: String,
    pub authority_url: String,
    pub limiter: Limiter,
    pub uids: UidPool,
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Stream bytes kept in a graded transcript.
    pub transcript_data_limit: usize,
    /// Events kept in a graded transcript.
    pub transcript_event_limit: usize,
}

impl DaycareState {
    pub fn new(
        secret: Vec<u8>,
        hostname: String,
        authority_url: String,
        capacity: usize,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            secret: secret.into(),
            hostname,
            authority_url,
            limiter: Limiter::new(capacity),
            uids: UidPool::new(),
            runtime,
            transcript_data_limit: TRANSCRIPT_DATA_LIMIT,
            transcript_event_limit: TRANSCRIPT_EVENT_COUNT_LIMIT,
        }
    }

    pub fn with_transcript_limits(mut self, data_limit: usize, event_limit: usize) -> Self {
        self.transcript_data_limit = data_limit;
        self.transcript_event_limit = event_limit;
        self
    }

    /// Origin browsers may open sockets from.
    fn allowed_origin(&self) -> Option<HeaderValue> {
        let origin = self.authority_url.trim_end_matches('/');
        if origin.is_empty() {
            return None;
        }
        HeaderValue::from_str(origin).ok()
    }
}

pub fn router(state: DaycareState) -> Router {
    Router::new()
        .route("/v2/health", get(health))
        .route("/v2/sockets/{problem_type}/{action}", get(action_socket))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn action_socket(
    State(state): State<DaycareState>,
    AxumPath((problem_type, action)): AxumPath<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = state.allowed_origin();
    let route = ActionRoute {
        problem_type,
        action,
    };
    let mut response = ws.on_upgrade(move |socket| serve_socket(state, route, socket));
    if let Some(origin) = origin {
        response
            .headers_mut()
            .insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    }
    response
}

/// Response frames written as JSON text messages.
pub struct SocketSink {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl ResponseSink for SocketSink {
    async fn send(&mut self, response: &DaycareResponse) -> Result<(), SinkError> {
        let json = serde_json::to_string(response)?;
        self.sender
            .send(Message::Text(json.into()))
            .await
            .map_err(|err| SinkError::Closed(err.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sender.close().await;
    }
}

async fn read_request(receiver: &mut SplitStream<WebSocket>) -> Result<DaycareRequest, String> {
    while let Some(frame) = receiver.next().await {
        let frame = frame.map_err(|err| format!("reading request: {err}"))?;
        let decoded = match frame {
            Message::Text(text) => serde_json::from_str(text.as_str()),
            Message::Binary(data) => serde_json::from_slice(&data),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        return decoded.map_err(|err| format!("decoding request: {err}"));
    }
    Err("connection closed before a request arrived".to_string())
}

async fn serve_socket(state: DaycareState, route: ActionRoute, socket: WebSocket) {
    let (sender, mut receiver) = socket.split();
    let mut sink = SocketSink { sender };

    let request = match read_request(&mut receiver).await {
        Ok(request) => request,
        Err(message) => {
            warn!(problem_type = %route.problem_type, action = %route.action, error = %message, "bad request");
            if let Err(err) = sink.send(&DaycareResponse::error(message)).await {
                warn!(error = %err, "failed to send error response");
            }
            sink.close().await;
            return;
        }
    };

    // Later frames carry nothing we act on; keep reading so control frames
    // are answered and a client close is noticed.
    let drain = tokio::spawn(async move { while let Some(Ok(_)) = receiver.next().await {} });

    let user_id = request
        .commit_bundle
        .as_ref()
        .map(|bundle| bundle.user_id)
        .or(request.user_id);
    let span = info_span!(
        "session",
        session = %Uuid::new_v4(),
        user_id,
        problem_type = %route.problem_type,
        action = %route.action,
    );
    run_session(&state, &route, request, sink)
        .instrument(span)
        .await;
    drain.abort();
}
