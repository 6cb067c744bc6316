use std::{fmt::Display, future::Future, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{
            close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket,
            WebSocketUpgrade,
        },
        State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt,
};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    config::RelayConfig,
    error::{current_request_id, with_request_id_scope, ErrorCode},
    pump::{self, Heartbeat, Link},
    upstream::{UpstreamConnector, UpstreamSocket},
};

const HEARTBEAT_INTERVAL_SECS: u64 = 20;
const PONG_TIMEOUT_SECS: u64 = 10;
const CLOSE_TIMEOUT_SECS: u64 = 5;
const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

pub const DEFAULT_HEARTBEAT: Heartbeat = Heartbeat {
    interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
    pong_timeout: Duration::from_secs(PONG_TIMEOUT_SECS),
};

type ClientLink = Link<SplitStream<WebSocket>, SplitSink<WebSocket, Message>>;
type UpstreamLink = Link<SplitStream<UpstreamSocket>, SplitSink<UpstreamSocket, UpstreamMessage>>;

pub struct RelayState<C> {
    config: Arc<RelayConfig>,
    connector: Arc<C>,
    heartbeat: Heartbeat,
    shutdown: CancellationToken,
}

impl<C> Clone for RelayState<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            connector: Arc::clone(&self.connector),
            heartbeat: self.heartbeat,
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<C: UpstreamConnector> RelayState<C> {
    /// `shutdown` tears down every live session when cancelled.
    pub fn new(config: Arc<RelayConfig>, connector: C, shutdown: CancellationToken) -> Self {
        Self { config, connector: Arc::new(connector), heartbeat: DEFAULT_HEARTBEAT, shutdown }
    }
}

#[cfg(test)]
impl<C> RelayState<C> {
    pub(crate) fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

pub fn router<C: UpstreamConnector>(state: RelayState<C>) -> Router {
    Router::new().route("/ws", get(ws_upgrade::<C>)).with_state(state)
}

async fn ws_upgrade<C: UpstreamConnector>(
    State(state): State<RelayState<C>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // Checked before the upgrade so a misconfigured server answers with a
    // readable 500 instead of a socket that closes immediately.
    if let Err(error) = state.config.ensure_credentials() {
        error!(code = error.code().as_str(), error = %error, "refusing websocket upgrade");
        return error.into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let request_id = current_request_id().unwrap_or_else(|| Uuid::new_v4().to_string());
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_failed_upgrade(|error| warn!(error = %error, "client websocket upgrade failed"))
        .on_upgrade(move |socket| {
            let session_id = Uuid::new_v4();
            let span = info_span!("session", %session_id, request_id = %request_id);
            with_request_id_scope(request_id, handle_socket(state, socket)).instrument(span)
        })
}

async fn handle_socket<C: UpstreamConnector>(state: RelayState<C>, socket: WebSocket) {
    let mut session = Session { client: Link::split(socket), upstream: None };
    info!("client connected, opening upstream");

    match state.connector.connect().await {
        Ok(upstream) => {
            debug!("upstream connected, relaying");
            let upstream = session.upstream.insert(Link::split(upstream));
            let report =
                pump::run(&mut session.client, upstream, state.heartbeat, &state.shutdown).await;
            info!(
                reason = report.reason.as_str(),
                client_to_upstream = report.client_to_upstream,
                upstream_to_client = report.upstream_to_client,
                "relay finished"
            );
        }
        Err(error) => {
            warn!(error = %error, "upstream connect failed");
            let notice = CloseFrame {
                code: close_code::ERROR,
                reason: ErrorCode::UpstreamUnavailable.default_message().into(),
            };
            release("client", session.client.tx.send(Message::Close(Some(notice)))).await;
        }
    }

    session.teardown().await;
}

/// Both legs of one relay. Torn down exactly once, on every exit path.
struct Session {
    client: ClientLink,
    upstream: Option<UpstreamLink>,
}

impl Session {
    async fn teardown(mut self) {
        if let Some(upstream) = self.upstream.as_mut() {
            release("upstream", upstream.tx.close()).await;
        }
        release("client", self.client.tx.close()).await;
        debug!("session closed");
    }
}

/// Runs one close step. Failures and timeouts are logged, never raised.
async fn release<F, E>(leg: &'static str, close: F)
where
    F: Future<Output = Result<(), E>>,
    E: Display,
{
    match tokio::time::timeout(Duration::from_secs(CLOSE_TIMEOUT_SECS), close).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => debug!(leg, error = %error, "close failed, ignoring"),
        Err(_) => debug!(leg, "close timed out, dropping socket"),
    }
}
