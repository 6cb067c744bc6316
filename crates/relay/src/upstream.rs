use std::{future::Future, time::Duration};

use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::config::RelayConfig;

pub const REALTIME_ENDPOINT: &str = "wss://rest-assistant.api.cloud.yandex.net/v1/realtime/openai";
const CONNECT_TIMEOUT_SECS: u64 = 30;

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid upstream endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("api key contains characters that cannot be sent in a header")]
    InvalidCredential,
    #[error("upstream handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),
    #[error("upstream handshake timed out after {0:?}")]
    Timeout(Duration),
}

/// Opens the upstream leg of a session.
pub trait UpstreamConnector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<UpstreamSocket, ConnectError>> + Send;
}

/// Connects to the realtime API with the server-held API key attached.
#[derive(Clone)]
pub struct RealtimeConnector {
    endpoint: Url,
    authorization: HeaderValue,
}

impl RealtimeConnector {
    pub fn from_config(config: &RelayConfig) -> Result<Self, ConnectError> {
        Self::with_base(REALTIME_ENDPOINT, config)
    }

    /// Same credentials and model, different host. Lets tests aim the
    /// connector at a local listener.
    pub fn with_base(base: &str, config: &RelayConfig) -> Result<Self, ConnectError> {
        let endpoint = realtime_url(base, &config.folder_id, &config.model)?;
        let mut authorization = HeaderValue::from_str(&format!("api-key {}", config.api_key))
            .map_err(|_| ConnectError::InvalidCredential)?;
        authorization.set_sensitive(true);
        Ok(Self { endpoint, authorization })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl UpstreamConnector for RealtimeConnector {
    async fn connect(&self) -> Result<UpstreamSocket, ConnectError> {
        let mut request = self.endpoint.as_str().into_client_request()?;
        request.headers_mut().insert(AUTHORIZATION, self.authorization.clone());

        let timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS);
        let (socket, response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| ConnectError::Timeout(timeout))??;

        debug!(
            endpoint = %self.endpoint,
            status = response.status().as_u16(),
            "upstream handshake completed"
        );
        Ok(socket)
    }
}

/// `{base}?model=gpt://{folder_id}/{model}`. The model URI is kept
/// readable; only characters illegal in a query get escaped.
pub fn realtime_url(base: &str, folder_id: &str, model: &str) -> Result<Url, ConnectError> {
    let mut url = Url::parse(base)?;
    url.set_query(Some(&format!("model=gpt://{folder_id}/{model}")));
    Ok(url)
}
