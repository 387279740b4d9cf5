use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;

use super::protocol::{ChatRequest, InfoResponse, InitRequest, InitResponse, SessionOffsets};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TransportResult<T> = Result<T, TransportError>;

/// Failure classes the session layer reacts to differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Network or HTTP failure without a meaningful status. Retried while polling.
    Transport,
    /// The backend no longer knows the session (HTTP 404).
    SessionExpired,
    /// The response body did not match the protocol. Retried like `Transport`.
    ProtocolDrift,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("endpoint '{endpoint}' cannot be used as a base URL on `{stage}`"))]
    InvalidEndpoint { stage: &'static str, endpoint: String },
    #[snafu(display("endpoint URL '{url}' is invalid on `{stage}`: {source}"))]
    ParseUrl {
        stage: &'static str,
        url: String,
        source: url::ParseError,
    },
    #[snafu(display("request to {path} failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        path: String,
        source: reqwest::Error,
    },
    #[snafu(display("chat service request to {path} failed with status {status}"))]
    Status {
        stage: &'static str,
        path: String,
        status: u16,
        body: String,
    },
    #[snafu(display("chat service response from {path} is malformed on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        path: String,
        source: serde_json::Error,
    },
}

impl TransportError {
    /// HTTP status carried by the failure, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Request { source, .. } => source.status().map(|status| status.as_u16()),
            Self::InvalidEndpoint { .. } | Self::ParseUrl { .. } | Self::Decode { .. } => None,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            _ if self.status() == Some(404) => FailureKind::SessionExpired,
            Self::Decode { .. } => FailureKind::ProtocolDrift,
            _ => FailureKind::Transport,
        }
    }

    pub fn is_session_expired(&self) -> bool {
        self.kind() == FailureKind::SessionExpired
    }
}

/// Remote half of the chat protocol.
pub trait ChatTransport: Send + Sync {
    fn name(&self) -> &str;

    /// `POST /init`.
    fn init_session<'a>(
        &'a self,
        request: InitRequest,
    ) -> BoxFuture<'a, TransportResult<InitResponse>>;

    /// `POST /chat`. The acknowledgement body is opaque.
    fn send_chat<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, TransportResult<()>>;

    /// `GET /info/{id}`; `offsets` selects the incremental form with query parameters.
    fn fetch_info<'a>(
        &'a self,
        session_id: &'a str,
        offsets: Option<SessionOffsets>,
    ) -> BoxFuture<'a, TransportResult<InfoResponse>>;
}
