pub mod config;
pub mod demo;
pub mod error;
pub mod http;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::{DEFAULT_POLL_INTERVAL_MS, DEFAULT_STORAGE_KEY, ServiceConfig, normalize_endpoint};
pub use demo::{DemoTransport, default_demo_replies};
pub use error::{ClientError, ClientResult};
pub use http::HttpTransport;
pub use protocol::{
    ChatInput, ChatRequest, HistoryEntry, InfoResponse, InitRequest, InitResponse, SessionOffsets,
};
pub use session::{FetchOutcome, FetchedInfo, SessionClient};
pub use transport::{BoxFuture, ChatTransport, FailureKind, TransportError, TransportResult};
