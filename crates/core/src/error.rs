use palaver_client::ClientError;
use snafu::Snafu;

use super::events::SendAvailability;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("refusing to send an empty message on `{stage}`"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("sending is not possible right now ({availability:?}) on `{stage}`"))]
    SendUnavailable {
        stage: &'static str,
        availability: SendAvailability,
    },
    #[snafu(display("chat session is unavailable on `{stage}`: {source}"))]
    Session {
        stage: &'static str,
        source: ClientError,
    },
    #[snafu(display("chat message was not delivered on `{stage}`: {source}"))]
    Delivery {
        stage: &'static str,
        source: ClientError,
    },
}

impl EngineError {
    /// HTTP status behind a failed delivery, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Session { source, .. } | Self::Delivery { source, .. } => source.status(),
            Self::EmptyMessage { .. } | Self::SendUnavailable { .. } => None,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
