use snafu::Snafu;

use super::transport::{FailureKind, TransportError};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("no chat session is active on `{stage}`"))]
    NoSession { stage: &'static str },
    #[snafu(display("chat service returned no usable session id on `{stage}`"))]
    InitializationFailed { stage: &'static str },
    #[snafu(display("failed to deliver chat message on `{stage}`: {source}"))]
    Send {
        stage: &'static str,
        source: TransportError,
    },
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Send { source, .. } => source.status(),
            Self::NoSession { .. } | Self::InitializationFailed { .. } => None,
        }
    }

    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Send { source, .. } => Some(source.kind()),
            Self::NoSession { .. } | Self::InitializationFailed { .. } => None,
        }
    }

    pub fn is_session_expired(&self) -> bool {
        self.kind() == Some(FailureKind::SessionExpired)
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
