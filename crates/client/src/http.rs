use std::time::Duration;

use reqwest::header::{ACCEPT, HeaderValue};
use serde::de::DeserializeOwned;
use snafu::{OptionExt, ResultExt};
use url::Url;

use super::config::normalize_endpoint;
use super::protocol::{ChatRequest, InfoResponse, InitRequest, InitResponse, SessionOffsets};
use super::transport::{
    BoxFuture, ChatTransport, DecodeSnafu, InvalidEndpointSnafu, ParseUrlSnafu, RequestSnafu,
    StatusSnafu, TransportResult,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-over-HTTP transport for the chat backend.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl AsRef<str>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::with_client(client, endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl AsRef<str>) -> Self {
        Self {
            client,
            endpoint: normalize_endpoint(endpoint.as_ref()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> TransportResult<Url> {
        let raw = format!("{}{path}", self.endpoint);
        Url::parse(&raw).context(ParseUrlSnafu {
            stage: "build-service-url",
            url: raw.clone(),
        })
    }

    fn info_url(&self, session_id: &str, offsets: Option<SessionOffsets>) -> TransportResult<Url> {
        let mut url = self.url("/info")?;
        url.path_segments_mut()
            .ok()
            .context(InvalidEndpointSnafu {
                stage: "build-info-url",
                endpoint: self.endpoint.clone(),
            })?
            .push(session_id);

        if let Some(offsets) = offsets {
            url.query_pairs_mut()
                .append_pair("offsetHistory", &offsets.history.to_string())
                .append_pair("offsetText", &offsets.text.to_string());
        }

        Ok(url)
    }

    /// Sends `request` and returns the raw body of a 2xx response.
    async fn execute(&self, request: reqwest::RequestBuilder, path: &str) -> TransportResult<String> {
        let response = request
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .send()
            .await
            .context(RequestSnafu {
                stage: "send-service-request",
                path,
            })?;
        let status = response.status();
        let payload = response.text().await.context(RequestSnafu {
            stage: "read-service-response",
            path,
        })?;

        if !status.is_success() {
            tracing::debug!(
                path,
                status = status.as_u16(),
                body_len = payload.len(),
                "chat service answered with a non-success status"
            );
            return StatusSnafu {
                stage: "service-http-status",
                path,
                status: status.as_u16(),
                body: payload,
            }
            .fail();
        }

        Ok(payload)
    }

    fn decode<T: DeserializeOwned>(payload: &str, path: &str) -> TransportResult<T> {
        // An empty 2xx body reads as an empty object.
        let payload = if payload.trim().is_empty() { "{}" } else { payload };
        serde_json::from_str(payload).context(DecodeSnafu {
            stage: "decode-service-response",
            path,
        })
    }
}

impl ChatTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn init_session<'a>(
        &'a self,
        request: InitRequest,
    ) -> BoxFuture<'a, TransportResult<InitResponse>> {
        Box::pin(async move {
            let path = "/init";
            let url = self.url(path)?;
            let payload = self
                .execute(self.client.post(url).json(&request), path)
                .await?;
            Self::decode(&payload, path)
        })
    }

    fn send_chat<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            let path = "/chat";
            let url = self.url(path)?;
            self.execute(self.client.post(url).json(&request), path)
                .await?;
            Ok(())
        })
    }

    fn fetch_info<'a>(
        &'a self,
        session_id: &'a str,
        offsets: Option<SessionOffsets>,
    ) -> BoxFuture<'a, TransportResult<InfoResponse>> {
        Box::pin(async move {
            let path = "/info";
            let url = self.info_url(session_id, offsets)?;
            let payload = self.execute(self.client.get(url), path).await?;
            Self::decode(&payload, path)
        })
    }
}
