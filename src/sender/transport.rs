//! Batch transports.

use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::config::HttpSection;
use crate::destination::Destination;
use crate::metric::MetricEntry;

/// Delivery errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {destination} failed: {source}")]
    Request {
        destination: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{destination} responded with status {status}")]
    Status { destination: String, status: u16 },

    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),

    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Errors caused by the destination or the network, as opposed to a
    /// problem with the agent itself.
    pub fn is_destination_failure(&self) -> bool {
        matches!(
            self,
            Self::Request { .. } | Self::Status { .. } | Self::Other(_)
        )
    }
}

/// Request body for one batch.
#[derive(Debug, Serialize)]
pub struct Payload<'a> {
    pub token: Option<&'a str>,
    pub metrics: &'a [MetricEntry],
}

/// Ships one batch to one destination.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, destination: &Destination, batch: &[MetricEntry])
    -> Result<(), TransportError>;
}

// =============================================================================
// HTTP
// =============================================================================

/// JSON-over-HTTP(S) transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    scheme: &'static str,
    path: String,
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(http: &HttpSection) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .timeout(http.request_timeout)
            .user_agent(concat!("ferry/", env!("CARGO_PKG_VERSION")));
        if http.ssl && !http.ssl_verify {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let client = builder.build().map_err(TransportError::Client)?;

        Ok(Self {
            client,
            scheme: if http.ssl { "https" } else { "http" },
            path: http.path.clone(),
            username: http.username.clone(),
            password: http.password.clone(),
            token: http.auth_token.clone(),
        })
    }

    /// Full request URL for a destination.
    pub fn endpoint(&self, destination: &Destination) -> Result<Url, TransportError> {
        Ok(Url::parse(&format!(
            "{}://{}{}",
            self.scheme, destination, self.path
        ))?)
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        destination: &Destination,
        batch: &[MetricEntry],
    ) -> Result<(), TransportError> {
        let url = self.endpoint(destination)?;
        let body = serde_json::to_vec(&Payload {
            token: self.token.as_deref(),
            metrics: batch,
        })?;

        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|source| TransportError::Request {
                destination: destination.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                destination: destination.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Dry run
// =============================================================================

/// Logs each batch instead of sending it.
#[derive(Debug, Clone, Default)]
pub struct DryRunTransport {
    token: Option<String>,
}

impl DryRunTransport {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait::async_trait]
impl Transport for DryRunTransport {
    async fn send(
        &self,
        destination: &Destination,
        batch: &[MetricEntry],
    ) -> Result<(), TransportError> {
        let body = serde_json::to_string(&Payload {
            token: self.token.as_deref(),
            metrics: batch,
        })?;
        tracing::info!(destination = %destination, metrics = batch.len(), body = %body, "Dry run, batch not sent");
        Ok(())
    }
}
