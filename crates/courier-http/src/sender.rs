//! Point-to-point delivery over HTTP
//!
//! One `POST` per envelope with the envelope's JSON as the body. The response
//! status and body are handed back untouched; only failures below HTTP
//! (refused connection, timeout, DNS) become a [`TransportError`].
//! Nothing is retried.

use async_trait::async_trait;
use courier_mesh::{Delivery, Envelope, Sender, TransportError};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Default timeout for outbound requests
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the HTTP client used for outbound delivery
///
/// The client pools connections and is cheap to clone, so one client can back
/// many senders.
pub fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(format!("courier/{}", env!("CARGO_PKG_VERSION")))
        .build()
}

/// [`Sender`] that POSTs envelopes to a fixed endpoint
#[derive(Clone)]
pub struct HttpSender {
    endpoint: Url,
    http: Client,
}

impl std::fmt::Debug for HttpSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSender")
            .field("endpoint", &self.endpoint.as_str())
            .finish()
    }
}

impl HttpSender {
    /// Create a sender with its own client
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the HTTP client cannot be built.
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, TransportError> {
        let http = build_client(timeout).map_err(|e| TransportError::new(endpoint.as_str(), e))?;
        Ok(Self::with_http_client(endpoint, http))
    }

    /// Create a sender sharing an existing client
    pub fn with_http_client(endpoint: Url, http: Client) -> Self {
        Self { endpoint, http }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, envelope: &Envelope) -> Result<Delivery, TransportError> {
        debug!(url = %self.endpoint, to = %envelope.to(), "Sending envelope");

        let response = self
            .http
            .post(self.endpoint.clone())
            .json(envelope)
            .send()
            .await
            .map_err(|e| TransportError::new(self.endpoint.as_str(), e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::new(self.endpoint.as_str(), e))?;

        debug!(url = %self.endpoint, status, "Envelope delivered");
        Ok(Delivery { status, body })
    }
}
