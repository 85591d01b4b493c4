//! `reqwest` transport adapter.

use async_trait::async_trait;

use super::{Transport, TransportError, TransportRequest, TransportResponse};

/// Production [`Transport`] backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Adapter over a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter over a preconfigured client (connection pools, proxies,
    /// TLS settings live there).
    pub fn with_client(client: reqwest::Client) -> Self {
        ReqwestTransport { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|error| TransportError::InvalidUrl(error.to_string()))?;

        let mut builder = self
            .client
            .request(request.method, url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|error| TransportError::Connect(Box::new(error)))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|error| TransportError::Connect(Box::new(error)))?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
