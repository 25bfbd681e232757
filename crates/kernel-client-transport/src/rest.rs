//! REST client for the `/api/kernels` endpoints.

use std::time::Duration;

use async_trait::async_trait;
use kernel_client_core::{KernelApi, KernelInfo, ServerConfig, Timeouts, TransportError};
use reqwest::{Method, RequestBuilder, Response, StatusCode, header};
use serde_json::json;

/// HTTP implementation of [`KernelApi`].
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    config: ServerConfig,
    timeouts: Timeouts,
}

impl RestClient {
    /// Create a client for `config`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: ServerConfig, timeouts: Timeouts) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            config,
            timeouts,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn request(&self, method: Method, url: &str, timeout: Duration) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, url)
            .header(header::CONTENT_TYPE, "application/json")
            .timeout(timeout);
        if let Some(auth) = self.config.auth_header() {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder
    }

    async fn send(builder: RequestBuilder, timeout: Duration) -> Result<Response, TransportError> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Http(e.to_string())
            }
        })
    }
}

async fn require_success(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl KernelApi for RestClient {
    async fn create_kernel(&self) -> Result<KernelInfo, TransportError> {
        let timeout = self.timeouts.create;
        let url = self.config.kernels_url();
        tracing::debug!(%url, "Creating kernel");

        let builder = self.request(Method::POST, &url, timeout).json(&json!({}));
        let response = require_success(Self::send(builder, timeout).await?).await?;
        response
            .json::<KernelInfo>()
            .await
            .map_err(|e| TransportError::Http(format!("Failed to parse kernel: {e}")))
    }

    async fn list_kernels(&self) -> Result<Vec<KernelInfo>, TransportError> {
        let timeout = self.timeouts.probe;
        let builder = self.request(Method::GET, &self.config.kernels_url(), timeout);
        let response = require_success(Self::send(builder, timeout).await?).await?;
        response
            .json::<Vec<KernelInfo>>()
            .await
            .map_err(|e| TransportError::Http(format!("Failed to parse kernel list: {e}")))
    }

    async fn delete_kernel(&self, kernel_id: &str) -> Result<(), TransportError> {
        let timeout = self.timeouts.shutdown;
        let builder = self.request(Method::DELETE, &self.config.kernel_url(kernel_id), timeout);
        let response = Self::send(builder, timeout).await?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(kernel_id, "Kernel already gone");
            return Ok(());
        }
        require_success(response).await.map(drop)
    }

    async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), TransportError> {
        let timeout = self.timeouts.shutdown;
        let builder = self.request(Method::POST, &self.config.interrupt_url(kernel_id), timeout);
        require_success(Self::send(builder, timeout).await?)
            .await
            .map(drop)
    }
}
