//! Remote API seam.
//!
//! Strategies and the sync manager talk to the server through [`RemoteApi`].
//! [`HttpRemote`] is the reqwest implementation; every call made by this
//! crate goes through [`send_with_timeout`], so any implementation gets the
//! same bounded, cancel-on-timeout behaviour.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde_json::Value as JsonValue;

use crate::app_error::{AppError, AppResult};
use crate::local_db_model::HttpMethod;

/// One HTTP call against an endpoint relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: HttpMethod,
    pub endpoint: String,
    pub body: Option<JsonValue>,
}

impl RemoteRequest {
    pub fn new(method: HttpMethod, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            body: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, endpoint)
    }

    pub fn with_body(mut self, body: Option<JsonValue>) -> Self {
        self.body = body;
        self
    }
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Sends `request` and returns the decoded JSON body (`Null` when empty).
    /// Non-2xx answers are [`AppError::RemoteHttpError`].
    async fn send(&self, request: RemoteRequest) -> AppResult<JsonValue>;
}

/// Supplies the bearer token current at call time. Refreshing it is the
/// provider's business.
pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn access_token(&self) -> Option<String> {
        self()
    }
}

/// Provider for unauthenticated deployments.
pub struct NoAuth;

impl TokenProvider for NoAuth {
    fn access_token(&self) -> Option<String> {
        None
    }
}

pub struct HttpRemote {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpRemote {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        tokens: Arc<dyn TokenProvider>,
    ) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Head => Method::HEAD,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn send(&self, request: RemoteRequest) -> AppResult<JsonValue> {
        let url = self.url(&request.endpoint);
        debug!("{} {}", request.method, url);

        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json");

        if let Some(token) = self.tokens.access_token() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::RemoteHttpError {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(JsonValue::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Sends `request`, cancelling it once `timeout` elapses.
///
/// The in-flight future is dropped on timeout, which aborts the underlying
/// connection, and the call resolves to [`AppError::RequestTimeout`].
pub async fn send_with_timeout(
    remote: &dyn RemoteApi,
    request: RemoteRequest,
    timeout: Duration,
) -> AppResult<JsonValue> {
    match tokio::time::timeout(timeout, remote.send(request)).await {
        Ok(Err(AppError::RequestTimeout(_))) | Err(_) => Err(AppError::RequestTimeout(timeout)),
        Ok(result) => result,
    }
}
