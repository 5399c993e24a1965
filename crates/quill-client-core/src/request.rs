//! Authenticated request execution with at-most-one credential retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ApiError, classify_status, is_credential_rejection};
use crate::notify::{Notifier, NotifyLevel};
use crate::token::TokenManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Safe methods never carry or need the anti-forgery token.
    pub fn requires_token(self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch | Self::Delete)
    }
}

/// Immutable description of one API call.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub endpoint: String,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
}

impl RequestDescriptor {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Transport-level failure: the request never produced an HTTP status.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

/// Network seam for unary requests. The production implementation is
/// [`ReqwestTransport`]; tests script responses through it.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|error| TransportError {
                message: error.to_string(),
            })?;
        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|error| TransportError {
            message: error.to_string(),
        })?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|error| TransportError {
                message: error.to_string(),
            })?
            .to_vec();
        Ok(HttpResponse { status, body })
    }
}

/// Successful (2xx) response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|error| ApiError::Decode {
            message: error.to_string(),
        })
    }
}

enum TokenMode {
    Cached,
    Refreshed,
}

pub struct RequestExecutor {
    config: ClientConfig,
    tokens: Arc<TokenManager>,
    transport: Arc<dyn HttpTransport>,
    notifier: Arc<dyn Notifier>,
}

impl RequestExecutor {
    pub fn new(
        config: ClientConfig,
        tokens: Arc<TokenManager>,
        transport: Arc<dyn HttpTransport>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            tokens,
            transport,
            notifier,
        }
    }

    /// Absolute endpoints pass through verbatim; relative ones join the base
    /// address with exactly one separator, whether or not the caller supplied
    /// a leading slash.
    pub fn build_url(&self, endpoint: &str) -> String {
        let trimmed = endpoint.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return trimmed.to_string();
        }
        format!(
            "{}/{}",
            self.config.base_url,
            trimmed.trim_start_matches('/')
        )
    }

    /// Execute one descriptor: inject the token on mutating methods, dispatch,
    /// classify, and refresh-and-retry exactly once on a credential-specific
    /// 403. Every failure additionally surfaces through the notifier.
    pub async fn execute(&self, descriptor: &RequestDescriptor) -> Result<ApiResponse, ApiError> {
        let result = self.execute_inner(descriptor).await;
        if let Err(error) = &result {
            self.notifier.notify(
                NotifyLevel::Error,
                &format!(
                    "{} {} failed: {error}",
                    descriptor.method.as_str(),
                    descriptor.endpoint
                ),
            );
        }
        result
    }

    async fn execute_inner(&self, descriptor: &RequestDescriptor) -> Result<ApiResponse, ApiError> {
        let url = self.build_url(&descriptor.endpoint);

        let first = self.attempt(descriptor, &url, TokenMode::Cached).await?;
        if descriptor.method.requires_token()
            && is_credential_rejection(first.status, &first.body)
        {
            tracing::debug!(
                endpoint = %descriptor.endpoint,
                "anti-forgery token rejected, refreshing and retrying once"
            );
            let second = self.attempt(descriptor, &url, TokenMode::Refreshed).await?;
            // A second rejection falls through to AuthRejected here.
            return finish(second);
        }
        finish(first)
    }

    async fn attempt(
        &self,
        descriptor: &RequestDescriptor,
        url: &str,
        mode: TokenMode,
    ) -> Result<HttpResponse, ApiError> {
        let mut headers = descriptor.headers.clone();
        headers.push((
            "x-request-id".to_string(),
            format!("req_{}", Uuid::new_v4().simple()),
        ));

        if descriptor.method.requires_token() {
            let token = match mode {
                TokenMode::Cached => self.tokens.get_token().await?,
                TokenMode::Refreshed => self.tokens.refresh_token().await?,
            };
            headers.push((self.config.token_header.clone(), token.value));
        }

        self.transport
            .send(HttpRequest {
                method: descriptor.method,
                url: url.to_string(),
                headers,
                body: descriptor.body.clone(),
                timeout: self.config.request_timeout,
            })
            .await
            .map_err(|error| ApiError::Network {
                message: error.message,
            })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        self.execute(&RequestDescriptor::new(Method::Get, endpoint))
            .await?
            .json()
    }

    pub async fn post_json<Req, Res>(&self, endpoint: &str, payload: &Req) -> Result<Res, ApiError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let body = serde_json::to_value(payload).map_err(|error| ApiError::Decode {
            message: format!("failed to serialize request body: {error}"),
        })?;
        self.execute(&RequestDescriptor::new(Method::Post, endpoint).with_body(body))
            .await?
            .json()
    }

    pub async fn delete(&self, endpoint: &str) -> Result<ApiResponse, ApiError> {
        self.execute(&RequestDescriptor::new(Method::Delete, endpoint))
            .await
    }
}

fn finish(response: HttpResponse) -> Result<ApiResponse, ApiError> {
    if (200..300).contains(&response.status) {
        Ok(ApiResponse {
            status: response.status,
            body: response.body,
        })
    } else {
        Err(classify_status(response.status, &response.body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_token_requirements() {
        assert!(!Method::Get.requires_token());
        assert!(!Method::Head.requires_token());
        assert!(Method::Post.requires_token());
        assert!(Method::Put.requires_token());
        assert!(Method::Patch.requires_token());
        assert!(Method::Delete.requires_token());
    }
}
