//! Wiring facade: builds the token manager, request executor, and stream
//! client from one `ClientConfig` and a chosen storage backend.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ApiError, classify_status};
use crate::notify::Notifier;
use crate::request::{
    HttpRequest, HttpTransport, Method, ReqwestTransport, RequestExecutor,
};
use crate::storage::TokenStore;
use crate::stream::{HttpStreamTransport, StreamClient, StreamHandle, StreamSink};
use crate::token::{SystemClock, TokenEndpointBody, TokenManager, TokenTransport};

/// Fetches the anti-forgery token from `GET <base>/api/csrf-token`. The
/// token endpoint is a safe method, so this path never needs a token itself.
pub struct HttpTokenTransport {
    transport: Arc<dyn HttpTransport>,
    url: String,
    timeout: std::time::Duration,
}

impl HttpTokenTransport {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        url: String,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            transport,
            url,
            timeout,
        }
    }
}

#[async_trait]
impl TokenTransport for HttpTokenTransport {
    async fn fetch_token(&self) -> Result<String, ApiError> {
        let response = self
            .transport
            .send(HttpRequest {
                method: Method::Get,
                url: self.url.clone(),
                headers: vec![(
                    "x-request-id".to_string(),
                    format!("req_{}", Uuid::new_v4().simple()),
                )],
                body: None,
                timeout: self.timeout,
            })
            .await
            .map_err(|error| ApiError::Network {
                message: error.message,
            })?;

        if !(200..300).contains(&response.status) {
            return Err(classify_status(response.status, &response.body));
        }

        let body: TokenEndpointBody =
            serde_json::from_slice(&response.body).map_err(|error| ApiError::Decode {
                message: format!("token endpoint returned malformed body: {error}"),
            })?;
        body.csrf_token.ok_or_else(|| ApiError::Decode {
            message: "token endpoint response missing csrf_token".to_string(),
        })
    }
}

pub struct ApiClient {
    config: ClientConfig,
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    executor: RequestExecutor,
    notifier: Arc<dyn Notifier>,
}

impl ApiClient {
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn TokenStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let http = reqwest::Client::new();
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(http.clone()));
        let token_transport = Arc::new(HttpTokenTransport::new(
            transport.clone(),
            format!(
                "{}/{}",
                config.base_url,
                config.token_endpoint.trim_start_matches('/')
            ),
            config.request_timeout,
        ));
        let tokens = TokenManager::new(
            token_transport,
            store,
            Arc::new(SystemClock),
            config.token_ttl_ms,
        );
        let executor = RequestExecutor::new(
            config.clone(),
            tokens.clone(),
            transport,
            notifier.clone(),
        );
        Self {
            config,
            http,
            tokens,
            executor,
            notifier,
        }
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Open a streaming chat turn for a conversation. Each call is a fresh
    /// session; the returned handle owns it.
    pub fn open_chat_stream(
        &self,
        conversation_id: &str,
        body: serde_json::Value,
        sink: Arc<dyn StreamSink>,
    ) -> StreamHandle {
        let url = format!(
            "{}/api/conversations/{conversation_id}/stream",
            self.config.base_url
        );
        let transport = Arc::new(HttpStreamTransport::new(
            self.http.clone(),
            url,
            self.config.token_header.clone(),
            self.tokens.clone(),
        ));
        StreamClient::new(&self.config, transport, self.notifier.clone()).start(body, sink)
    }
}
