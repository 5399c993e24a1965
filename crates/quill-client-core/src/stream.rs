//! Long-lived token-stream client for one chat turn.
//!
//! Delivers an ordered sequence of fragments to a caller-supplied sink,
//! reconnecting across transient transport loss without duplicating or
//! reordering fragments, and terminating with exactly one completion or
//! error callback. Cancellation is immediate: once a session leaves the
//! active states, late transport callbacks are discarded at the sink gate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ApiError, classify_status};
use crate::notify::{Notifier, NotifyLevel};
use crate::request::TransportError;
use crate::sse::{EVENT_DONE, EVENT_ERROR, EVENT_FRAGMENT, SseParser};
use crate::token::TokenManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Idle = 0,
    Connecting = 1,
    Streaming = 2,
    Reconnecting = 3,
    Failed = 4,
    Closed = 5,
}

impl StreamState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Streaming,
            3 => Self::Reconnecting,
            4 => Self::Failed,
            5 => Self::Closed,
            _ => Self::Idle,
        }
    }

    /// Terminal states are absorbing: a session never leaves them.
    fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(initial: StreamState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    fn get(&self) -> StreamState {
        StreamState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move to `next` unless already terminal.
    fn transition(&self, next: StreamState) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                if StreamState::from_u8(raw).is_terminal() {
                    None
                } else {
                    Some(next as u8)
                }
            });
    }
}

/// Caller-supplied event sink. For one session the callback sequence is:
/// zero or more `on_fragment` (in transport order), zero or more
/// `on_reconnecting` (informational), then exactly one of `on_complete` /
/// `on_error` — unless the session is cancelled first, after which nothing
/// further is delivered.
pub trait StreamSink: Send + Sync {
    fn on_fragment(&self, text: &str);
    fn on_reconnecting(&self, attempt: u32);
    fn on_complete(&self);
    fn on_error(&self, error: ApiError);
}

/// One attempt to open (or re-open) the stream for a session.
#[derive(Debug, Clone)]
pub struct StreamOpenRequest {
    pub session_id: Uuid,
    /// Fragments already delivered to the sink; sent so the upstream resumes
    /// the turn instead of replaying it.
    pub last_event_id: u64,
    pub body: serde_json::Value,
}

pub type StreamBody = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Network seam for the streaming connection. `open` errors decide the retry
/// path: `ApiError::Network` counts as transport loss (retryable), anything
/// else is terminal for the session.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, request: StreamOpenRequest) -> Result<StreamBody, ApiError>;
}

/// Production transport: POST the turn to the conversation's stream endpoint
/// with the anti-forgery token attached, then read the chunked event body.
pub struct HttpStreamTransport {
    client: reqwest::Client,
    url: String,
    token_header: String,
    tokens: Arc<TokenManager>,
}

impl HttpStreamTransport {
    pub fn new(
        client: reqwest::Client,
        url: String,
        token_header: String,
        tokens: Arc<TokenManager>,
    ) -> Self {
        Self {
            client,
            url,
            token_header,
            tokens,
        }
    }
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn open(&self, request: StreamOpenRequest) -> Result<StreamBody, ApiError> {
        let token = self.tokens.get_token().await?;
        let response = self
            .client
            .post(&self.url)
            .header(&self.token_header, token.value)
            .header("accept", "text/event-stream")
            .header("x-session-id", request.session_id.to_string())
            .header("last-event-id", request.last_event_id.to_string())
            .json(&request.body)
            .send()
            .await
            .map_err(|error| ApiError::Network {
                message: error.to_string(),
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.bytes().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        Ok(response
            .bytes_stream()
            .map(|item| {
                item.map(|bytes| bytes.to_vec()).map_err(|error| TransportError {
                    message: error.to_string(),
                })
            })
            .boxed())
    }
}

#[derive(Debug, Deserialize)]
struct FragmentPayload {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Discards sink callbacks once the session has delivered a terminal event
/// or been cancelled. The swap on the terminal paths guarantees at most one
/// terminal callback even if a stray late transport callback races in.
struct SinkGate {
    sink: Arc<dyn StreamSink>,
    open: AtomicBool,
}

impl SinkGate {
    fn new(sink: Arc<dyn StreamSink>) -> Self {
        Self {
            sink,
            open: AtomicBool::new(true),
        }
    }

    fn fragment(&self, text: &str) {
        if self.open.load(Ordering::SeqCst) {
            self.sink.on_fragment(text);
        }
    }

    fn reconnecting(&self, attempt: u32) {
        if self.open.load(Ordering::SeqCst) {
            self.sink.on_reconnecting(attempt);
        }
    }

    fn complete(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.sink.on_complete();
        }
    }

    fn error(&self, error: ApiError) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.sink.on_error(error);
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    stall_timeout: Duration,
}

pub struct StreamClient {
    transport: Arc<dyn StreamTransport>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
}

impl StreamClient {
    pub fn new(
        config: &ClientConfig,
        transport: Arc<dyn StreamTransport>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            transport,
            notifier,
            policy: RetryPolicy {
                max_retries: config.stream_max_retries,
                base_delay: config.stream_base_delay,
                max_delay: config.stream_max_delay,
                stall_timeout: config.stall_timeout,
            },
        }
    }

    /// Start a fresh session for one chat turn. Every turn gets a new
    /// session id; a finished session is never restarted.
    pub fn start(&self, body: serde_json::Value, sink: Arc<dyn StreamSink>) -> StreamHandle {
        let session_id = Uuid::new_v4();
        let state = Arc::new(StateCell::new(StreamState::Connecting));
        let gate = Arc::new(SinkGate::new(sink));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let task = tokio::spawn(run_session(
            self.transport.clone(),
            self.notifier.clone(),
            self.policy.clone(),
            body,
            session_id,
            state.clone(),
            gate.clone(),
            cancel_rx,
        ));

        StreamHandle {
            session_id,
            state,
            gate,
            cancel_tx,
            task: Some(task),
        }
    }
}

/// Owner handle for an in-flight session. Dropping the handle cancels the
/// session.
pub struct StreamHandle {
    session_id: Uuid,
    state: Arc<StateCell>,
    gate: Arc<SinkGate>,
    cancel_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    /// Unconditional, immediate teardown: the sink receives nothing after
    /// this returns, including fragments already in flight.
    pub fn cancel(&self) {
        self.gate.close();
        self.state.transition(StreamState::Closed);
        let _ = self.cancel_tx.send(true);
    }

    /// Wait for the session task to finish (after completion, terminal
    /// error, or cancellation).
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel();
        }
    }
}

enum ConnectionOutcome {
    Completed,
    Terminal(ApiError),
    Lost(String),
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    transport: Arc<dyn StreamTransport>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
    body: serde_json::Value,
    session_id: Uuid,
    state: Arc<StateCell>,
    gate: Arc<SinkGate>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut retry_count: u32 = 0;
    let mut delivered: u64 = 0;

    loop {
        let outcome = run_connection(
            transport.as_ref(),
            &gate,
            &state,
            &policy,
            session_id,
            &mut delivered,
            &body,
            &mut cancel_rx,
        )
        .await;

        match outcome {
            ConnectionOutcome::Completed => {
                state.transition(StreamState::Closed);
                gate.complete();
                return;
            }
            ConnectionOutcome::Terminal(error) => {
                state.transition(StreamState::Failed);
                notifier.notify(NotifyLevel::Error, &format!("chat stream failed: {error}"));
                gate.error(error);
                return;
            }
            ConnectionOutcome::Cancelled => {
                gate.close();
                state.transition(StreamState::Closed);
                return;
            }
            ConnectionOutcome::Lost(reason) => {
                if retry_count >= policy.max_retries {
                    state.transition(StreamState::Failed);
                    let error = ApiError::StreamExhausted {
                        attempts: retry_count,
                    };
                    notifier.notify(NotifyLevel::Error, &format!("chat stream lost: {error}"));
                    gate.error(error);
                    return;
                }
                retry_count += 1;
                state.transition(StreamState::Reconnecting);
                tracing::debug!(%session_id, retry_count, reason, "stream connection lost, reconnecting");
                notifier.notify(
                    NotifyLevel::Info,
                    &format!("connection lost, reconnecting (attempt {retry_count})"),
                );
                gate.reconnecting(retry_count);

                let delay = backoff_delay(&policy, retry_count);
                tokio::select! {
                    () = cancelled(&mut cancel_rx) => {
                        gate.close();
                        state.transition(StreamState::Closed);
                        return;
                    }
                    () = sleep(delay) => {}
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    transport: &dyn StreamTransport,
    gate: &SinkGate,
    state: &StateCell,
    policy: &RetryPolicy,
    session_id: Uuid,
    delivered: &mut u64,
    body: &serde_json::Value,
    cancel_rx: &mut watch::Receiver<bool>,
) -> ConnectionOutcome {
    let request = StreamOpenRequest {
        session_id,
        last_event_id: *delivered,
        body: body.clone(),
    };

    let opened = tokio::select! {
        () = cancelled(cancel_rx) => return ConnectionOutcome::Cancelled,
        opened = timeout(policy.stall_timeout, transport.open(request)) => opened,
    };
    let mut stream = match opened {
        Err(_elapsed) => return ConnectionOutcome::Lost("handshake stalled".to_string()),
        Ok(Err(ApiError::Network { message })) => return ConnectionOutcome::Lost(message),
        Ok(Err(error)) => return ConnectionOutcome::Terminal(error),
        Ok(Ok(stream)) => stream,
    };

    let mut parser = SseParser::new();
    loop {
        let chunk = tokio::select! {
            () = cancelled(cancel_rx) => return ConnectionOutcome::Cancelled,
            next = timeout(policy.stall_timeout, stream.next()) => match next {
                Err(_elapsed) => return ConnectionOutcome::Lost("stream stalled".to_string()),
                Ok(None) => return ConnectionOutcome::Lost("stream closed before completion".to_string()),
                Ok(Some(Err(error))) => return ConnectionOutcome::Lost(error.message),
                Ok(Some(Ok(chunk))) => chunk,
            },
        };

        for event in parser.push(&chunk) {
            match event.name.as_str() {
                EVENT_FRAGMENT => {
                    let payload: FragmentPayload = match serde_json::from_str(&event.data) {
                        Ok(payload) => payload,
                        Err(error) => {
                            tracing::warn!(%error, data = %event.data, "skipping malformed fragment");
                            continue;
                        }
                    };
                    state.transition(StreamState::Streaming);
                    *delivered += 1;
                    gate.fragment(&payload.text);
                }
                EVENT_DONE => return ConnectionOutcome::Completed,
                EVENT_ERROR => {
                    let payload: ErrorPayload =
                        serde_json::from_str(&event.data).unwrap_or(ErrorPayload {
                            code: None,
                            message: None,
                        });
                    let message = payload
                        .message
                        .unwrap_or_else(|| "upstream reported an error".to_string());
                    tracing::warn!(code = ?payload.code, %message, "stream error event");
                    return ConnectionOutcome::Terminal(ApiError::Server {
                        status: 500,
                        message,
                    });
                }
                other => {
                    tracing::debug!(event = other, "ignoring unknown stream event");
                }
            }
        }
    }
}

/// Resolves when the session has been cancelled, either explicitly or by the
/// handle being dropped.
async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            return;
        }
    }
}

fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let multiplier = 2_u32.saturating_pow(attempt.min(6));
    policy
        .base_delay
        .saturating_mul(multiplier)
        .min(policy.max_delay)
}
