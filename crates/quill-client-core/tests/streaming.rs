//! Reconnect, exhaustion, and cancellation behavior of the streaming client.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use quill_client_core::config::ClientConfig;
use quill_client_core::error::ApiError;
use quill_client_core::notify::{Notifier, NotifyLevel};
use quill_client_core::request::TransportError;
use quill_client_core::stream::{
    StreamBody, StreamClient, StreamOpenRequest, StreamSink, StreamState, StreamTransport,
};

#[derive(Debug, Clone, PartialEq)]
enum SinkEvent {
    Fragment(String),
    Reconnecting(u32),
    Complete,
    Error(ApiError),
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().expect("events lock").clone()
    }

    fn fragments(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Fragment(text) => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl StreamSink for RecordingSink {
    fn on_fragment(&self, text: &str) {
        self.events
            .lock()
            .expect("events lock")
            .push(SinkEvent::Fragment(text.to_string()));
    }

    fn on_reconnecting(&self, attempt: u32) {
        self.events
            .lock()
            .expect("events lock")
            .push(SinkEvent::Reconnecting(attempt));
    }

    fn on_complete(&self) {
        self.events
            .lock()
            .expect("events lock")
            .push(SinkEvent::Complete);
    }

    fn on_error(&self, error: ApiError) {
        self.events
            .lock()
            .expect("events lock")
            .push(SinkEvent::Error(error));
    }
}

#[derive(Default)]
struct QuietNotifier;

impl Notifier for QuietNotifier {
    fn notify(&self, _level: NotifyLevel, _message: &str) {}
}

fn fragment(text: &str) -> Vec<u8> {
    format!("event: fragment\ndata: {{\"text\":\"{text}\"}}\n\n").into_bytes()
}

fn done() -> Vec<u8> {
    b"event: done\ndata: {}\n\n".to_vec()
}

fn error_event(code: &str, message: &str) -> Vec<u8> {
    format!("event: error\ndata: {{\"code\":\"{code}\",\"message\":\"{message}\"}}\n\n").into_bytes()
}

/// One scripted connection: the chunks the transport will yield, in order.
/// A connection that ends without a `done` event is a transport loss.
enum Connection {
    Chunks(Vec<Result<Vec<u8>, TransportError>>),
    OpenError(ApiError),
    /// Yields nothing and never ends; used to exercise the stall timeout.
    Silent,
    /// Externally driven through an unbounded channel.
    Manual(futures::channel::mpsc::UnboundedReceiver<Result<Vec<u8>, TransportError>>),
}

#[derive(Default)]
struct ScriptedStreamTransport {
    connections: Mutex<VecDeque<Connection>>,
    opens: Mutex<Vec<StreamOpenRequest>>,
}

impl ScriptedStreamTransport {
    fn with(connections: Vec<Connection>) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(connections.into()),
            opens: Mutex::new(Vec::new()),
        })
    }

    fn opens(&self) -> Vec<StreamOpenRequest> {
        self.opens.lock().expect("opens lock").clone()
    }
}

#[async_trait]
impl StreamTransport for ScriptedStreamTransport {
    async fn open(&self, request: StreamOpenRequest) -> Result<StreamBody, ApiError> {
        self.opens.lock().expect("opens lock").push(request);
        let connection = self
            .connections
            .lock()
            .expect("connections lock")
            .pop_front();
        match connection {
            Some(Connection::Chunks(chunks)) => Ok(futures::stream::iter(chunks).boxed()),
            Some(Connection::OpenError(error)) => Err(error),
            Some(Connection::Silent) => Ok(futures::stream::pending().boxed()),
            Some(Connection::Manual(receiver)) => Ok(receiver.boxed()),
            None => Err(ApiError::Network {
                message: "no scripted connection left".to_string(),
            }),
        }
    }
}

fn test_config(max_retries: u32) -> ClientConfig {
    let mut config = ClientConfig::new("http://host:9000").expect("valid config");
    config.stream_max_retries = max_retries;
    config.stream_base_delay = Duration::from_millis(10);
    config.stream_max_delay = Duration::from_millis(100);
    config.stall_timeout = Duration::from_secs(5);
    config
}

fn lost() -> Result<Vec<u8>, TransportError> {
    Err(TransportError {
        message: "connection reset".to_string(),
    })
}

#[tokio::test(start_paused = true)]
async fn fragments_survive_a_reconnect_without_duplication() {
    let transport = ScriptedStreamTransport::with(vec![
        Connection::Chunks(vec![
            Ok(fragment("he")),
            Ok(fragment("llo")),
            Ok(fragment(" wor")),
            lost(),
        ]),
        Connection::Chunks(vec![Ok(fragment("ld")), Ok(fragment("!")), Ok(done())]),
    ]);
    let sink = Arc::new(RecordingSink::default());
    let client = StreamClient::new(&test_config(3), transport.clone(), Arc::new(QuietNotifier));

    let handle = client.start(serde_json::json!({"content": "hi"}), sink.clone());
    let session_id = handle.session_id();
    handle.join().await;

    assert_eq!(
        sink.events(),
        vec![
            SinkEvent::Fragment("he".to_string()),
            SinkEvent::Fragment("llo".to_string()),
            SinkEvent::Fragment(" wor".to_string()),
            SinkEvent::Reconnecting(1),
            SinkEvent::Fragment("ld".to_string()),
            SinkEvent::Fragment("!".to_string()),
            SinkEvent::Complete,
        ]
    );

    // The reconnect carried the same session and the delivered-fragment
    // watermark, so the upstream resumes rather than replays.
    let opens = transport.opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[0].session_id, session_id);
    assert_eq!(opens[1].session_id, session_id);
    assert_eq!(opens[0].last_event_id, 0);
    assert_eq!(opens[1].last_event_id, 3);
}

#[tokio::test(start_paused = true)]
async fn retry_exhaustion_yields_exactly_one_terminal_error() {
    let transport = ScriptedStreamTransport::with(vec![
        Connection::Chunks(vec![lost()]),
        Connection::Chunks(vec![lost()]),
        Connection::Chunks(vec![lost()]),
    ]);
    let sink = Arc::new(RecordingSink::default());
    let client = StreamClient::new(&test_config(2), transport.clone(), Arc::new(QuietNotifier));

    let handle = client.start(serde_json::json!({"content": "hi"}), sink.clone());
    handle.join().await;

    assert_eq!(
        sink.events(),
        vec![
            SinkEvent::Reconnecting(1),
            SinkEvent::Reconnecting(2),
            SinkEvent::Error(ApiError::StreamExhausted { attempts: 2 }),
        ]
    );
    // maxRetries + 1 connection attempts, then nothing further.
    assert_eq!(transport.opens().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancellation_suppresses_in_flight_fragments() {
    let (sender, receiver) = futures::channel::mpsc::unbounded();
    let transport = ScriptedStreamTransport::with(vec![Connection::Manual(receiver)]);
    let sink = Arc::new(RecordingSink::default());
    let client = StreamClient::new(&test_config(3), transport, Arc::new(QuietNotifier));

    let handle = client.start(serde_json::json!({"content": "hi"}), sink.clone());

    sender.unbounded_send(Ok(fragment("one"))).expect("send");
    sender.unbounded_send(Ok(fragment("two"))).expect("send");
    while sink.fragments().len() < 2 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    handle.cancel();
    assert_eq!(handle.state(), StreamState::Closed);

    // A fragment already on the wire when the caller cancelled.
    sender.unbounded_send(Ok(fragment("three"))).expect("send");
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.join().await;

    assert_eq!(
        sink.events(),
        vec![
            SinkEvent::Fragment("one".to_string()),
            SinkEvent::Fragment("two".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn server_error_event_is_terminal_without_retry() {
    let transport = ScriptedStreamTransport::with(vec![Connection::Chunks(vec![
        Ok(fragment("partial")),
        Ok(error_event("model_unavailable", "inference backend is down")),
    ])]);
    let sink = Arc::new(RecordingSink::default());
    let client = StreamClient::new(&test_config(3), transport.clone(), Arc::new(QuietNotifier));

    let handle = client.start(serde_json::json!({"content": "hi"}), sink.clone());
    handle.join().await;

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], SinkEvent::Fragment("partial".to_string()));
    assert!(matches!(events[1], SinkEvent::Error(ApiError::Server { .. })));
    // Application-level errors never consume the reconnect budget.
    assert_eq!(transport.opens().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn handshake_rejection_is_terminal_without_retry() {
    let transport = ScriptedStreamTransport::with(vec![Connection::OpenError(
        ApiError::AuthRejected {
            message: "not authorized".to_string(),
        },
    )]);
    let sink = Arc::new(RecordingSink::default());
    let client = StreamClient::new(&test_config(3), transport.clone(), Arc::new(QuietNotifier));

    let handle = client.start(serde_json::json!({"content": "hi"}), sink.clone());
    handle.join().await;

    assert_eq!(
        sink.events(),
        vec![SinkEvent::Error(ApiError::AuthRejected {
            message: "not authorized".to_string(),
        })]
    );
    assert_eq!(transport.opens().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_connection_counts_as_transport_loss() {
    let transport = ScriptedStreamTransport::with(vec![
        Connection::Silent,
        Connection::Chunks(vec![Ok(fragment("late")), Ok(done())]),
    ]);
    let sink = Arc::new(RecordingSink::default());
    let client = StreamClient::new(&test_config(3), transport.clone(), Arc::new(QuietNotifier));

    let handle = client.start(serde_json::json!({"content": "hi"}), sink.clone());
    handle.join().await;

    assert_eq!(
        sink.events(),
        vec![
            SinkEvent::Reconnecting(1),
            SinkEvent::Fragment("late".to_string()),
            SinkEvent::Complete,
        ]
    );
    assert_eq!(transport.opens().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn completed_session_ends_in_closed_state() {
    let transport = ScriptedStreamTransport::with(vec![Connection::Chunks(vec![
        Ok(fragment("all")),
        Ok(done()),
    ])]);
    let sink = Arc::new(RecordingSink::default());
    let client = StreamClient::new(&test_config(3), transport, Arc::new(QuietNotifier));

    let handle = client.start(serde_json::json!({"content": "hi"}), sink.clone());
    // Wait for the terminal callback, then check the absorbing state.
    while !sink
        .events()
        .iter()
        .any(|event| *event == SinkEvent::Complete)
    {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(handle.state(), StreamState::Closed);
    handle.join().await;
}
