//! Resilient API client core for Quill.
//!
//! Three layers, each injectable and independently testable:
//!
//! - [`token::TokenManager`] — anti-forgery token lifecycle with
//!   single-flight fetch/refresh under concurrent demand, backed by a
//!   durable [`storage::TokenStore`] that degrades gracefully.
//! - [`request::RequestExecutor`] — authenticated request execution with
//!   URL normalization, outcome classification, and at-most-one transparent
//!   refresh-and-retry on credential rejection.
//! - [`stream::StreamClient`] — long-lived chat turn streaming with bounded
//!   reconnect/backoff, strict fragment ordering, and immediate
//!   cancellation.
//!
//! [`client::ApiClient`] wires the three together for production use.

pub mod client;
pub mod config;
pub mod error;
pub mod notify;
pub mod request;
pub mod sse;
pub mod storage;
pub mod stream;
pub mod token;

pub use client::ApiClient;
pub use config::{ClientConfig, ConfigError};
pub use error::{ApiError, CSRF_REJECTED_CODE};
pub use notify::{Notifier, NotifyLevel, TracingNotifier};
pub use request::{ApiResponse, Method, RequestDescriptor, RequestExecutor};
pub use storage::{FileTokenStore, MemoryTokenStore, StoredToken, TokenStore};
pub use stream::{StreamHandle, StreamSink, StreamState};
pub use token::{AntiForgeryToken, TokenManager};
