//! Anti-forgery token lifecycle.
//!
//! The manager owns the cached token and guarantees that concurrent demand
//! coalesces onto a single in-flight network operation per kind (fetch or
//! refresh). Callers that arrive while an operation is pending attach to the
//! same shared future and observe its one outcome.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Deserialize;

use crate::error::ApiError;
use crate::storage::{StoredToken, TokenStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntiForgeryToken {
    pub value: String,
    /// Absolute expiry, ms since epoch. Usable iff `now < expires_at_ms`.
    pub expires_at_ms: u64,
}

impl AntiForgeryToken {
    pub fn is_usable_at(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Injectable time source so expiry behavior is testable.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Network seam for the token endpoint. The production implementation issues
/// `GET <base>/api/csrf-token` and decodes `{"csrf_token": "..."}`.
#[async_trait]
pub trait TokenTransport: Send + Sync {
    async fn fetch_token(&self) -> Result<String, ApiError>;
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenEndpointBody {
    pub csrf_token: Option<String>,
}

type TokenOutcome = Result<AntiForgeryToken, ApiError>;
type PendingToken = Shared<BoxFuture<'static, TokenOutcome>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationKind {
    Fetch,
    Refresh,
}

#[derive(Default)]
struct TokenSlots {
    cached: Option<AntiForgeryToken>,
    pending_fetch: Option<PendingToken>,
    pending_refresh: Option<PendingToken>,
}

pub struct TokenManager {
    slots: Mutex<TokenSlots>,
    transport: Arc<dyn TokenTransport>,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
}

impl TokenManager {
    pub fn new(
        transport: Arc<dyn TokenTransport>,
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
        ttl_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(TokenSlots::default()),
            transport,
            store,
            clock,
            ttl_ms,
        })
    }

    /// Produce a usable token: memory first, then durable storage, then a
    /// single shared network fetch.
    pub async fn get_token(self: &Arc<Self>) -> TokenOutcome {
        let pending = {
            // Checking the slot and installing a new operation happen under
            // one lock acquisition; an interleaved caller either sees the
            // cache hit or joins the same pending future.
            let mut slots = self.lock_slots();
            let now = self.clock.now_ms();

            if let Some(token) = slots.cached.as_ref() {
                if token.is_usable_at(now) {
                    return Ok(token.clone());
                }
                slots.cached = None;
            }

            if let Some(token) = self.adopt_stored(now) {
                slots.cached = Some(token.clone());
                return Ok(token);
            }

            if let Some(pending) = slots.pending_fetch.clone() {
                pending
            } else {
                let pending = self.start_operation(OperationKind::Fetch);
                slots.pending_fetch = Some(pending.clone());
                pending
            }
        };
        pending.await
    }

    /// Discard the current token everywhere and obtain a fresh one through a
    /// single shared refresh.
    pub async fn refresh_token(self: &Arc<Self>) -> TokenOutcome {
        let pending = {
            let mut slots = self.lock_slots();
            slots.cached = None;
            if let Err(error) = self.store.clear() {
                tracing::warn!(%error, "failed to clear stored token, continuing");
            }

            if let Some(pending) = slots.pending_refresh.clone() {
                pending
            } else {
                let pending = self.start_operation(OperationKind::Refresh);
                slots.pending_refresh = Some(pending.clone());
                pending
            }
        };
        pending.await
    }

    /// Current cached token, if still usable. No I/O.
    pub fn cached_token(&self) -> Option<AntiForgeryToken> {
        let slots = self.lock_slots();
        slots
            .cached
            .as_ref()
            .filter(|token| token.is_usable_at(self.clock.now_ms()))
            .cloned()
    }

    fn start_operation(self: &Arc<Self>, kind: OperationKind) -> PendingToken {
        let manager = Arc::clone(self);
        async move {
            let outcome = match manager.transport.fetch_token().await {
                Ok(value) => {
                    let token = AntiForgeryToken {
                        value,
                        expires_at_ms: manager.clock.now_ms() + manager.ttl_ms,
                    };
                    if let Err(error) = manager.store.persist(&StoredToken {
                        value: token.value.clone(),
                        expires_at_ms: token.expires_at_ms,
                    }) {
                        tracing::warn!(%error, "failed to persist token, continuing memory-only");
                    }
                    Ok(token)
                }
                Err(error) => Err(error),
            };

            // Settle: publish the result and free the slot in the same poll,
            // so no caller can observe a half-done operation.
            let mut slots = manager.lock_slots();
            match kind {
                OperationKind::Fetch => slots.pending_fetch = None,
                OperationKind::Refresh => slots.pending_refresh = None,
            }
            if let Ok(token) = &outcome {
                slots.cached = Some(token.clone());
            }
            outcome
        }
        .boxed()
        .shared()
    }

    /// Load from durable storage; deletes an expired record on sight and
    /// treats every storage error as a cache miss.
    fn adopt_stored(&self, now_ms: u64) -> Option<AntiForgeryToken> {
        let stored = match self.store.load() {
            Ok(stored) => stored?,
            Err(error) => {
                tracing::warn!(%error, "failed to read stored token, treating as cache miss");
                return None;
            }
        };
        let token = AntiForgeryToken {
            value: stored.value,
            expires_at_ms: stored.expires_at_ms,
        };
        if !token.is_usable_at(now_ms) {
            if let Err(error) = self.store.clear() {
                tracing::warn!(%error, "failed to delete expired stored token");
            }
            return None;
        }
        Some(token)
    }

    fn lock_slots(&self) -> MutexGuard<'_, TokenSlots> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
