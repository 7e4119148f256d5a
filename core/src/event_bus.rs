// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! Thread-safe publish/subscribe event bus (spec §4.2).
//!
//! Delivery is synchronous: `emit` walks a snapshot of the subscriber
//! registry and returns only once every handler has run. Handlers must
//! not block indefinitely; a handler that panics or would otherwise
//! disrupt emission is isolated by `catch_unwind` so one bad subscriber
//! cannot take down the emitter's task or the remaining subscribers.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use strum::{Display, EnumString};

/// The closed set of event kinds the harness emits.
///
/// Named after `event_emitter.py`'s module-level constants
/// (`EVENT_SERVER_STARTED`, `EVENT_HANDSHAKE_COMPLETED`, ...), with
/// `HandshakeStarted` and `HandshakeCipherSelected` added per spec
/// §4.7's handshake-progress requirement and `ApduCommand`/`ApduResponse`
/// naming the §8 scenario text uses directly.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    ServerStarted,
    ServerStopped,
    SessionStarted,
    SessionEnded,
    HandshakeStarted,
    HandshakeCipherSelected,
    HandshakeCompleted,
    HandshakeFailed,
    ApduCommand,
    ApduResponse,
    PskMismatch,
    ConnectionInterrupted,
    HighErrorRate,
    /// Emitted by the bounded async variant when the oldest-drop policy
    /// discards events; payload carries the drop count.
    QueueOverflow,
}

/// An emitted event: kind, optional owning session, timestamp, and an
/// open map of named fields (cipher suite, close reason, identity, ...).
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: HashMap<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self { kind, session_id: None, timestamp: Utc::now(), payload: HashMap::new() }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

pub type SubscriptionToken = u64;

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

enum Filter {
    All,
    Kinds(Vec<EventKind>),
}

impl Filter {
    fn matches(&self, kind: EventKind) -> bool {
        match self {
            Filter::All => true,
            Filter::Kinds(kinds) => kinds.contains(&kind),
        }
    }
}

#[derive(Clone)]
struct Subscription {
    filter: Arc<Filter>,
    handler: Handler,
}

/// The synchronous, in-process event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

struct Inner {
    next_token: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionToken, Subscription>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_token: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to every event kind.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_filtered(Filter::All, handler)
    }

    /// Subscribe to a specific set of event kinds.
    pub fn subscribe<F>(&self, kinds: &[EventKind], handler: F) -> SubscriptionToken
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_filtered(Filter::Kinds(kinds.to_vec()), handler)
    }

    fn subscribe_filtered<F>(&self, filter: Filter, handler: F) -> SubscriptionToken
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().unwrap().insert(
            token,
            Subscription { filter: Arc::new(filter), handler: Arc::new(handler) },
        );
        token
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.inner.subscribers.lock().unwrap().remove(&token);
    }

    /// Emit an event. Returns once every matching handler has run.
    ///
    /// The subscriber map is cloned out from under the lock before
    /// dispatch so handler execution never holds the registry mutex,
    /// matching the non-blocking-emitter requirement of spec §5.
    pub fn emit(&self, event: Event) {
        let handlers: Vec<Handler> = {
            let guard = self.inner.subscribers.lock().unwrap();
            guard
                .values()
                .filter(|s| s.filter.matches(event.kind))
                .map(|s| s.handler.clone())
                .collect()
        };

        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                log::error!("event subscriber panicked handling {:?}: {:?}", event.kind, panic);
            }
        }
    }
}
