//! Event types and the listener registry.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use http::StatusCode;
use parking_lot::RwLock;

use crate::parse::StreamEvent;

/// Type name of the event emitted when a connection opens.
pub const OPEN_TYPE: &str = "open";
/// Type name of the event emitted on failures.
pub const ERROR_TYPE: &str = "error";

/// Payload of an `error` event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorEvent {
    /// HTTP status, when the failure came from a response.
    pub status: Option<StatusCode>,
    /// Human-readable description.
    pub message: String,
}

impl ErrorEvent {
    /// Error from a transport failure or a dropped stream.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// Error from an HTTP response status.
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

/// Everything a subscriber can observe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseEvent {
    /// A connection was established (status 200).
    Open,
    /// A protocol or transport failure.
    Error(ErrorEvent),
    /// A message-class event; its type is `"message"` or a server-supplied
    /// name.
    Message(StreamEvent),
}

impl SseEvent {
    /// The type name listeners are registered under.
    pub fn event_type(&self) -> &str {
        match self {
            Self::Open => OPEN_TYPE,
            Self::Error(_) => ERROR_TYPE,
            Self::Message(event) => &event.event_type,
        }
    }

    /// Returns the message payload, if this is a message event.
    pub fn as_message(&self) -> Option<&StreamEvent> {
        match self {
            Self::Message(event) => Some(event),
            _ => None,
        }
    }

    /// Returns the error payload, if this is an error event.
    pub fn as_error(&self) -> Option<&ErrorEvent> {
        match self {
            Self::Error(event) => Some(event),
            _ => None,
        }
    }
}

/// A subscriber callback.
pub type Listener = Arc<dyn Fn(&SseEvent) + Send + Sync>;

/// Identifies one registration so it can be removed later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Per-type ordered listener registry.
///
/// Listeners run on the connection driver's task, one at a time, in
/// registration order. The registry lock is not held while a listener runs,
/// so listeners may register, remove or close from inside a callback.
#[derive(Default)]
pub struct Dispatcher {
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        let counts: HashMap<&str, usize> = listeners
            .iter()
            .map(|(event_type, list)| (event_type.as_str(), list.len()))
            .collect();
        f.debug_struct("Dispatcher")
            .field("listeners", &counts)
            .finish()
    }
}

impl Dispatcher {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `event_type`, after any existing ones.
    pub fn add_listener(&self, event_type: impl Into<String>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(event_type.into())
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove one registration. Returns `false` if it was not registered.
    pub fn remove_listener(&self, event_type: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(list) = listeners.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(event_type);
        }
        removed
    }

    /// Remove every listener for `event_type`.
    pub fn remove_all(&self, event_type: &str) {
        self.listeners.write().remove(event_type);
    }

    /// The first listener registered for `event_type`.
    pub fn first(&self, event_type: &str) -> Option<Listener> {
        self.listeners
            .read()
            .get(event_type)
            .and_then(|list| list.first())
            .map(|(_, listener)| Arc::clone(listener))
    }

    /// Replace every listener for `event_type` with `listener` (or none).
    pub fn replace(&self, event_type: &str, listener: Option<Listener>) -> Option<ListenerId> {
        self.remove_all(event_type);
        listener.map(|listener| self.add_listener(event_type, listener))
    }

    /// Remove every listener of every type.
    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    /// Number of listeners registered for `event_type`.
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.listeners.read().get(event_type).map_or(0, Vec::len)
    }

    /// Deliver `event` to the listeners of its type.
    ///
    /// # Panics
    ///
    /// Panics if the event has an empty type name. That can only happen for a
    /// hand-built [`SseEvent::Message`] and is a caller bug.
    pub fn dispatch(&self, event: &SseEvent) {
        let event_type = event.event_type();
        assert!(
            !event_type.is_empty(),
            "cannot dispatch an event without a type"
        );

        let snapshot: Vec<Listener> = match self.listeners.read().get(event_type) {
            Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in snapshot {
            listener(event);
        }
    }
}
