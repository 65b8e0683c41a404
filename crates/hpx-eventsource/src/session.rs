//! Session state that survives reconnects.

use std::time::Duration;

use url::Url;

/// Default delay before a reconnect attempt, used until the server sends a
/// `retry:` field.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(1000);

/// State carried across every transport connection of one logical session.
///
/// Owned by the connection driver and lent to the parser for each chunk, so
/// `id:` and `retry:` fields take effect before the next event is dispatched
/// and before the next request is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionState {
    pub(crate) last_event_id: String,
    pub(crate) reconnect_interval: Duration,
    pub(crate) pending_redirect: Option<Url>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            last_event_id: String::new(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            pending_redirect: None,
        }
    }
}

impl SessionState {
    /// Create a session with the given initial resume id and retry interval.
    pub fn new(last_event_id: impl Into<String>, reconnect_interval: Duration) -> Self {
        Self {
            last_event_id: last_event_id.into(),
            reconnect_interval,
            pending_redirect: None,
        }
    }

    /// The most recent `id:` value (empty when none was seen).
    pub fn last_event_id(&self) -> &str {
        &self.last_event_id
    }

    /// Delay before the next reconnect attempt.
    pub fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    /// URL to restore on the next disconnect after a temporary redirect.
    pub fn pending_redirect(&self) -> Option<&Url> {
        self.pending_redirect.as_ref()
    }

    /// Remember `current` so it is restored after the redirected connection
    /// drops.
    pub(crate) fn record_temporary_redirect(&mut self, current: Url) {
        self.pending_redirect = Some(current);
    }

    /// Consume the pending redirect, if any.
    pub(crate) fn take_pending_redirect(&mut self) -> Option<Url> {
        self.pending_redirect.take()
    }
}
