//! Message events produced by the parser.

/// A complete message-class event, emitted when a blank line terminates a
/// block that carried at least one `data:` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    /// Event type: the last `event:` value of the block, or `"message"`.
    pub event_type: String,
    /// All `data:` values of the block joined by `\n`.
    pub data: String,
    /// Session `Last-Event-ID` at the time the event was dispatched.
    pub last_event_id: String,
    /// Scheme, host and port of the URL the event arrived from.
    pub origin: String,
}

impl StreamEvent {
    /// Event type field.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Data payload.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Last event ID.
    pub fn last_event_id(&self) -> &str {
        &self.last_event_id
    }

    /// Origin of the stream.
    pub fn origin(&self) -> &str {
        &self.origin
    }
}
