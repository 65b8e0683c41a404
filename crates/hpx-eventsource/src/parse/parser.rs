//! Incremental `text/event-stream` parser.
//!
//! [`EventParser`] is a step function over byte chunks: it keeps the trailing
//! partial line between calls and never decodes a line until its terminator
//! has been seen, so the emitted events do not depend on how the transport
//! split the body.

use std::{borrow::Cow, time::Duration};

use bytes::{Buf, BytesMut};

use super::{
    constants::{BOM, COLON, CR, LF, MESSAGE_TYPE},
    event::StreamEvent,
};
use crate::session::SessionState;

/// Recognised field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldName {
    Event,
    Data,
    Id,
    Retry,
    Ignored,
}

impl FieldName {
    fn from_bytes(name: &[u8]) -> Self {
        match name {
            b"event" => Self::Event,
            b"data" => Self::Data,
            b"id" => Self::Id,
            b"retry" => Self::Retry,
            _ => Self::Ignored,
        }
    }
}

/// Splits a complete line into field name and value.
///
/// `colon` is the offset of the first `:` in the line, if any. A line with no
/// colon is a field name with an empty value; a single space after the colon
/// is not part of the value.
fn split_field(line: &[u8], colon: Option<usize>) -> (&[u8], &[u8]) {
    match colon {
        Some(pos) => {
            let value = &line[pos + 1..];
            let value = match value {
                [b' ', rest @ ..] => rest,
                _ => value,
            };
            (&line[..pos], value)
        }
        None => (line, &[]),
    }
}

/// `Some(true)` when `buf` opens with a BOM, `Some(false)` when it cannot,
/// `None` while too few bytes have arrived to tell.
const fn starts_with_bom(buf: &[u8]) -> Option<bool> {
    match buf.len() {
        0 => None,
        1 => {
            if buf[0] == BOM[0] {
                None
            } else {
                Some(false)
            }
        }
        2 => {
            if buf[0] == BOM[0] && buf[1] == BOM[1] {
                None
            } else {
                Some(false)
            }
        }
        _gte_3 => {
            if buf[0] == BOM[0] && buf[1] == BOM[1] && buf[2] == BOM[2] {
                Some(true)
            } else {
                Some(false)
            }
        }
    }
}

/// Parses a `retry:` value. Only a non-empty run of ASCII digits counts.
fn parse_retry(value: &[u8]) -> Option<Duration> {
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(value)
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_millis)
}

/// Per-connection parse state.
///
/// Create a fresh parser for every transport connection; session-scoped
/// values (`Last-Event-ID`, retry interval) live in [`SessionState`] and are
/// passed in on each [`feed`](EventParser::feed).
#[derive(Debug)]
pub struct EventParser {
    /// Bytes of the current, not yet terminated line.
    buffer: BytesMut,
    /// How much of `buffer` has already been scanned for a line boundary.
    scanned: usize,
    /// Offset of the first colon in the partial line, once found.
    colon: Option<usize>,
    /// The previous line ended in CR; drop one LF if it comes next.
    discard_lf: bool,
    bom_pending: bool,
    data: String,
    event_type: Option<String>,
}

impl Default for EventParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EventParser {
    /// Create a parser for a new connection.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            colon: None,
            discard_lf: false,
            bom_pending: true,
            data: String::new(),
            event_type: None,
        }
    }

    /// Consume a chunk and return every event completed by it, in order.
    ///
    /// `id:` and `retry:` fields update `session` immediately. `origin` is
    /// stamped onto each emitted event.
    pub fn feed(
        &mut self,
        chunk: &[u8],
        session: &mut SessionState,
        origin: &str,
    ) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if chunk.is_empty() {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        if self.bom_pending {
            match starts_with_bom(&self.buffer) {
                Some(true) => {
                    self.buffer.advance(BOM.len());
                    self.bom_pending = false;
                }
                Some(false) => self.bom_pending = false,
                None => return events,
            }
        }

        loop {
            if self.discard_lf {
                match self.buffer.first() {
                    None => break,
                    Some(&LF) => self.buffer.advance(1),
                    Some(_) => {}
                }
                self.discard_lf = false;
            }

            let unscanned = &self.buffer[self.scanned..];
            let Some(offset) = memchr::memchr2(CR, LF, unscanned) else {
                if self.colon.is_none() {
                    self.colon = memchr::memchr(COLON, unscanned).map(|pos| pos + self.scanned);
                }
                self.scanned = self.buffer.len();
                break;
            };

            let eol = self.scanned + offset;
            if self.colon.is_none() {
                self.colon = memchr::memchr(COLON, &self.buffer[self.scanned..eol])
                    .map(|pos| pos + self.scanned);
            }
            self.discard_lf = self.buffer[eol] == CR;

            let line = self.buffer.split_to(eol + 1);
            let colon = self.colon.take();
            self.scanned = 0;

            if let Some(event) = self.process_line(&line[..eol], colon, session, origin) {
                events.push(event);
            }
        }

        events
    }

    /// Apply one complete line (without its terminator).
    fn process_line(
        &mut self,
        line: &[u8],
        colon: Option<usize>,
        session: &mut SessionState,
        origin: &str,
    ) -> Option<StreamEvent> {
        if line.is_empty() {
            return self.dispatch(session, origin);
        }

        let (name, value) = split_field(line, colon);
        match FieldName::from_bytes(name) {
            FieldName::Data => {
                self.data.push_str(&decode(value));
                self.data.push('\n');
            }
            FieldName::Event => self.event_type = Some(decode(value).into_owned()),
            FieldName::Id => session.last_event_id = decode(value).into_owned(),
            FieldName::Retry => {
                if let Some(interval) = parse_retry(value) {
                    session.reconnect_interval = interval;
                }
            }
            // Comments (empty field name) and unknown fields.
            FieldName::Ignored => {}
        }
        None
    }

    /// Blank line: emit the pending block if it carried data.
    fn dispatch(&mut self, session: &SessionState, origin: &str) -> Option<StreamEvent> {
        let event_type = self.event_type.take();
        if self.data.is_empty() {
            return None;
        }

        let mut data = std::mem::take(&mut self.data);
        data.pop();

        Some(StreamEvent {
            event_type: event_type.unwrap_or_else(|| MESSAGE_TYPE.to_string()),
            data,
            last_event_id: session.last_event_id.clone(),
            origin: origin.to_string(),
        })
    }

    /// Bytes held back because their line is not terminated yet.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

fn decode(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}
