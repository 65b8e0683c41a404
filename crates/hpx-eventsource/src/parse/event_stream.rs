//! [`Stream`] that converts a stream of
//! [`Bytes`](bytes::Bytes) chunks into [`StreamEvent`]s.

use core::{
    pin::Pin,
    task::{Context, Poll, ready},
    time::Duration,
};
use std::collections::VecDeque;

use futures_core::Stream;

use super::{event::StreamEvent, parser::EventParser};
use crate::session::SessionState;

pin_project_lite::pin_project! {
    /// A [`Stream`] that parses a body of byte chunks into [`StreamEvent`]s.
    ///
    /// Useful when the body comes from somewhere other than
    /// [`EventSource`](crate::EventSource), e.g. a response already obtained
    /// from another HTTP client. There is no reconnection here: the stream
    /// ends when the body ends, and transport errors are passed through.
    #[project = EventStreamProjection]
    #[derive(Debug)]
    pub struct EventStream<S> {
        #[pin]
        stream: S,
        parser: EventParser,
        session: SessionState,
        origin: String,
        ready: VecDeque<StreamEvent>,
        terminated: bool,
    }
}

impl<S> EventStream<S> {
    /// Create a new [`EventStream`] from an underlying byte stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            parser: EventParser::new(),
            session: SessionState::default(),
            origin: String::new(),
            ready: VecDeque::new(),
            terminated: false,
        }
    }

    /// Set the origin stamped onto emitted events.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Set the last event ID (useful for resumability).
    pub fn set_last_event_id(&mut self, id: impl Into<String>) {
        self.session.last_event_id = id.into();
    }

    /// The last `id:` value seen so far.
    pub fn last_event_id(&self) -> &str {
        self.session.last_event_id()
    }

    /// The reconnect interval, as last advertised by a `retry:` field.
    pub fn reconnect_interval(&self) -> Duration {
        self.session.reconnect_interval()
    }

    /// Consume the adapter and return the accumulated session state.
    pub fn into_session(self) -> SessionState {
        self.session
    }
}

impl<S, E, B> Stream for EventStream<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    type Item = Result<StreamEvent, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if *this.terminated {
                return Poll::Ready(None);
            }

            match ready!(this.stream.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => {
                    let events = this
                        .parser
                        .feed(chunk.as_ref(), this.session, this.origin.as_str());
                    this.ready.extend(events);
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                None => *this.terminated = true,
            }
        }
    }
}
