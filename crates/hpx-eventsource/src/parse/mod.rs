//! `text/event-stream` parsing.
//!
//! Line splitting, field dispatch and event assembly follow the
//! [HTML Living Standard](https://html.spec.whatwg.org/multipage/server-sent-events.html).
//! [`EventParser`] is the step function the connection driver feeds; it holds
//! only per-connection state and writes `id:` / `retry:` into the
//! [`SessionState`](crate::SessionState) passed to it. [`EventStream`] wraps
//! the same parser around any byte stream.

pub(crate) mod constants;
pub mod event;
pub mod event_stream;
pub mod parser;

pub use constants::MESSAGE_TYPE;
pub use event::StreamEvent;
pub use event_stream::EventStream;
pub use parser::EventParser;
