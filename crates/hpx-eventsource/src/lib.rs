//! # hpx-eventsource
//!
//! Server-Sent Events client with automatic reconnection.
//!
//! This crate connects to a `text/event-stream` endpoint, parses the stream
//! incrementally and delivers typed events to listeners and streams. The
//! session survives disconnects: it reconnects after the server-advertised
//! `retry:` interval, resumes with `Last-Event-ID` and follows redirects.
//!
//! ## Features
//!
//! - **Incremental parser**: chunk-boundary independent, LF / CR / CRLF line
//!   endings, BOM stripping
//! - **Lifecycle**: `Connecting` / `Open` / `Closed` with the status-code
//!   reconnect policy
//! - **Transport seam**: hyper + rustls by default, or any [`Transport`]
//! - **TLS options**: client identity, trust anchors, cipher and protocol
//!   pinning, custom identity checks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures_util::StreamExt;
//! use hpx_eventsource::{EventSource, EventSourceConfig, SseEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EventSourceConfig::new("https://stream.example.com/events")
//!         .reconnect_interval(std::time::Duration::from_secs(2));
//!
//!     let source = EventSource::new(config)?;
//!     let mut events = source.stream();
//!     source.start();
//!
//!     while let Some(event) = events.next().await {
//!         if let SseEvent::Message(message) = event {
//!             println!("{}: {}", message.event_type(), message.data());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod parse;
pub mod request;
pub mod session;
pub mod tls;
pub mod transport;

// Re-export commonly used types
pub use config::EventSourceConfig;
pub use connection::{EventSource, ReadyState, SseHandle, SseStream};
pub use dispatch::{Dispatcher, ErrorEvent, Listener, ListenerId, SseEvent};
pub use error::{TransportError, TransportResult};
pub use parse::{EventParser, EventStream, MESSAGE_TYPE, StreamEvent};
pub use session::{DEFAULT_RECONNECT_INTERVAL, SessionState};
pub use tls::{IdentityCheck, TlsOptions, TlsVersion};
pub use transport::{BodyStream, HyperTransport, SseRequest, SseResponse, Transport};
