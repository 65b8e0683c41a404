//! EventSource Example
//!
//! Connects to an event stream and prints every event until Ctrl-C.
//!
//! Run with: `cargo run -p hpx-eventsource --example eventsource -- <url> [last-event-id]`
//!
//! Set `RUST_LOG=hpx_eventsource=debug` to see connection and parser logs.

use std::time::Duration;

use hpx_eventsource::{EventSource, EventSourceConfig, SseEvent};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let url = args
        .next()
        .unwrap_or_else(|| "http://127.0.0.1:8080/events".to_string());

    let mut config = EventSourceConfig::new(url).reconnect_interval(Duration::from_secs(2));
    if let Some(id) = args.next() {
        config = config.last_event_id(id);
    }

    let source = EventSource::new(config)?;
    let mut events = source.stream();
    source.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.next_event() => match event {
                Some(SseEvent::Open) => println!("[open] {}", source.url()),
                Some(SseEvent::Error(error)) => match error.status {
                    Some(status) => println!("[error] {status} {}", error.message),
                    None => println!("[error] {}", error.message),
                },
                Some(SseEvent::Message(message)) => println!(
                    "[{}] id={:?} {}",
                    message.event_type(),
                    message.last_event_id(),
                    message.data()
                ),
                None => break,
            },
        }
    }

    source.close();
    Ok(())
}
