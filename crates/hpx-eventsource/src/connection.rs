//! EventSource connection driver implementation.
//!
//! Provides [`EventSource`], [`SseHandle`], and [`SseStream`]. A background
//! task owns the session and runs the connect / stream / reconnect loop;
//! the façade only reads the published ready state and URL, and closes.

use std::{
    fmt,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    task::{Context, Poll},
};

use futures_util::{Stream, StreamExt};
use http::{StatusCode, header::LOCATION};
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{mpsc, oneshot},
    task::AbortHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    config::{EventSourceConfig, parse_http_url},
    dispatch::{Dispatcher, ERROR_TYPE, ErrorEvent, Listener, ListenerId, OPEN_TYPE, SseEvent},
    error::{TransportError, TransportResult},
    parse::{EventParser, MESSAGE_TYPE},
    request::{build_request, origin_of},
    session::SessionState,
    transport::{HyperTransport, SseResponse, Transport},
};

// ---------------------------------------------------------------------------
// Ready state
// ---------------------------------------------------------------------------

/// Session lifecycle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReadyState {
    /// Waiting for a response, or for the reconnect delay to pass.
    Connecting = 0,
    /// Receiving events.
    Open = 1,
    /// Finished; no further reconnects.
    Closed = 2,
}

impl ReadyState {
    /// Numeric code: 0 connecting, 1 open, 2 closed.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State visible outside the driver task.
///
/// Only the ready state and a snapshot of the URL are published here; the
/// session itself never leaves the driver.
struct Shared {
    state: AtomicU8,
    url: RwLock<Url>,
    with_credentials: bool,
    dispatcher: Dispatcher,
    taps: Mutex<Vec<mpsc::UnboundedSender<SseEvent>>>,
    task: Mutex<Option<AbortHandle>>,
}

impl Shared {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn is_closed(&self) -> bool {
        self.ready_state() == ReadyState::Closed
    }

    /// Move from `from` to `to`. Fails when the state changed underneath,
    /// in particular after a close.
    fn transition(&self, from: ReadyState, to: ReadyState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn close(&self) -> bool {
        let previous = self.state.swap(ReadyState::Closed.as_u8(), Ordering::SeqCst);
        if previous == ReadyState::Closed.as_u8() {
            return false;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.taps.lock().clear();
        // Listeners may hold handles back to this state.
        self.dispatcher.clear();
        info!(url = %self.url.read(), "EventSource closed");
        true
    }

    /// Register a listener unless the session is already closed.
    fn add_listener(&self, event_type: &str, listener: Listener) -> ListenerId {
        let id = self.dispatcher.add_listener(event_type, listener);
        if self.is_closed() {
            self.dispatcher.remove_listener(event_type, id);
        }
        id
    }

    fn emit(&self, event: &SseEvent) {
        self.dispatcher.dispatch(event);
        self.taps
            .lock()
            .retain(|tap| tap.send(event.clone()).is_ok());
    }
}

// ---------------------------------------------------------------------------
// Public API: EventSource
// ---------------------------------------------------------------------------

/// A Server-Sent Events client session.
///
/// Events are delivered to listeners registered per type (`"open"`,
/// `"error"`, `"message"` or any server-supplied name) and to every
/// [`SseStream`]. Listeners run on the driver task, one at a time, in the
/// order events were parsed.
///
/// ```no_run
/// use hpx_eventsource::{EventSource, EventSourceConfig};
///
/// # async fn run() -> hpx_eventsource::TransportResult<()> {
/// let source = EventSource::new(EventSourceConfig::new("http://localhost:8080/events"))?;
/// source.on_message(|event| {
///     if let Some(message) = event.as_message() {
///         println!("{}", message.data());
///     }
/// });
/// source.start();
/// # Ok(())
/// # }
/// ```
///
/// Dropping the `EventSource` closes the session.
pub struct EventSource {
    shared: Arc<Shared>,
    start: Mutex<Option<oneshot::Sender<()>>>,
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("url", &*self.shared.url.read())
            .field("ready_state", &self.shared.ready_state())
            .field("with_credentials", &self.shared.with_credentials)
            .field("dispatcher", &self.shared.dispatcher)
            .finish()
    }
}

impl EventSource {
    /// Create a session and start connecting right away.
    ///
    /// Listeners registered after this call may miss the first `open`
    /// event. Use [`new`](Self::new) and [`start`](Self::start) to register
    /// them first.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails, the default
    /// transport cannot be built or there is no current runtime.
    pub fn connect(config: EventSourceConfig) -> TransportResult<Self> {
        let source = Self::new(config)?;
        source.start();
        Ok(source)
    }

    /// Create a session in the `Connecting` state without sending anything
    /// until [`start`](Self::start) is called.
    ///
    /// The driver task is spawned on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails, the default
    /// transport cannot be built or there is no current runtime.
    pub fn new(config: EventSourceConfig) -> TransportResult<Self> {
        config.validate().map_err(TransportError::config)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::config(format!("No tokio runtime: {e}")))?;

        let url = parse_http_url(&config.url, "URL").map_err(TransportError::config)?;
        let proxy = config
            .proxy
            .as_deref()
            .map(|raw| parse_http_url(raw, "Proxy URL"))
            .transpose()
            .map_err(TransportError::config)?;
        let transport: Arc<dyn Transport> = match &config.transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(HyperTransport::new(&config.tls, config.reject_unauthorized)?),
        };

        let shared = Arc::new(Shared {
            state: AtomicU8::new(ReadyState::Connecting.as_u8()),
            url: RwLock::new(url.clone()),
            with_credentials: config.with_credentials,
            dispatcher: Dispatcher::new(),
            taps: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        });

        let session = SessionState::new(config.last_event_id.clone(), config.reconnect_interval);
        let driver = Driver {
            shared: Arc::clone(&shared),
            config,
            transport,
            proxy,
            url,
            session,
        };

        let (start_tx, start_rx) = oneshot::channel();
        let task = runtime.spawn(async move {
            if start_rx.await.is_ok() {
                driver.run().await;
            }
        });
        *shared.task.lock() = Some(task.abort_handle());

        Ok(Self {
            shared,
            start: Mutex::new(Some(start_tx)),
        })
    }

    /// Let the driver send its first request. Later calls do nothing.
    pub fn start(&self) {
        if let Some(start) = self.start.lock().take() {
            let _ = start.send(());
        }
    }

    /// Current lifecycle phase.
    pub fn ready_state(&self) -> ReadyState {
        self.shared.ready_state()
    }

    /// The URL currently being connected to. Changes after redirects.
    pub fn url(&self) -> Url {
        self.shared.url.read().clone()
    }

    /// The configured credentials flag.
    pub fn with_credentials(&self) -> bool {
        self.shared.with_credentials
    }

    /// Close the session.
    ///
    /// The state is `Closed` when this returns, any in-flight request or
    /// pending reconnect is abandoned, and every [`SseStream`] ends. Closing
    /// twice is a no-op.
    pub fn close(&self) {
        self.shared.close();
    }

    /// A clone-able handle for observing and closing the session from
    /// elsewhere.
    pub fn handle(&self) -> SseHandle {
        SseHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// A stream of every event dispatched from now on. Ends when the session
    /// closes.
    pub fn stream(&self) -> SseStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.shared.is_closed() {
            self.shared.taps.lock().push(tx);
        }
        SseStream { rx }
    }

    /// Register a listener for `event_type`.
    pub fn add_event_listener<F>(&self, event_type: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&SseEvent) + Send + Sync + 'static,
    {
        let event_type: String = event_type.into();
        self.shared.add_listener(&event_type, Arc::new(listener))
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_event_listener(&self, event_type: &str, id: ListenerId) -> bool {
        self.shared.dispatcher.remove_listener(event_type, id)
    }

    /// The first listener registered for `event_type`.
    pub fn on(&self, event_type: &str) -> Option<Listener> {
        self.shared.dispatcher.first(event_type)
    }

    /// Replace every listener for `event_type` with `listener`, or remove
    /// them all with `None`.
    pub fn set_on(&self, event_type: &str, listener: Option<Listener>) -> Option<ListenerId> {
        self.shared.dispatcher.remove_all(event_type);
        listener.map(|listener| self.shared.add_listener(event_type, listener))
    }

    /// Set the single `open` listener.
    pub fn on_open<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SseEvent) + Send + Sync + 'static,
    {
        self.set_slot(OPEN_TYPE, Arc::new(listener))
    }

    /// Set the single `error` listener.
    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SseEvent) + Send + Sync + 'static,
    {
        self.set_slot(ERROR_TYPE, Arc::new(listener))
    }

    /// Set the single `message` listener.
    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SseEvent) + Send + Sync + 'static,
    {
        self.set_slot(MESSAGE_TYPE, Arc::new(listener))
    }

    fn set_slot(&self, event_type: &str, listener: Listener) -> ListenerId {
        self.shared.dispatcher.remove_all(event_type);
        self.shared.add_listener(event_type, listener)
    }

    /// Deliver `event` to listeners and streams as if it came from the
    /// server.
    ///
    /// # Panics
    ///
    /// Panics if `event` has an empty type name.
    pub fn dispatch(&self, event: &SseEvent) {
        self.shared.emit(event);
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.shared.close();
    }
}

// ---------------------------------------------------------------------------
// SseHandle
// ---------------------------------------------------------------------------

/// Clone-able handle for observing and closing a running session.
#[derive(Clone)]
pub struct SseHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for SseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseHandle")
            .field("ready_state", &self.shared.ready_state())
            .finish_non_exhaustive()
    }
}

impl SseHandle {
    /// Current lifecycle phase.
    pub fn ready_state(&self) -> ReadyState {
        self.shared.ready_state()
    }

    /// The URL currently being connected to.
    pub fn url(&self) -> Url {
        self.shared.url.read().clone()
    }

    /// Close the session. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Returns `true` once the session is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

// ---------------------------------------------------------------------------
// SseStream
// ---------------------------------------------------------------------------

/// Stream of [`SseEvent`]s from an [`EventSource`].
///
/// Implements [`Stream`] for use with `StreamExt` combinators.
#[derive(Debug)]
pub struct SseStream {
    rx: mpsc::UnboundedReceiver<SseEvent>,
}

impl SseStream {
    /// Receive the next event, waiting until one is available.
    pub async fn next_event(&mut self) -> Option<SseEvent> {
        self.rx.recv().await
    }
}

impl Stream for SseStream {
    type Item = SseEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.rx.poll_recv(cx)
    }
}

// ---------------------------------------------------------------------------
// Internal: background driver
// ---------------------------------------------------------------------------

/// What the driver does after one attempt.
#[derive(Debug, PartialEq, Eq)]
enum Next {
    /// Connect again now, to the updated URL.
    Redirect,
    /// Connect again after the reconnect interval.
    Retry,
    /// Terminal failure; close the session.
    Close,
    /// The session was closed from outside (or by a listener).
    Stop,
}

/// Owns the session state. Nothing else mutates `url` or `session`.
struct Driver {
    shared: Arc<Shared>,
    config: EventSourceConfig,
    transport: Arc<dyn Transport>,
    proxy: Option<Url>,
    url: Url,
    session: SessionState,
}

impl Driver {
    async fn run(mut self) {
        loop {
            if self.shared.is_closed() {
                return;
            }
            match self.attempt().await {
                Next::Redirect => {}
                Next::Retry => {
                    if !self.wait_for_retry().await {
                        return;
                    }
                }
                Next::Close => {
                    self.shared.close();
                    return;
                }
                Next::Stop => return,
            }
        }
    }

    /// One connection attempt, through to the end of its body.
    async fn attempt(&mut self) -> Next {
        let request =
            match build_request(&self.config, &self.url, self.proxy.as_ref(), &self.session) {
                Ok(request) => request,
                Err(err) => {
                    error!(url = %self.url, error = %err, "EventSource request could not be built");
                    return self.fail(ErrorEvent::transport(err.to_string()), Next::Close);
                }
            };

        info!(
            url = %self.url,
            last_event_id = self.session.last_event_id(),
            "EventSource connecting"
        );
        let response = match timeout(self.config.connect_timeout, self.transport.open(request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(url = %self.url, error = %err, "EventSource connection failed");
                return self.fail(ErrorEvent::transport(err.to_string()), Next::Retry);
            }
            Err(_) => {
                let err = TransportError::timeout(self.config.connect_timeout);
                warn!(url = %self.url, error = %err, "EventSource connection timed out");
                return self.fail(ErrorEvent::transport(err.to_string()), Next::Retry);
            }
        };

        let status = response.status;
        match status {
            StatusCode::OK => self.stream(response).await,
            StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::TEMPORARY_REDIRECT => self.redirect(&response),
            StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => {
                warn!(url = %self.url, status = %status, "EventSource server error");
                self.fail(ErrorEvent::status(status, response.message()), Next::Retry)
            }
            _ => {
                error!(url = %self.url, status = %status, "EventSource unexpected status; closing");
                self.fail(ErrorEvent::status(status, response.message()), Next::Close)
            }
        }
    }

    /// Deliver an open stream to the parser until it ends.
    async fn stream(&mut self, response: SseResponse) -> Next {
        if !self.shared.transition(ReadyState::Connecting, ReadyState::Open) {
            return Next::Stop;
        }
        info!(url = %self.url, "EventSource open");
        if !self.emit(SseEvent::Open) {
            return Next::Stop;
        }

        let origin = origin_of(&self.url);
        let mut parser = EventParser::new();
        let mut body = response.body;
        let failure = loop {
            match body.next().await {
                Some(Ok(chunk)) => {
                    for event in parser.feed(&chunk, &mut self.session, &origin) {
                        debug!(
                            event_type = event.event_type(),
                            id = event.last_event_id(),
                            "EventSource event received"
                        );
                        if !self.emit(SseEvent::Message(event)) {
                            return Next::Stop;
                        }
                    }
                }
                Some(Err(err)) => break err.to_string(),
                None => break TransportError::stream_ended().to_string(),
            }
        };
        drop(body);

        if !self.shared.transition(ReadyState::Open, ReadyState::Connecting) {
            return Next::Stop;
        }
        warn!(url = %self.url, error = %failure, "EventSource stream interrupted");
        self.fail(ErrorEvent::transport(failure), Next::Retry)
    }

    /// Follow a 301/302/307. A missing or unusable `Location` is terminal.
    fn redirect(&mut self, response: &SseResponse) -> Next {
        let status = response.status;
        let target = response
            .headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|location| self.url.join(location).ok())
            .filter(|url| matches!(url.scheme(), "http" | "https"));

        let Some(target) = target else {
            error!(url = %self.url, status = %status, "EventSource redirect without a usable Location; closing");
            return self.fail(ErrorEvent::status(status, response.message()), Next::Close);
        };

        if status == StatusCode::TEMPORARY_REDIRECT {
            self.session.record_temporary_redirect(self.url.clone());
        }
        debug!(from = %self.url, to = %target, status = %status, "EventSource following redirect");
        self.set_url(target);
        Next::Redirect
    }

    /// Restore a temporary redirect, then sleep the reconnect interval.
    /// Returns `false` if the session closed meanwhile.
    async fn wait_for_retry(&mut self) -> bool {
        if let Some(original) = self.session.take_pending_redirect() {
            debug!(from = %self.url, to = %original, "EventSource reverting temporary redirect");
            self.set_url(original);
        }

        let delay = self.session.reconnect_interval();
        warn!(
            url = %self.url,
            delay_ms = delay.as_millis() as u64,
            "EventSource reconnecting after delay"
        );
        tokio::time::sleep(delay).await;
        self.shared.ready_state() == ReadyState::Connecting
    }

    fn set_url(&mut self, url: Url) {
        *self.shared.url.write() = url.clone();
        self.url = url;
    }

    /// Emit an error event, then continue with `next` unless a listener
    /// closed the session.
    fn fail(&self, event: ErrorEvent, next: Next) -> Next {
        if self.emit(SseEvent::Error(event)) {
            next
        } else {
            Next::Stop
        }
    }

    /// Returns `false` once the session is closed.
    fn emit(&self, event: SseEvent) -> bool {
        if self.shared.is_closed() {
            return false;
        }
        self.shared.emit(&event);
        !self.shared.is_closed()
    }
}
