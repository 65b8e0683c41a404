//! EventSource connection configuration.

use std::{fmt, sync::Arc, time::Duration};

use url::Url;

use crate::{session::DEFAULT_RECONNECT_INTERVAL, tls::TlsOptions, transport::Transport};

/// Configuration for an [`EventSource`](crate::EventSource).
///
/// Provides sensible defaults and chainable setter methods; the URL is the
/// only required field.
#[derive(Clone)]
pub struct EventSourceConfig {
    /// Event stream URL.
    pub url: String,
    /// Additional HTTP headers sent with every request.
    pub headers: http::HeaderMap,
    /// HTTP proxy to send requests through.
    pub proxy: Option<String>,
    /// TLS settings for `https` endpoints.
    pub tls: TlsOptions,
    /// Legacy top-level certificate verification flag. Only consulted when
    /// `tls.reject_unauthorized` is unset.
    pub reject_unauthorized: Option<bool>,
    /// Replaces the default hyper transport.
    pub transport: Option<Arc<dyn Transport>>,
    /// Carried for API compatibility; no effect on requests.
    pub with_credentials: bool,
    /// Reconnect delay used until the server sends `retry:`.
    pub reconnect_interval: Duration,
    /// Maximum wait for response headers on each attempt.
    pub connect_timeout: Duration,
    /// `Last-Event-ID` to send on the first request.
    pub last_event_id: String,
}

impl fmt::Debug for EventSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSourceConfig")
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("proxy", &self.proxy)
            .field("tls", &self.tls)
            .field("reject_unauthorized", &self.reject_unauthorized)
            .field("custom_transport", &self.transport.is_some())
            .field("with_credentials", &self.with_credentials)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("last_event_id", &self.last_event_id)
            .finish()
    }
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: http::HeaderMap::new(),
            proxy: None,
            tls: TlsOptions::default(),
            reject_unauthorized: None,
            transport: None,
            with_credentials: false,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            connect_timeout: Duration::from_secs(10),
            last_event_id: String::new(),
        }
    }
}

impl EventSourceConfig {
    /// Create a new configuration with the given URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Add one HTTP header, replacing any previous value for the name.
    #[must_use]
    pub fn header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set additional HTTP headers.
    #[must_use]
    pub fn headers(mut self, headers: http::HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Route requests through an HTTP proxy.
    #[must_use]
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Set the TLS options.
    #[must_use]
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Set the legacy certificate verification flag.
    #[must_use]
    pub fn reject_unauthorized(mut self, reject: bool) -> Self {
        self.reject_unauthorized = Some(reject);
        self
    }

    /// Use a custom transport instead of [`HyperTransport`](crate::HyperTransport).
    #[must_use]
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Set the credentials flag.
    #[must_use]
    pub fn with_credentials(mut self, with_credentials: bool) -> Self {
        self.with_credentials = with_credentials;
        self
    }

    /// Set the initial reconnect interval.
    #[must_use]
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Resume from the given event id.
    #[must_use]
    pub fn last_event_id(mut self, id: impl Into<String>) -> Self {
        self.last_event_id = id.into();
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message string if any field has an invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        parse_http_url(&self.url, "URL")?;
        if let Some(proxy) = &self.proxy {
            parse_http_url(proxy, "Proxy URL")?;
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        Ok(())
    }
}

/// Parse `raw` and require an `http` or `https` scheme.
pub(crate) fn parse_http_url(raw: &str, what: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("{what} is invalid: {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("{what} scheme must be http or https, got {other}")),
    }
}
