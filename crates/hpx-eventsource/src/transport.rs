//! Transport seam and the default hyper implementation.
//!
//! The connection driver only sees [`Transport`]: it hands over a fully built
//! [`SseRequest`] and gets back the status, headers and a body stream.

use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use http_body_util::{BodyDataStream, Empty};
use hyper::{body::Incoming, ext::ReasonPhrase};
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    task::AbortHandle,
};
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::{Host, Url};

use crate::{
    error::{TransportError, TransportResult},
    tls::TlsOptions,
};

/// Response body as a stream of byte chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = TransportResult<Bytes>> + Send>>;

/// One connection attempt, ready to send.
#[derive(Debug)]
pub struct SseRequest {
    /// The event stream URL this attempt targets.
    pub url: Url,
    /// Where to open the socket: `url` itself, or the proxy.
    pub endpoint: Url,
    /// Method, request target and headers.
    pub request: http::Request<()>,
    /// The configured credentials flag.
    pub with_credentials: bool,
}

/// Response head and body returned by a [`Transport`].
pub struct SseResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Reason phrase from the status line, if the transport saw one.
    pub reason: Option<String>,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: BodyStream,
}

impl fmt::Debug for SseResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseResponse")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl SseResponse {
    /// Create a response with no headers.
    pub fn new<S>(status: StatusCode, body: S) -> Self
    where
        S: Stream<Item = TransportResult<Bytes>> + Send + 'static,
    {
        Self {
            status,
            reason: None,
            headers: HeaderMap::new(),
            body: Box::pin(body),
        }
    }

    /// Add a response header.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// The reason phrase, falling back to the canonical one for the status.
    pub fn message(&self) -> String {
        self.reason
            .clone()
            .or_else(|| self.status.canonical_reason().map(str::to_owned))
            .unwrap_or_else(|| self.status.as_str().to_owned())
    }
}

/// Opens one HTTP exchange per connection attempt.
///
/// Implement this to route requests through something other than
/// [`HyperTransport`], then pass it to
/// [`EventSourceConfig::transport`](crate::EventSourceConfig::transport).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `request` and return once the response head has arrived.
    async fn open(&self, request: SseRequest) -> TransportResult<SseResponse>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn open(&self, request: SseRequest) -> TransportResult<SseResponse> {
        (**self).open(request).await
    }
}

/// Default transport: tokio TCP, optional rustls, hyper HTTP/1.1.
///
/// Every attempt opens a fresh connection. The connection task lives as long
/// as the returned body and is aborted when the body is dropped.
#[derive(Clone)]
pub struct HyperTransport {
    tls: TlsConnector,
    servername: Option<String>,
}

impl fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperTransport")
            .field("servername", &self.servername)
            .finish_non_exhaustive()
    }
}

impl HyperTransport {
    /// Build a transport from TLS options and the legacy verification flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS configuration cannot be built.
    pub fn new(tls: &TlsOptions, legacy_reject: Option<bool>) -> TransportResult<Self> {
        let config = tls.build_client_config(legacy_reject)?;
        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
            servername: tls.servername.clone(),
        })
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn open(&self, request: SseRequest) -> TransportResult<SseResponse> {
        let SseRequest {
            endpoint, request, ..
        } = request;

        let host = match endpoint.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(TransportError::config(format!("URL has no host: {endpoint}"))),
        };
        let port = endpoint.port_or_known_default().unwrap_or(80);

        debug!(host = %host, port, scheme = endpoint.scheme(), "Opening TCP connection");
        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        tcp.set_nodelay(true)?;

        let (parts, ()) = request.into_parts();
        let request = http::Request::from_parts(parts, Empty::<Bytes>::new());

        if endpoint.scheme() == "https" {
            let name = self.servername.clone().unwrap_or(host);
            let name = ServerName::try_from(name.as_str())
                .map(|n| n.to_owned())
                .map_err(|e| TransportError::tls(e.to_string()))?;
            let stream = self.tls.connect(name, tcp).await?;
            send(TokioIo::new(stream), request).await
        } else {
            send(TokioIo::new(tcp), request).await
        }
    }
}

async fn send<T>(io: TokioIo<T>, request: http::Request<Empty<Bytes>>) -> TransportResult<SseResponse>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    let conn = tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "HTTP connection task ended with error");
        }
    });
    let guard = AbortOnDrop(conn.abort_handle());

    let response = sender.send_request(request).await?;
    let (parts, body) = response.into_parts();
    let reason = parts
        .extensions
        .get::<ReasonPhrase>()
        .and_then(|r| std::str::from_utf8(r.as_bytes()).ok())
        .map(str::to_owned);

    Ok(SseResponse {
        status: parts.status,
        reason,
        headers: parts.headers,
        body: Box::pin(GuardedBody {
            body: BodyDataStream::new(body),
            _conn: guard,
        }),
    })
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pin_project_lite::pin_project! {
    struct GuardedBody {
        #[pin]
        body: BodyDataStream<Incoming>,
        _conn: AbortOnDrop,
    }
}

impl Stream for GuardedBody {
    type Item = TransportResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project()
            .body
            .poll_next(cx)
            .map(|item| item.map(|chunk| chunk.map_err(TransportError::from)))
    }
}
