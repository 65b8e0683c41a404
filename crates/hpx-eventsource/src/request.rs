//! Per-attempt request construction.
//!
//! Every attempt, including reconnects and redirects, rebuilds the request
//! from the configuration and the current session so `Last-Event-ID` always
//! reflects the latest `id:` field.

use http::{
    HeaderMap, HeaderName, HeaderValue, Method,
    header::{ACCEPT, CACHE_CONTROL, HOST},
};
use tracing::warn;
use url::{Position, Url};

use crate::{
    config::EventSourceConfig, error::TransportResult, session::SessionState,
    transport::SseRequest,
};

/// `Last-Event-ID` request header.
pub const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

const EVENT_STREAM: HeaderValue = HeaderValue::from_static("text/event-stream");
const NO_CACHE: HeaderValue = HeaderValue::from_static("no-cache");

/// Build the request for one connection attempt to `url`.
///
/// Header policy: `Cache-Control: no-cache` and `Accept: text/event-stream`
/// are always present, `Last-Event-ID` only when the session has one, and
/// caller headers with non-empty values override any of them. With a proxy,
/// the request goes to the proxy with the absolute URL as its target and the
/// original host in `Host`.
pub fn build_request(
    config: &EventSourceConfig,
    url: &Url,
    proxy: Option<&Url>,
    session: &SessionState,
) -> TransportResult<SseRequest> {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, NO_CACHE);
    headers.insert(ACCEPT, EVENT_STREAM);

    if !session.last_event_id().is_empty() {
        match HeaderValue::from_str(session.last_event_id()) {
            Ok(value) => {
                headers.insert(LAST_EVENT_ID, value);
            }
            Err(_) => warn!(
                last_event_id = session.last_event_id(),
                "Last event id is not a valid header value; not sending it"
            ),
        }
    }

    merge_headers(&mut headers, &config.headers);

    let host = HeaderValue::from_str(&host_header(url))?;
    let (endpoint, target) = match proxy {
        Some(proxy) => {
            headers.insert(HOST, host);
            (proxy.clone(), url[..Position::AfterQuery].to_string())
        }
        None => {
            headers.entry(HOST).or_insert(host);
            (
                url.clone(),
                url[Position::BeforePath..Position::AfterQuery].to_string(),
            )
        }
    };

    let mut request = http::Request::builder()
        .method(Method::GET)
        .uri(target)
        .body(())?;
    *request.headers_mut() = headers;

    Ok(SseRequest {
        url: url.clone(),
        endpoint,
        request,
        with_credentials: config.with_credentials,
    })
}

/// Overlay `extra` onto `headers`, replacing whole names. Empty values are
/// skipped, so a caller cannot blank out a fixed header.
fn merge_headers(headers: &mut HeaderMap, extra: &HeaderMap) {
    for name in extra.keys() {
        let values: Vec<HeaderValue> = extra
            .get_all(name)
            .iter()
            .filter(|value| !value.is_empty())
            .cloned()
            .collect();
        if values.is_empty() {
            continue;
        }
        headers.remove(name);
        for value in values {
            headers.append(name.clone(), value);
        }
    }
}

/// `host[:port]`, with the port only when it is not the scheme default.
fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Scheme, host and port of `url`, as stamped onto message events.
pub(crate) fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}
