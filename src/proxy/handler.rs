//! Plain HTTP forwarding through a source-bound upstream connection
//!
//! Rewrites an absolute-form proxy request into an origin-form request and
//! sends it over a fresh HTTP/1.1 connection dialed from the chosen egress
//! address, inside TLS for `https://` targets. Anything the handler cannot
//! route is handed back unmodified so the engine's default forwarding can
//! deal with it.

use std::error::Error as StdError;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Empty;
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, instrument, warn};

use crate::error::PoolError;
use crate::proxy::egress::{Connector, EgressDecision};
use crate::proxy::resolver::Classifier;
use crate::proxy::selector::AddressSelector;
use crate::proxy::tls;
use crate::proxy::transport::{is_tls_target, origin_form, parse_target};

/// Result of trying to forward a plain request
#[derive(Debug)]
pub enum ForwardOutcome<B> {
    /// Upstream answered; the response is streamed back as is
    Forwarded(Response<Incoming>),
    /// Nothing was sent; the original request is returned for default handling
    Passthrough(Request<B>),
    /// The request was already on the wire when the exchange failed
    Failed(PoolError),
}

/// Forwards plain HTTP requests from a rotating source address
pub struct ForwardHandler {
    classifier: Classifier,
    selector: AddressSelector,
    connector: Arc<dyn Connector>,
    tls: TlsConnector,
}

impl ForwardHandler {
    pub fn new(
        classifier: Classifier,
        selector: AddressSelector,
        connector: Arc<dyn Connector>,
        tls: TlsConnector,
    ) -> Self {
        Self {
            classifier,
            selector,
            connector,
            tls,
        }
    }

    /// Forward `req`, or hand it back when it cannot be routed.
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn forward<B>(&self, req: Request<B>) -> ForwardOutcome<B>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let (host, port) = match parse_target(req.uri()) {
            Ok(target) => target,
            Err(e) => {
                debug!("Not forwarding: {}", e);
                return ForwardOutcome::Passthrough(req);
            }
        };

        let destination = match self.classifier.classify(&host).await {
            Ok(destination) => destination,
            Err(e) => {
                warn!("Get IP address error for {}: {}", host, e);
                return ForwardOutcome::Passthrough(req);
            }
        };

        let egress = EgressDecision::for_destination(&destination, &self.selector);
        info!(
            "Connecting to {}:{} [{}] from {}",
            host, port, destination.address, egress
        );

        send_via(self.connector.as_ref(), &self.tls, req, &host, port, egress).await
    }
}

/// Send `req` to `host:port` over a new connection dialed with `egress`.
///
/// `https://` targets are wrapped in a TLS session before the exchange.
pub async fn send_via<B>(
    connector: &dyn Connector,
    tls: &TlsConnector,
    req: Request<B>,
    host: &str,
    port: u16,
    egress: EgressDecision,
) -> ForwardOutcome<B>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let stream = match connector.connect(host, port, egress).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Dial {}:{} from {} failed: {}", host, port, egress, e);
            return ForwardOutcome::Passthrough(req);
        }
    };

    if !is_tls_target(req.uri()) {
        return exchange(stream, req, host, port).await;
    }

    match tls::connect(tls, host, stream).await {
        Ok(stream) => exchange(stream, req, host, port).await,
        Err(e) => {
            warn!("Upstream {}:{}: {}", host, port, e);
            ForwardOutcome::Passthrough(req)
        }
    }
}

/// Run one HTTP/1.1 exchange over an established upstream stream.
async fn exchange<S, B>(stream: S, req: Request<B>, host: &str, port: u16) -> ForwardOutcome<B>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    if req.body().is_end_stream() {
        // Without a body the original stays intact, whatever happens upstream.
        let (parts, body) = req.into_parts();
        let upstream = Request::from_parts(parts.clone(), Empty::<Bytes>::new());

        let Some(mut sender) = handshake(stream, host, port).await else {
            return ForwardOutcome::Passthrough(Request::from_parts(parts, body));
        };
        return match sender.send_request(rewrite_request(upstream)).await {
            Ok(response) => ForwardOutcome::Forwarded(response),
            Err(e) => {
                debug!("Bodyless request to {}:{} failed: {}", host, port, e);
                ForwardOutcome::Passthrough(Request::from_parts(parts, body))
            }
        };
    }

    let Some(mut sender) = handshake(stream, host, port).await else {
        return ForwardOutcome::Passthrough(req);
    };

    let original_uri = req.uri().clone();
    let original_headers = req.headers().clone();

    match sender.try_send_request(rewrite_request(req)).await {
        Ok(response) => ForwardOutcome::Forwarded(response),
        Err(mut err) => match err.take_message() {
            Some(mut unsent) => {
                debug!("Request to {}:{} was not sent: {}", host, port, err.error());
                *unsent.uri_mut() = original_uri;
                *unsent.headers_mut() = original_headers;
                ForwardOutcome::Passthrough(unsent)
            }
            None => ForwardOutcome::Failed(PoolError::from(err.into_error())),
        },
    }
}

/// HTTP/1.1 client handshake; the connection task is spawned.
async fn handshake<S, T>(stream: S, host: &str, port: u16) -> Option<http1::SendRequest<T>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: Body + Send + 'static,
    T::Data: Send,
    T::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let (sender, conn) = match http1::handshake(TokioIo::new(stream)).await {
        Ok(handshake) => handshake,
        Err(e) => {
            warn!("Upstream handshake with {}:{} failed: {}", host, port, e);
            return None;
        }
    };

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection ended: {}", e);
        }
    });

    Some(sender)
}

/// Turn an absolute-form proxy request into the request sent upstream.
fn rewrite_request<B>(req: Request<B>) -> Request<B> {
    let (mut parts, body) = req.into_parts();

    strip_hop_by_hop(&mut parts.headers);
    if let Some(authority) = parts.uri.authority() {
        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
            parts.headers.insert(HOST, value);
        }
    }
    parts.uri = origin_form(&parts.uri);

    Request::from_parts(parts, body)
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    let fixed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();

    for name in listed.into_iter().chain(fixed) {
        headers.remove(&name);
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
