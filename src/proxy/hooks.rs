//! Hooks the protocol engine calls for every inbound request
//!
//! The engine only knows [`ProxyHooks`]; [`EgressProxy`] is the
//! implementation that authenticates, picks egress addresses and relays.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::ProxyServerConfig;
use crate::error::Result;
use crate::proxy::egress::{Connector, TcpConnector};
use crate::proxy::handler::{ForwardHandler, ForwardOutcome};
use crate::proxy::middleware::{Credential, ProxyAuth};
use crate::proxy::resolver::{Classifier, Resolver, SystemResolver};
use crate::proxy::selector::AddressSelector;
use crate::proxy::tls;
use crate::proxy::tunnel::TunnelHandler;

/// Response body type produced by hooks and the engine
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Raw client connection handed over for CONNECT
pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientStream for T {}

/// What to do with a plain request
pub enum Intercept {
    /// Answer the client with this response
    Respond(Response<ProxyBody>),
    /// Let the engine forward the request itself
    Passthrough(Request<Incoming>),
}

#[async_trait]
pub trait ProxyHooks: Send + Sync {
    /// Called for every non-CONNECT request.
    async fn intercept_request(&self, req: Request<Incoming>) -> Intercept;

    /// Called for CONNECT with the client socket; the hook owns it from here.
    async fn intercept_connect(&self, req: Request<()>, client: Box<dyn ClientStream>);
}

/// Build a complete body from static or owned bytes.
pub fn full_body(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text response with the given status.
pub fn text_response(status: StatusCode, message: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Proxy core: auth gate in front of the tunnel and forward handlers
pub struct EgressProxy {
    auth: ProxyAuth,
    tunnel: TunnelHandler,
    forward: ForwardHandler,
}

impl EgressProxy {
    /// Build the core from server configuration with system DNS, real sockets
    /// and the web PKI roots.
    pub fn from_config(config: &ProxyServerConfig) -> Result<Self> {
        let selector = AddressSelector::from_cidr(&config.cidr)?;
        let credential = Credential::from_parts(&config.username, &config.password)?;
        let resolver: Arc<dyn Resolver> = Arc::new(SystemResolver);
        let connector = Arc::new(TcpConnector::new(resolver.clone(), config.connect_timeout));

        Ok(Self::new(
            credential,
            selector,
            resolver,
            connector,
            tls::client_connector()?,
            config.connect_timeout,
        ))
    }

    /// Build the core from explicit parts.
    pub fn new(
        credential: Option<Credential>,
        selector: AddressSelector,
        resolver: Arc<dyn Resolver>,
        connector: Arc<dyn Connector>,
        tls: TlsConnector,
        resolve_timeout: Option<std::time::Duration>,
    ) -> Self {
        let auth = ProxyAuth::new(credential);
        let classifier = Classifier::new(resolver, resolve_timeout);

        Self {
            tunnel: TunnelHandler::new(
                auth.clone(),
                classifier.clone(),
                selector,
                connector.clone(),
            ),
            forward: ForwardHandler::new(classifier, selector, connector, tls),
            auth,
        }
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth.is_enabled()
    }
}

#[async_trait]
impl ProxyHooks for EgressProxy {
    async fn intercept_request(&self, req: Request<Incoming>) -> Intercept {
        if let Err(e) = self.auth.validate(req.headers()) {
            debug!("Plain request rejected: {}", e);
            return Intercept::Respond(
                self.auth
                    .challenge_response(full_body("Proxy Authentication Required")),
            );
        }

        match self.forward.forward(req).await {
            ForwardOutcome::Forwarded(response) => {
                Intercept::Respond(response.map(|body| body.boxed()))
            }
            ForwardOutcome::Passthrough(req) => Intercept::Passthrough(req),
            ForwardOutcome::Failed(e) => {
                warn!("Forwarding failed after the request was sent: {}", e);
                Intercept::Respond(text_response(e.status_code(), e.to_string()))
            }
        }
    }

    async fn intercept_connect(&self, req: Request<()>, client: Box<dyn ClientStream>) {
        let outcome = self.tunnel.handle(&req, client).await;
        debug!(?outcome, "CONNECT session finished");
    }
}
