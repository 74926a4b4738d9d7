//! Proxy server implementation using hyper
//!
//! Reads each request head itself: CONNECT hands the raw socket to the
//! hooks, anything else is replayed into a one-shot hyper HTTP/1 connection.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, instrument};

use crate::config::ProxyServerConfig;
use crate::error::{PoolError, Result};
use crate::proxy::egress::{format_tcp_addr, Connector, EgressDecision, TcpConnector};
use crate::proxy::handler::{send_via, ForwardOutcome};
use crate::proxy::hooks::{text_response, Intercept, ProxyBody, ProxyHooks};
use crate::proxy::resolver::SystemResolver;
use crate::proxy::tls;
use crate::proxy::transport::{parse_target, read_request_head, PrefixedIo};

const BAD_REQUEST_LINE: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";
const HYPER_DEFAULT_MAX_HEADERS: usize = 100;

/// Proxy server
pub struct ProxyServer {
    config: Arc<ProxyServerConfig>,
    hooks: Arc<dyn ProxyHooks>,
    connector: Arc<dyn Connector>,
    tls: TlsConnector,
}

impl ProxyServer {
    /// Create a new proxy server dispatching to `hooks`
    pub fn new(config: ProxyServerConfig, hooks: Arc<dyn ProxyHooks>) -> Result<Self> {
        let connector = Arc::new(TcpConnector::new(
            Arc::new(SystemResolver),
            config.connect_timeout,
        ));

        Ok(Self {
            config: Arc::new(config),
            hooks,
            connector,
            tls: tls::client_connector()?,
        })
    }

    /// Bind the configured address and serve until shutdown
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = format_tcp_addr(&self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Proxy server listening on {}", listener.local_addr()?);

        self.serve(listener, shutdown).await
    }

    /// Accept connections from `listener` until `shutdown` turns true
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let hooks = self.hooks.clone();
                            let connector = self.connector.clone();
                            let tls = self.tls.clone();
                            let max_header_size = self.config.max_header_size;

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    client_addr,
                                    hooks,
                                    connector,
                                    tls,
                                    max_header_size,
                                ).await {
                                    debug!("Connection error from {}: {}", client_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(
        mut stream: TcpStream,
        client_addr: SocketAddr,
        hooks: Arc<dyn ProxyHooks>,
        connector: Arc<dyn Connector>,
        tls: TlsConnector,
        max_header_size: usize,
    ) -> Result<()> {
        let head = match read_request_head(&mut stream, max_header_size).await {
            Ok(head) => head,
            Err(e @ PoolError::InvalidRequest(_)) => {
                let _ = stream.write_all(BAD_REQUEST_LINE).await;
                let _ = stream.shutdown().await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if head.request.method() == Method::CONNECT {
            debug!("CONNECT {} from {}", head.request.uri(), client_addr);
            let leftover = head.leftover();
            hooks
                .intercept_connect(head.request, Box::new(PrefixedIo::new(leftover, stream)))
                .await;
            return Ok(());
        }

        // hyper parses the head again from the replayed bytes.
        let max_headers = head.request.headers().len().max(HYPER_DEFAULT_MAX_HEADERS);
        let io = TokioIo::new(PrefixedIo::new(head.buffered.freeze(), stream));
        let service = service_fn(move |req: Request<Incoming>| {
            let hooks = hooks.clone();
            let connector = connector.clone();
            let tls = tls.clone();

            async move {
                let response = match hooks.intercept_request(req).await {
                    Intercept::Respond(response) => response,
                    Intercept::Passthrough(req) => {
                        forward_direct(connector.as_ref(), &tls, req).await
                    }
                };
                Ok::<_, Infallible>(response)
            }
        });

        http1::Builder::new()
            .keep_alive(false)
            .max_headers(max_headers)
            .serve_connection(io, service)
            .await?;

        Ok(())
    }
}

/// Default forwarding for requests the hooks pass through: direct egress.
async fn forward_direct(
    connector: &dyn Connector,
    tls: &TlsConnector,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    let (host, port) = match parse_target(req.uri()) {
        Ok(target) => target,
        Err(e) => return error_response(&e),
    };

    match send_via(connector, tls, req, &host, port, EgressDecision::Local).await {
        ForwardOutcome::Forwarded(response) => response.map(|body| body.boxed()),
        ForwardOutcome::Passthrough(_) => error_response(&PoolError::DialFailed(format!(
            "{} is unreachable",
            format_tcp_addr(&host, port)
        ))),
        ForwardOutcome::Failed(e) => error_response(&e),
    }
}

fn error_response(err: &PoolError) -> Response<ProxyBody> {
    debug!("Answering with {}: {}", err.status_code(), err);
    text_response(err.status_code(), err.to_string())
}

/// Builder for creating a proxy server
pub struct ProxyServerBuilder {
    config: ProxyServerConfig,
    hooks: Option<Arc<dyn ProxyHooks>>,
    connector: Option<Arc<dyn Connector>>,
    tls: Option<TlsConnector>,
}

impl ProxyServerBuilder {
    pub fn new(config: ProxyServerConfig) -> Self {
        Self {
            config,
            hooks: None,
            connector: None,
            tls: None,
        }
    }

    pub fn hooks(mut self, hooks: Arc<dyn ProxyHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Connector used for default (passthrough) forwarding
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// TLS client used for default forwarding of `https://` requests
    pub fn tls(mut self, tls: TlsConnector) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn build(self) -> Result<ProxyServer> {
        let hooks = self
            .hooks
            .ok_or_else(|| PoolError::InvalidConfig("proxy hooks are required".into()))?;

        let mut server = ProxyServer::new(self.config, hooks)?;
        if let Some(connector) = self.connector {
            server.connector = connector;
        }
        if let Some(tls) = self.tls {
            server.tls = tls;
        }
        Ok(server)
    }
}
