//! CONNECT tunnel implementation for HTTPS proxying
//!
//! Authenticates the CONNECT, picks the egress address for the destination,
//! dials it and relays bytes until either side closes.

use std::sync::Arc;

use hyper::{Request, Version};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::proxy::egress::{Connector, EgressDecision};
use crate::proxy::middleware::{ProxyAuth, CHALLENGE_LINE};
use crate::proxy::resolver::Classifier;
use crate::proxy::selector::AddressSelector;
use crate::proxy::transport::parse_authority;

/// How a CONNECT session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelOutcome {
    /// Credentials missing or wrong; the client got a 407
    Unauthorized,
    /// Destination could not be resolved; the client was dropped without a reply
    Abandoned,
    /// Upstream dial failed; the client got a 500
    DialFailed,
    /// Tunnel was established and relayed until one side closed
    Relayed,
}

/// Handles CONNECT requests handed over by the engine
pub struct TunnelHandler {
    auth: ProxyAuth,
    classifier: Classifier,
    selector: AddressSelector,
    connector: Arc<dyn Connector>,
}

impl TunnelHandler {
    pub fn new(
        auth: ProxyAuth,
        classifier: Classifier,
        selector: AddressSelector,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            auth,
            classifier,
            selector,
            connector,
        }
    }

    /// Drive one CONNECT session to completion on `client`.
    #[instrument(skip(self, req, client), fields(target = %req.uri()))]
    pub async fn handle<C>(&self, req: &Request<()>, mut client: C) -> TunnelOutcome
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Err(e) = self.auth.validate(req.headers()) {
            debug!("CONNECT rejected: {}", e);
            let _ = client.write_all(CHALLENGE_LINE).await;
            let _ = client.shutdown().await;
            return TunnelOutcome::Unauthorized;
        }

        let Some(authority) = req.uri().authority() else {
            warn!("CONNECT without an authority: {}", req.uri());
            return TunnelOutcome::Abandoned;
        };
        let (host, port) = parse_authority(authority);

        let destination = match self.classifier.classify(&host).await {
            Ok(destination) => destination,
            Err(e) => {
                warn!("Get IP address error for {}: {}", host, e);
                return TunnelOutcome::Abandoned;
            }
        };

        let egress = EgressDecision::for_destination(&destination, &self.selector);
        info!(
            "Connecting to {} [{}] from {}",
            authority, destination.address, egress
        );

        let server = match self.connector.connect(&host, port, egress).await {
            Ok(server) => server,
            Err(e) => {
                warn!("Dial {} from {} failed: {}", authority, egress, e);
                let reply = status_line(req.version(), "500 Internal Server Error");
                let _ = client.write_all(reply.as_bytes()).await;
                let _ = client.shutdown().await;
                return TunnelOutcome::DialFailed;
            }
        };

        let reply = status_line(req.version(), "200 OK");
        if let Err(e) = client.write_all(reply.as_bytes()).await {
            debug!("Client left before the tunnel was established: {}", e);
            return TunnelOutcome::Abandoned;
        }

        relay(client, server).await;
        TunnelOutcome::Relayed
    }
}

/// Status line echoing the protocol version of the client's CONNECT.
fn status_line(version: Version, status: &str) -> String {
    format!("{:?} {}\r\n\r\n", version, status)
}

/// Relay bytes between two streams until either direction finishes.
///
/// The first copy to reach EOF or an error ends the session; both write
/// halves are then shut down and the streams dropped.
pub async fn relay<C, S>(client: C, server: S)
where
    C: AsyncRead + AsyncWrite + Send,
    S: AsyncRead + AsyncWrite + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let (direction, result) = tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut server_write) => ("client to server", result),
        result = tokio::io::copy(&mut server_read, &mut client_write) => ("server to client", result),
    };

    match result {
        Ok(bytes) => debug!(direction, bytes, "Tunnel closed"),
        Err(e) => debug!(direction, "Tunnel copy ended: {}", e),
    }

    let _ = server_write.shutdown().await;
    let _ = client_write.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::egress::tests::RecordingConnector;
    use crate::proxy::middleware::Credential;
    use crate::proxy::resolver::tests::StaticResolver;

    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use hyper::Method;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    const PREFIX: &str = "2001:db8::/64";

    fn connect_request(authority: &str, version: Version) -> Request<()> {
        Request::builder()
            .method(Method::CONNECT)
            .uri(authority)
            .version(version)
            .body(())
            .unwrap()
    }

    fn handler(auth: ProxyAuth, connector: Arc<RecordingConnector>) -> TunnelHandler {
        let resolver = StaticResolver::default()
            .with("v6.test", &["2001:db8:ffff::1", "192.0.2.10"])
            .with("v4.test", &["192.0.2.20"]);
        TunnelHandler::new(
            auth,
            Classifier::new(Arc::new(resolver), None),
            AddressSelector::from_cidr(PREFIX).unwrap(),
            connector,
        )
    }

    /// Upstream that answers each accepted connection by echoing what it reads.
    async fn echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = stream.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_relay_moves_bytes_both_ways() {
        let (mut client_app, client_side) = tokio::io::duplex(1024);
        let (server_side, mut server_app) = tokio::io::duplex(1024);
        let relay_task = tokio::spawn(relay(client_side, server_side));

        let upload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = upload.clone();
        let writer = tokio::spawn(async move {
            client_app.write_all(&upload).await.unwrap();
            client_app
        });

        let mut received = vec![0u8; expected.len()];
        server_app.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        let mut client_app = writer.await.unwrap();
        server_app.write_all(b"hello from server").await.unwrap();
        let mut buf = [0u8; 17];
        client_app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from server");

        drop(client_app);
        timeout(Duration::from_secs(1), relay_task)
            .await
            .expect("relay did not finish after client closed")
            .unwrap();

        let mut rest = Vec::new();
        server_app.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_relay_server_close_reaches_client() {
        let (mut client_app, client_side) = tokio::io::duplex(1024);
        let (server_side, server_app) = tokio::io::duplex(1024);
        let relay_task = tokio::spawn(relay(client_side, server_side));

        drop(server_app);
        timeout(Duration::from_secs(1), relay_task)
            .await
            .expect("relay did not finish after server closed")
            .unwrap();

        let mut rest = Vec::new();
        let n = timeout(Duration::from_secs(1), client_app.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_unauthorized_connect_gets_exact_challenge() {
        let connector = Arc::new(RecordingConnector::refusing());
        let auth = ProxyAuth::new(Credential::from_parts("u", "p").unwrap());
        let tunnel = handler(auth, connector.clone());

        let client = tokio_test::io::Builder::new().write(CHALLENGE_LINE).build();
        let outcome = tunnel
            .handle(&connect_request("v6.test:443", Version::HTTP_11), client)
            .await;

        assert_eq!(outcome, TunnelOutcome::Unauthorized);
        assert!(connector.dials().is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_destination_closes_without_reply() {
        let connector = Arc::new(RecordingConnector::refusing());
        let tunnel = handler(ProxyAuth::disabled(), connector.clone());
        let (mut client_app, client_side) = tokio::io::duplex(1024);

        let outcome = tunnel
            .handle(&connect_request("nowhere.test:443", Version::HTTP_11), client_side)
            .await;
        assert_eq!(outcome, TunnelOutcome::Abandoned);

        let mut rest = Vec::new();
        client_app.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(connector.dials().is_empty());
    }

    #[tokio::test]
    async fn test_dial_failure_echoes_client_version() {
        let connector = Arc::new(RecordingConnector::refusing());
        let tunnel = handler(ProxyAuth::disabled(), connector.clone());
        let (mut client_app, client_side) = tokio::io::duplex(1024);

        let outcome = tunnel
            .handle(&connect_request("v4.test:443", Version::HTTP_10), client_side)
            .await;
        assert_eq!(outcome, TunnelOutcome::DialFailed);

        let mut reply = Vec::new();
        client_app.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"HTTP/1.0 500 Internal Server Error\r\n\r\n");
        assert_eq!(connector.dials().len(), 1);
    }

    #[tokio::test]
    async fn test_ipv6_destination_is_dialed_from_prefix() {
        let upstream = echo_upstream().await;
        let connector = Arc::new(RecordingConnector::to(upstream));
        let credentials = BASE64.encode(b"u:p");
        let tunnel = handler(
            ProxyAuth::new(Credential::from_parts("u", "p").unwrap()),
            connector.clone(),
        );

        let mut req = connect_request("v6.test:8443", Version::HTTP_11);
        req.headers_mut().insert(
            hyper::header::PROXY_AUTHORIZATION,
            format!("Basic {}", credentials).parse().unwrap(),
        );

        let (mut client_app, client_side) = tokio::io::duplex(1024);
        let session = tokio::spawn(async move { tunnel.handle(&req, client_side).await });

        let mut reply = [0u8; 19];
        client_app.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HTTP/1.1 200 OK\r\n\r\n");

        client_app.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client_app.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        drop(client_app);
        let outcome = timeout(Duration::from_secs(1), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, TunnelOutcome::Relayed);

        let dials = connector.dials();
        assert_eq!(dials.len(), 1);
        let (host, port, egress) = &dials[0];
        assert_eq!((host.as_str(), *port), ("v6.test", 8443));
        let selector = AddressSelector::from_cidr(PREFIX).unwrap();
        match egress {
            EgressDecision::Address(addr) => assert!(selector.contains(addr)),
            other => panic!("expected a prefix address, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ipv4_destination_uses_local_egress() {
        let upstream = echo_upstream().await;
        let connector = Arc::new(RecordingConnector::to(upstream));
        let tunnel = handler(ProxyAuth::disabled(), connector.clone());

        let (mut client_app, client_side) = tokio::io::duplex(1024);
        let req = connect_request("v4.test:443", Version::HTTP_11);
        let session = tokio::spawn(async move { tunnel.handle(&req, client_side).await });

        let mut reply = [0u8; 19];
        client_app.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HTTP/1.1 200 OK\r\n\r\n");
        drop(client_app);

        assert_eq!(session.await.unwrap(), TunnelOutcome::Relayed);
        assert_eq!(
            connector.dials(),
            vec![("v4.test".to_string(), 443, EgressDecision::Local)]
        );
    }
}
