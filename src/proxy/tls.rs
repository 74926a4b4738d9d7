//! TLS origination for `https://` plain requests

use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{PoolError, Result};

/// Client connector trusting the bundled web PKI roots.
pub fn client_connector() -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    connector_with_roots(roots)
}

/// Client connector trusting only `roots`.
pub fn connector_with_roots(roots: RootCertStore) -> Result<TlsConnector> {
    // Explicit provider; no process-wide default is installed.
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| PoolError::Tls(format!("TLS config error: {}", e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Run the client handshake for `host` over an already dialed stream.
pub async fn connect<S>(connector: &TlsConnector, host: &str, stream: S) -> Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| PoolError::Tls(format!("invalid server name '{}'", host)))?;

    let stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| PoolError::Tls(format!("handshake with {} failed: {}", host, e)))?;

    debug!("TLS session established with {}", host);
    Ok(stream)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::net::SocketAddr;
    use rustls::ServerConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_rustls::TlsAcceptor;

    const CA_PEM: &[u8] = include_bytes!("testdata/ca.pem");
    const UPSTREAM_PEM: &[u8] = include_bytes!("testdata/upstream.pem");
    const UPSTREAM_KEY: &[u8] = include_bytes!("testdata/upstream.key");

    /// Name the upstream certificate is issued for.
    pub(crate) const UPSTREAM_NAME: &str = "tls.test";

    /// Connector trusting the test CA only.
    pub(crate) fn test_connector() -> TlsConnector {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut &CA_PEM[..]) {
            roots.add(cert.unwrap()).unwrap();
        }
        connector_with_roots(roots).unwrap()
    }

    fn acceptor() -> TlsAcceptor {
        let certs = rustls_pemfile::certs(&mut &UPSTREAM_PEM[..])
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        let key = rustls_pemfile::private_key(&mut &UPSTREAM_KEY[..])
            .unwrap()
            .unwrap();

        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();

        TlsAcceptor::from(Arc::new(config))
    }

    /// TLS upstream that captures the first request head and answers with `reply`.
    pub(crate) async fn tls_upstream(
        reply: &'static [u8],
    ) -> (SocketAddr, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = acceptor();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = acceptor.accept(stream).await.unwrap();

            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
            stream.write_all(reply).await.unwrap();
            let _ = stream.shutdown().await;
        });

        (addr, rx)
    }

    #[tokio::test]
    async fn test_handshake_with_trusted_upstream() {
        let (addr, head_rx) = tls_upstream(b"HTTP/1.1 204 No Content\r\n\r\n").await;
        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();

        let mut stream = connect(&test_connector(), UPSTREAM_NAME, tcp).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: tls.test\r\n\r\n")
            .await
            .unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"HTTP/1.1 204 No Content\r\n\r\n");
        assert!(head_rx.await.unwrap().starts_with("GET / HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_untrusted_upstream_fails_handshake() {
        let (addr, _head_rx) = tls_upstream(b"").await;
        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();

        let err = connect(&client_connector().unwrap(), UPSTREAM_NAME, tcp)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Tls(_)));
    }

    #[tokio::test]
    async fn test_name_mismatch_fails_handshake() {
        let (addr, _head_rx) = tls_upstream(b"").await;
        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();

        let err = connect(&test_connector(), "other.test", tcp).await.unwrap_err();
        assert!(matches!(err, PoolError::Tls(_)));
    }
}
