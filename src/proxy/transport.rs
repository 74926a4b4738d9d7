//! Connection plumbing shared by the engine and the handlers
//!
//! Parses proxy targets, reads raw request heads off accepted sockets and
//! replays already-consumed bytes in front of a stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use http::uri::{Authority, Scheme};
use hyper::{Request, Uri, Version};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::error::{PoolError, Result};
use crate::proxy::resolver::unbracket;

/// Header slots tried first; larger heads are reparsed with a sized buffer.
const INLINE_HEADERS: usize = 64;

/// Parse host and port from an absolute-form request URI
///
/// `http` defaults to port 80 and `https` to 443.
pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
    let default_port = match uri.scheme_str() {
        Some("http") => 80,
        Some("https") => 443,
        Some(other) => {
            return Err(PoolError::InvalidRequest(format!(
                "Unsupported scheme '{}' for plain forwarding",
                other
            )))
        }
        None => return Err(PoolError::InvalidRequest("Missing scheme in URI".to_string())),
    };

    let host = uri
        .host()
        .ok_or_else(|| PoolError::InvalidRequest("Missing host in URI".to_string()))?;

    Ok((
        unbracket(host).to_string(),
        uri.port_u16().unwrap_or(default_port),
    ))
}

/// Whether the upstream exchange for `uri` runs over TLS
pub fn is_tls_target(uri: &Uri) -> bool {
    uri.scheme() == Some(&Scheme::HTTPS)
}

/// Parse host and port from a CONNECT authority, defaulting to 443
pub fn parse_authority(authority: &Authority) -> (String, u16) {
    (
        unbracket(authority.host()).to_string(),
        authority.port_u16().unwrap_or(443),
    )
}

/// Origin-form request target (`/path?query`) for an upstream request
pub fn origin_form(uri: &Uri) -> Uri {
    uri.path_and_query()
        .map(|pq| Uri::from(pq.clone()))
        .unwrap_or_else(|| Uri::from_static("/"))
}

/// A request head read off a raw client socket
#[derive(Debug)]
pub struct RawHead {
    /// Parsed head; the body, if any, is still on the wire
    pub request: Request<()>,
    /// Length of the head within `buffered`
    pub head_len: usize,
    /// Every byte consumed from the socket so far
    pub buffered: BytesMut,
}

impl RawHead {
    /// Bytes read past the end of the head
    pub fn leftover(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffered[self.head_len..])
    }
}

/// Read and parse one request head, consuming at most about `max_size` bytes.
pub async fn read_request_head<S>(stream: &mut S, max_size: usize) -> Result<RawHead>
where
    S: AsyncRead + Unpin,
{
    let mut buffered = BytesMut::with_capacity(4096);

    loop {
        if let Some((request, head_len)) = parse_request_head(&buffered)? {
            return Ok(RawHead {
                request,
                head_len,
                buffered,
            });
        }

        if buffered.len() >= max_size {
            return Err(PoolError::InvalidRequest(format!(
                "Request head exceeds {} bytes",
                max_size
            )));
        }

        if stream.read_buf(&mut buffered).await? == 0 {
            return Err(PoolError::InvalidRequest(
                "Connection closed before request head was complete".to_string(),
            ));
        }
    }
}

fn parse_request_head(buf: &[u8]) -> Result<Option<(Request<()>, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; INLINE_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    match parsed.parse(buf) {
        Err(httparse::Error::TooManyHeaders) => {
            // Every header line takes at least three bytes.
            let mut headers = vec![httparse::EMPTY_HEADER; buf.len() / 3 + 1];
            let mut parsed = httparse::Request::new(&mut headers);
            let status = parsed.parse(buf);
            build_request(&parsed, status)
        }
        status => build_request(&parsed, status),
    }
}

fn build_request(
    parsed: &httparse::Request<'_, '_>,
    status: httparse::Result<usize>,
) -> Result<Option<(Request<()>, usize)>> {
    let head_len = match status {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => {
            return Err(PoolError::InvalidRequest(format!(
                "Malformed request head: {}",
                e
            )))
        }
    };

    let method = parsed
        .method
        .ok_or_else(|| PoolError::InvalidRequest("Missing method".to_string()))?;
    let path = parsed
        .path
        .ok_or_else(|| PoolError::InvalidRequest("Missing request target".to_string()))?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut builder = Request::builder().method(method).uri(path).version(version);
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }

    let request = builder
        .body(())
        .map_err(|e| PoolError::InvalidRequest(format!("Invalid request head: {}", e)))?;

    Ok(Some((request, head_len)))
}

pin_project! {
    /// Stream that yields `prefix` before reading from `inner`
    pub struct PrefixedIo<S> {
        prefix: Bytes,
        #[pin]
        inner: S,
    }
}

impl<S> PrefixedIo<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead> AsyncRead for PrefixedIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();

        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }

        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PrefixedIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_target_defaults_port() {
        let uri: Uri = "http://example.com/path".parse().unwrap();
        assert_eq!(parse_target(&uri).unwrap(), ("example.com".to_string(), 80));

        let uri: Uri = "http://[2001:db8::1]:8080/".parse().unwrap();
        assert_eq!(parse_target(&uri).unwrap(), ("2001:db8::1".to_string(), 8080));
    }

    #[test]
    fn test_parse_target_https_defaults_to_443() {
        let uri: Uri = "https://example.com/".parse().unwrap();
        assert_eq!(parse_target(&uri).unwrap(), ("example.com".to_string(), 443));
        assert!(is_tls_target(&uri));

        let uri: Uri = "https://example.com:8443/".parse().unwrap();
        assert_eq!(parse_target(&uri).unwrap(), ("example.com".to_string(), 8443));

        let uri: Uri = "http://example.com/".parse().unwrap();
        assert!(!is_tls_target(&uri));
    }

    #[test]
    fn test_parse_target_rejects_other_schemes_and_relative() {
        let uri: Uri = "ftp://example.com/".parse().unwrap();
        assert!(matches!(parse_target(&uri), Err(PoolError::InvalidRequest(_))));

        let uri: Uri = "/just/a/path".parse().unwrap();
        assert!(matches!(parse_target(&uri), Err(PoolError::InvalidRequest(_))));
    }

    #[test]
    fn test_parse_authority() {
        let authority: Authority = "example.com:8443".parse().unwrap();
        assert_eq!(parse_authority(&authority), ("example.com".to_string(), 8443));

        let authority: Authority = "[2001:db8::1]".parse().unwrap();
        assert_eq!(parse_authority(&authority), ("2001:db8::1".to_string(), 443));
    }

    #[test]
    fn test_origin_form() {
        let uri: Uri = "http://example.com/a/b?c=d".parse().unwrap();
        assert_eq!(origin_form(&uri), "/a/b?c=d");

        let uri: Uri = "http://example.com".parse().unwrap();
        assert_eq!(origin_form(&uri), "/");
    }

    #[tokio::test]
    async fn test_read_connect_head_keeps_leftover() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(
                b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nearly-bytes",
            )
            .await
            .unwrap();

        let head = read_request_head(&mut server, 64 * 1024).await.unwrap();
        assert_eq!(head.request.method(), Method::CONNECT);
        assert_eq!(head.request.version(), Version::HTTP_11);
        assert_eq!(
            head.request.uri().authority().unwrap().as_str(),
            "example.com:443"
        );
        assert_eq!(head.leftover(), Bytes::from_static(b"early-bytes"));
    }

    #[tokio::test]
    async fn test_read_head_across_partial_writes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let reader = tokio::spawn(async move { read_request_head(&mut server, 1024).await });

        client.write_all(b"GET http://example.com/ HT").await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(b"TP/1.0\r\nHost: example.com\r\n\r\n").await.unwrap();

        let head = reader.await.unwrap().unwrap();
        assert_eq!(head.request.method(), Method::GET);
        assert_eq!(head.request.version(), Version::HTTP_10);
        assert_eq!(head.request.headers()["host"], "example.com");
        assert!(head.leftover().is_empty());
    }

    #[tokio::test]
    async fn test_read_head_with_many_headers() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        let mut head = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n".to_vec();
        for i in 0..70 {
            head.extend_from_slice(format!("X-Header-{}: {}\r\n", i, i).as_bytes());
        }
        head.extend_from_slice(b"\r\n");
        client.write_all(&head).await.unwrap();

        let head = read_request_head(&mut server, 64 * 1024).await.unwrap();
        assert_eq!(head.request.headers().len(), 71);
        assert_eq!(head.request.headers()["x-header-69"], "69");
        assert_eq!(head.head_len, head.buffered.len());
    }

    #[tokio::test]
    async fn test_read_head_rejects_oversize() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        let mut head = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        head.extend(std::iter::repeat(b'a').take(4000));
        client.write_all(&head).await.unwrap();

        let err = read_request_head(&mut server, 1024).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_read_head_rejects_early_close() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(client);

        let err = read_request_head(&mut server, 1024).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_prefixed_io_replays_prefix_first() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut io = PrefixedIo::new(Bytes::from_static(b"head:"), server);

        client.write_all(b"body").await.unwrap();
        drop(client);

        let mut out = Vec::new();
        io.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"head:body");
    }
}
