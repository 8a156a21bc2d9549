use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use proxywoman_rules::{InterceptedRequest, InterceptedResponse, UpstreamRoute};
use proxywoman_tls::upstream_client_config;

use crate::error::ProxyError;
use crate::http1::{decode_response_head, read_body, serialize_request, MessageStream};

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Serves already-buffered bytes before reading from the inner stream.
/// Used wherever a parser may have read past a protocol boundary and the
/// remainder belongs to the next layer.
pub(crate) struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub(crate) fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            self.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Sends the shaped request to its origin (directly or through the parent
/// proxy the pipeline selected) and reads the full response.
pub(crate) async fn send_request(
    request: &InterceptedRequest,
    timeout: Duration,
    max_head_bytes: usize,
) -> Result<InterceptedResponse, ProxyError> {
    tokio::time::timeout(timeout, dispatch(request, max_head_bytes))
        .await
        .map_err(|_| ProxyError::OriginTimeout)?
}

async fn dispatch(
    request: &InterceptedRequest,
    max_head_bytes: usize,
) -> Result<InterceptedResponse, ProxyError> {
    let scheme = request.url.scheme().to_string();
    let host = request
        .url
        .host_str()
        .ok_or_else(|| ProxyError::InvalidRequest("request URL has no host".to_string()))?
        .to_string();
    let port = request
        .url
        .port_or_known_default()
        .unwrap_or(if scheme == "https" { 443 } else { 80 });

    let (stream, absolute_form) = match &request.upstream {
        Some(route) => {
            let stream = connect_via_parent(route, &scheme, &host, port, max_head_bytes).await?;
            (stream, scheme == "http")
        }
        None => (connect_direct(&scheme, &host, port).await?, false),
    };

    let mut conn = MessageStream::new(stream);
    conn.write_all(&serialize_request(request, absolute_form))
        .await?;
    read_response(&mut conn, &request.method, max_head_bytes).await
}

async fn connect_direct(
    scheme: &str,
    host: &str,
    port: u16,
) -> Result<Box<dyn AsyncStream>, ProxyError> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|error| ProxyError::OriginUnreachable(format!("{host}:{port}: {error}")))?;
    if scheme == "https" {
        Ok(Box::new(tls_connect(host, tcp).await?))
    } else {
        Ok(Box::new(tcp))
    }
}

async fn connect_via_parent(
    route: &UpstreamRoute,
    scheme: &str,
    host: &str,
    port: u16,
    max_head_bytes: usize,
) -> Result<Box<dyn AsyncStream>, ProxyError> {
    let parent_host = route
        .proxy_url
        .host_str()
        .ok_or_else(|| ProxyError::UpstreamProxy("proxy URL has no host".to_string()))?;
    let parent_port = route.proxy_url.port_or_known_default().unwrap_or(8080);
    let tcp = TcpStream::connect((parent_host, parent_port))
        .await
        .map_err(|error| {
            ProxyError::UpstreamProxy(format!("{parent_host}:{parent_port}: {error}"))
        })?;

    if scheme != "https" {
        return Ok(Box::new(tcp));
    }

    // TLS origins tunnel through the parent with CONNECT first.
    let mut connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some(authorization) = &route.authorization {
        connect.push_str(&format!("Proxy-Authorization: {authorization}\r\n"));
    }
    connect.push_str("\r\n");

    let mut conn = MessageStream::new(tcp);
    conn.write_all(connect.as_bytes()).await?;
    let head = conn.read_head(max_head_bytes).await?.ok_or_else(|| {
        ProxyError::UpstreamProxy("parent proxy closed during CONNECT".to_string())
    })?;
    let parsed = decode_response_head(&head, "CONNECT")
        .map_err(|error| ProxyError::UpstreamProxy(format!("bad CONNECT response: {error}")))?;
    if !(200..300).contains(&parsed.status_code) {
        return Err(ProxyError::UpstreamProxy(format!(
            "parent proxy refused CONNECT with status {}",
            parsed.status_code
        )));
    }

    let (tcp, leftover) = conn.into_parts();
    let tunnel = PrefixedStream::new(leftover, tcp);
    Ok(Box::new(tls_connect_stream(host, tunnel).await?))
}

async fn tls_connect(
    host: &str,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ProxyError> {
    tls_connect_stream(host, tcp).await
}

async fn tls_connect_stream<S: AsyncRead + AsyncWrite + Unpin>(
    host: &str,
    stream: S,
) -> Result<tokio_rustls::client::TlsStream<S>, ProxyError> {
    let connector = TlsConnector::from(upstream_client_config());
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|error| ProxyError::InvalidRequest(format!("invalid server name: {error}")))?;
    connector
        .connect(server_name, stream)
        .await
        .map_err(|error| ProxyError::OriginUnreachable(format!("TLS to {host} failed: {error}")))
}

async fn read_response<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut MessageStream<S>,
    request_method: &str,
    max_head_bytes: usize,
) -> Result<InterceptedResponse, ProxyError> {
    let head = conn.read_head(max_head_bytes).await?.ok_or_else(|| {
        ProxyError::OriginUnreachable("origin closed before response headers".to_string())
    })?;
    let parsed = decode_response_head(&head, request_method)?;
    let body = read_body(conn, parsed.framing, max_head_bytes).await?;

    let status = if parsed.reason_phrase.is_empty() {
        parsed.status_code.to_string()
    } else {
        format!("{} {}", parsed.status_code, parsed.reason_phrase)
    };
    Ok(InterceptedResponse {
        status_code: parsed.status_code,
        status,
        headers: parsed.headers,
        body,
    })
}
