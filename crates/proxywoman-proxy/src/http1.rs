use std::collections::HashMap;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use proxywoman_rules::{InterceptedRequest, InterceptedResponse};

const READ_CHUNK_BYTES: usize = 16 * 1024;
const HEAD_BOUNDARY: &[u8] = b"\r\n\r\n";
const LINE_BOUNDARY: &[u8] = b"\r\n";

/// Per RFC 7230 §6.1 these never travel past a hop.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "proxy-authorization",
    "proxy-authenticate",
    "upgrade",
];

fn protocol_error(detail: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail.into())
}

/// A stream plus whatever bytes were read past the last message boundary.
/// Both proxy faces and the outbound client speak through this.
pub(crate) struct MessageStream<S> {
    pub(crate) stream: S,
    pub(crate) pending: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MessageStream<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    pub(crate) fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.pending)
    }

    /// Buffers up to the blank line that ends a message head and returns the
    /// head, terminator included. `None` means the peer closed cleanly
    /// between messages.
    pub(crate) async fn read_head(&mut self, cap: usize) -> io::Result<Option<Vec<u8>>> {
        self.take_delimited(HEAD_BOUNDARY, cap).await
    }

    /// One CRLF-terminated line; chunk sizes and trailers come through here.
    pub(crate) async fn read_line(&mut self, cap: usize) -> io::Result<Option<Vec<u8>>> {
        self.take_delimited(LINE_BOUNDARY, cap).await
    }

    async fn take_delimited(
        &mut self,
        boundary: &[u8],
        cap: usize,
    ) -> io::Result<Option<Vec<u8>>> {
        // Bytes before `scanned` are known not to start the boundary.
        let mut scanned = 0;
        loop {
            if let Some(at) = boundary_position(&self.pending, boundary, scanned) {
                let taken: Vec<u8> = self.pending.drain(..at + boundary.len()).collect();
                return Ok(Some(taken));
            }
            scanned = self
                .pending
                .len()
                .saturating_sub(boundary.len().saturating_sub(1));

            if self.pending.len() > cap {
                return Err(protocol_error("message head grew past the configured cap"));
            }
            let mut chunk = [0_u8; READ_CHUNK_BYTES];
            let count = self.stream.read(&mut chunk).await?;
            if count == 0 {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed inside a message head",
                ));
            }
            self.pending.extend_from_slice(&chunk[..count]);
        }
    }

    pub(crate) async fn read_exact_bytes(&mut self, count: usize) -> io::Result<Vec<u8>> {
        while self.pending.len() < count {
            let mut chunk = [0_u8; READ_CHUNK_BYTES];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed before the declared body length arrived",
                ));
            }
            self.pending.extend_from_slice(&chunk[..read]);
        }
        Ok(self.pending.drain(..count).collect())
    }

    /// Drains the stream to EOF; used for close-delimited response bodies.
    pub(crate) async fn read_to_close(&mut self) -> io::Result<Vec<u8>> {
        let mut body = std::mem::take(&mut self.pending);
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        loop {
            let read = match self.stream.read(&mut chunk).await {
                Ok(read) => read,
                Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => 0,
                Err(error) => return Err(error),
            };
            if read == 0 {
                return Ok(body);
            }
            body.extend_from_slice(&chunk[..read]);
        }
    }

    pub(crate) async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }
}

fn boundary_position(buffer: &[u8], boundary: &[u8], from: usize) -> Option<usize> {
    if buffer.len() < boundary.len() {
        return None;
    }
    (from..=buffer.len() - boundary.len())
        .find(|&index| buffer[index..index + boundary.len()] == *boundary)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HttpVersion {
    Http10,
    Http11,
}

/// How the body after a head is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    Empty,
    Sized(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) version: HttpVersion,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) framing: BodyFraming,
    pub(crate) wants_close: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub(crate) status_code: u16,
    pub(crate) reason_phrase: String,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) framing: BodyFraming,
    pub(crate) wants_close: bool,
}

fn head_text(raw: &[u8]) -> io::Result<&str> {
    std::str::from_utf8(raw).map_err(|_| protocol_error("message head is not valid UTF-8"))
}

pub(crate) fn decode_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let mut lines = head_text(raw)?.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    // Request-line: method SP target SP version, single spaces, no more.
    let malformed = || protocol_error(format!("malformed request line {request_line:?}"));
    let (method, rest) = request_line.split_once(' ').ok_or_else(malformed)?;
    let (target, version_text) = rest.split_once(' ').ok_or_else(malformed)?;
    if method.is_empty() || target.is_empty() || version_text.contains(' ') {
        return Err(malformed());
    }
    let version = http_version(version_text)?;

    let headers = collapse_header_bag(lines)?;
    let framing = request_body_framing(&headers)?;
    let wants_close = wants_close(version, &headers);

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        framing,
        wants_close,
    })
}

pub(crate) fn decode_response_head(raw: &[u8], request_method: &str) -> io::Result<ResponseHead> {
    let mut lines = head_text(raw)?.split("\r\n");
    let status_line = lines.next().unwrap_or_default();

    let (version_text, rest) = status_line
        .split_once(' ')
        .ok_or_else(|| protocol_error(format!("malformed status line {status_line:?}")))?;
    let version = http_version(version_text)?;
    // The reason phrase is free text and may itself contain spaces.
    let (code_text, reason_phrase) = match rest.split_once(' ') {
        Some((code, reason)) => (code, reason),
        None => (rest, ""),
    };
    let status_code = code_text
        .parse::<u16>()
        .map_err(|_| protocol_error(format!("status code {code_text:?} is not a number")))?;

    let headers = collapse_header_bag(lines)?;
    let framing = response_body_framing(&headers, request_method, status_code)?;
    let wants_close = wants_close(version, &headers) || framing == BodyFraming::UntilClose;

    Ok(ResponseHead {
        status_code,
        reason_phrase: reason_phrase.trim().to_string(),
        headers,
        framing,
        wants_close,
    })
}

fn http_version(text: &str) -> io::Result<HttpVersion> {
    // The proxy speaks HTTP/1.1 on both faces and tolerates 1.0 peers.
    match text.strip_prefix("HTTP/1.") {
        Some("0") => Ok(HttpVersion::Http10),
        Some("1") => Ok(HttpVersion::Http11),
        _ => Err(protocol_error(format!(
            "cannot speak protocol version {text:?}"
        ))),
    }
}

/// Folds the header lines into the name -> first-value bag the flow model
/// uses; repeats of a name keep the value seen first.
fn collapse_header_bag<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> io::Result<HashMap<String, String>> {
    let mut bag = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| protocol_error(format!("header field {line:?} has no colon")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(protocol_error("header field with an empty name"));
        }
        if header_value(&bag, name).is_none() {
            bag.insert(name.to_string(), value.trim().to_string());
        }
    }
    Ok(bag)
}

pub(crate) fn header_value<'a>(
    headers: &'a HashMap<String, String>,
    name: &str,
) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn declared_length(headers: &HashMap<String, String>) -> io::Result<Option<u64>> {
    match header_value(headers, "content-length") {
        None => Ok(None),
        Some(text) => text
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| protocol_error(format!("content-length {text:?} is not a number"))),
    }
}

fn is_chunked(headers: &HashMap<String, String>) -> io::Result<bool> {
    match header_value(headers, "transfer-encoding") {
        None => Ok(false),
        Some(value) if value.to_ascii_lowercase().contains("chunked") => Ok(true),
        Some(value) => Err(protocol_error(format!(
            "cannot de-frame transfer encoding {value:?}"
        ))),
    }
}

fn request_body_framing(headers: &HashMap<String, String>) -> io::Result<BodyFraming> {
    if is_chunked(headers)? {
        return Ok(BodyFraming::Chunked);
    }
    Ok(match declared_length(headers)? {
        None | Some(0) => BodyFraming::Empty,
        Some(length) => BodyFraming::Sized(length),
    })
}

fn response_body_framing(
    headers: &HashMap<String, String>,
    request_method: &str,
    status_code: u16,
) -> io::Result<BodyFraming> {
    let bodyless = request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status_code)
        || matches!(status_code, 204 | 304);
    if bodyless {
        return Ok(BodyFraming::Empty);
    }
    if is_chunked(headers)? {
        return Ok(BodyFraming::Chunked);
    }
    Ok(match declared_length(headers)? {
        Some(0) => BodyFraming::Empty,
        Some(length) => BodyFraming::Sized(length),
        None => BodyFraming::UntilClose,
    })
}

fn wants_close(version: HttpVersion, headers: &HashMap<String, String>) -> bool {
    match header_value(headers, "connection") {
        Some(value) => value.to_ascii_lowercase().contains("close"),
        None => version == HttpVersion::Http10,
    }
}

/// Reads a full message body into memory, de-chunking along the way.
pub(crate) async fn read_body<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut MessageStream<S>,
    framing: BodyFraming,
    max_head_bytes: usize,
) -> io::Result<Vec<u8>> {
    match framing {
        BodyFraming::Empty => Ok(Vec::new()),
        BodyFraming::Sized(length) => conn.read_exact_bytes(length as usize).await,
        BodyFraming::UntilClose => conn.read_to_close().await,
        BodyFraming::Chunked => read_chunked_body(conn, max_head_bytes).await,
    }
}

async fn read_chunked_body<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut MessageStream<S>,
    max_head_bytes: usize,
) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let size_line = conn
            .read_line(max_head_bytes)
            .await?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed before a chunk size line",
                )
            })?;
        let size_text = std::str::from_utf8(&size_line)
            .map_err(|_| protocol_error("chunk size line is not valid UTF-8"))?
            .trim();
        // Chunk extensions after ';' are ignored.
        let size_text = size_text.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| protocol_error(format!("chunk size {size_text:?} is not hexadecimal")))?;

        if size == 0 {
            // Swallow trailers through the terminating blank line.
            loop {
                let trailer = conn.read_line(max_head_bytes).await?.ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed inside chunked trailers",
                    )
                })?;
                if trailer == LINE_BOUNDARY {
                    break;
                }
            }
            return Ok(body);
        }

        let chunk = conn.read_exact_bytes(size).await?;
        body.extend_from_slice(&chunk);
        let terminator = conn.read_exact_bytes(2).await?;
        if terminator != LINE_BOUNDARY {
            return Err(protocol_error("chunk data not followed by CRLF"));
        }
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| name.eq_ignore_ascii_case(hop))
}

/// Serializes the outbound request. Bodies are always content-length framed
/// (chunked input was de-chunked on read); hop-by-hop headers are dropped.
/// `absolute_form` is used when dialing through a parent proxy.
pub(crate) fn serialize_request(request: &InterceptedRequest, absolute_form: bool) -> Vec<u8> {
    let target = if absolute_form {
        request.url.as_str().to_string()
    } else {
        let path = request.url.path();
        match request.url.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        }
    };

    let mut head = format!("{} {} HTTP/1.1\r\n", request.method, target);
    let host_header = request.header("Host").map(str::to_string).unwrap_or_else(|| {
        let host = request.url.host_str().unwrap_or_default();
        match request.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    });
    head.push_str(&format!("Host: {host_header}\r\n"));

    for (name, value) in &request.headers {
        if is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if absolute_form {
        if let Some(route) = &request.upstream {
            if let Some(authorization) = &route.authorization {
                head.push_str(&format!("Proxy-Authorization: {authorization}\r\n"));
            }
        }
    }
    if !request.body.is_empty() || request_has_body_semantics(&request.method) {
        head.push_str(&format!("Content-Length: {}\r\n", request.body.len()));
    }
    head.push_str("Connection: keep-alive\r\n\r\n");

    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(&request.body);
    bytes
}

fn request_has_body_semantics(method: &str) -> bool {
    matches!(
        method.to_ascii_uppercase().as_str(),
        "POST" | "PUT" | "PATCH"
    )
}

/// Serializes a response toward the client. Hop-by-hop headers are dropped,
/// the body is content-length framed, and `markers` are stamped last so they
/// win over forwarded names.
pub(crate) fn serialize_response(
    response: &InterceptedResponse,
    markers: &[(String, String)],
    close: bool,
) -> Vec<u8> {
    let reason = if response.status.is_empty() {
        reason_phrase(response.status_code)
    } else {
        // Stored reasons may carry the "200 OK" shape; keep only the phrase.
        response
            .status
            .strip_prefix(&format!("{} ", response.status_code))
            .unwrap_or(&response.status)
    };

    let mut head = format!("HTTP/1.1 {} {}\r\n", response.status_code, reason);
    for (name, value) in &response.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if markers
            .iter()
            .any(|(marker, _)| marker.eq_ignore_ascii_case(name))
        {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    for (name, value) in markers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    head.push_str(if close {
        "Connection: close\r\n\r\n"
    } else {
        "Connection: keep-alive\r\n\r\n"
    });

    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(&response.body);
    bytes
}

pub(crate) fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_forward_proxy_request_line() {
        let head = decode_request_head(
            b"GET http://example.test/ping HTTP/1.1\r\nHost: example.test\r\nAccept: */*\r\n\r\n",
        )
        .expect("decode");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://example.test/ping");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(header_value(&head.headers, "host"), Some("example.test"));
        assert_eq!(head.framing, BodyFraming::Empty);
        assert!(!head.wants_close);
    }

    #[test]
    fn rejects_request_lines_with_extra_fields() {
        assert!(decode_request_head(b"GET / HTTP/1.1 junk\r\n\r\n").is_err());
        assert!(decode_request_head(b"GET /\r\n\r\n").is_err());
        assert!(decode_request_head(b"GET / SPDY/3\r\n\r\n").is_err());
    }

    #[test]
    fn collapses_repeated_headers_to_first_value() {
        let head = decode_request_head(
            b"GET / HTTP/1.1\r\nHost: a.test\r\nX-Multi: one\r\nX-Multi: two\r\n\r\n",
        )
        .expect("decode");
        assert_eq!(header_value(&head.headers, "x-multi"), Some("one"));
    }

    #[test]
    fn chunked_framing_wins_over_content_length() {
        let head = decode_request_head(
            b"POST / HTTP/1.1\r\nHost: a.test\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n",
        )
        .expect("decode");
        assert_eq!(head.framing, BodyFraming::Chunked);
    }

    #[test]
    fn response_without_length_runs_until_close() {
        let head = decode_response_head(b"HTTP/1.1 200 OK\r\nServer: stub\r\n\r\n", "GET")
            .expect("decode");
        assert_eq!(head.framing, BodyFraming::UntilClose);
        assert!(head.wants_close);
    }

    #[test]
    fn multi_word_reason_phrases_survive() {
        let head = decode_response_head(b"HTTP/1.1 505 HTTP Version Not Supported\r\n\r\n", "GET")
            .expect("decode");
        assert_eq!(head.status_code, 505);
        assert_eq!(head.reason_phrase, "HTTP Version Not Supported");
    }

    #[test]
    fn head_and_204_responses_carry_no_body() {
        let for_head = decode_response_head(
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n",
            "HEAD",
        )
        .expect("decode");
        assert_eq!(for_head.framing, BodyFraming::Empty);

        let no_content =
            decode_response_head(b"HTTP/1.1 204 No Content\r\n\r\n", "GET").expect("decode");
        assert_eq!(no_content.framing, BodyFraming::Empty);
    }

    #[tokio::test]
    async fn reads_chunked_body_and_discards_trailers() {
        let wire = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\nleftover";
        let (client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(wire).await.expect("write wire");
        });

        let mut conn = MessageStream::new(client);
        let body = read_body(&mut conn, BodyFraming::Chunked, 8 * 1024)
            .await
            .expect("read chunked");
        assert_eq!(body, b"Wikipedia");
        assert_eq!(conn.pending, b"leftover");
    }

    #[test]
    fn serialized_request_strips_hop_by_hop_and_reframes() {
        let mut request = InterceptedRequest::new(
            "POST".to_string(),
            "http://example.test/submit?x=1".parse().expect("url"),
            HashMap::from([
                ("Connection".to_string(), "keep-alive".to_string()),
                ("Proxy-Authorization".to_string(), "Basic zzz".to_string()),
                ("Accept".to_string(), "*/*".to_string()),
                ("Content-Length".to_string(), "999".to_string()),
            ]),
            b"hello".to_vec(),
        );
        request.set_header("Host", "example.test".to_string());

        let wire = String::from_utf8(serialize_request(&request, false)).expect("utf8");
        assert!(wire.starts_with("POST /submit?x=1 HTTP/1.1\r\n"));
        assert!(wire.contains("Host: example.test\r\n"));
        assert!(wire.contains("Accept: */*\r\n"));
        assert!(wire.contains("Content-Length: 5\r\n"));
        assert!(!wire.contains("Proxy-Authorization"));
        assert!(!wire.contains("Content-Length: 999"));
        assert!(wire.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn serialized_response_applies_markers_last() {
        let response = InterceptedResponse::new(403, "Forbidden")
            .with_header("Content-Type", "text/html")
            .with_header("Transfer-Encoding", "chunked")
            .with_body(b"blocked".to_vec());
        let markers = vec![("X-ProxyWoman-Blocked".to_string(), "true".to_string())];

        let wire = String::from_utf8(serialize_response(&response, &markers, true)).expect("utf8");
        assert!(wire.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(wire.contains("X-ProxyWoman-Blocked: true\r\n"));
        assert!(wire.contains("Content-Length: 7\r\n"));
        assert!(wire.contains("Connection: close\r\n"));
        assert!(!wire.contains("Transfer-Encoding"));
    }
}
