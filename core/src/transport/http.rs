// HTTP-like framing — request/response line, headers, Content-Length body
//
// Only what the overlay needs: one POST per envelope, keep-alive
// connections and a `session` cookie. The header block is capped at
// MAX_HEADER_SIZE; callers bound the whole read with a timeout.

use super::TransportError;
use crate::message::MAX_ENVELOPE_SIZE;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum size of the request/status line plus headers
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Maximum body: one envelope plus cipher padding and IVs
pub const MAX_BODY_SIZE: usize = MAX_ENVELOPE_SIZE + 64 * 1024;

pub const HTTP_VERSION: &str = "HTTP/1.1";
pub const CONTENT_TYPE: &str = "application/octet-stream";
pub const SESSION_COOKIE: &str = "session";

type Headers = Vec<(String, String)>;

fn find_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn put_header(headers: &mut Headers, name: &str, value: &str) {
    headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    headers.push((name.to_string(), value.to_string()));
}

/// Value of `name` in a `k=v; k2=v2` list.
fn cookie_param<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

fn keep_alive(headers: &Headers, version: &str) -> bool {
    match find_header(headers, "Connection") {
        Some(value) if value.eq_ignore_ascii_case("close") => false,
        Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
        _ => version.eq_ignore_ascii_case(HTTP_VERSION),
    }
}

fn serialize(start_line: &str, headers: &Headers, body: &[u8]) -> Vec<u8> {
    let mut head = String::with_capacity(128);
    head.push_str(start_line);
    head.push_str("\r\n");
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// Read the start line and headers. `None` on a clean EOF before any byte.
async fn read_head<R>(reader: &mut R) -> Result<Option<(String, Headers, usize)>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut start_line: Option<String> = None;
    let mut headers = Headers::new();
    let mut consumed = 0usize;

    loop {
        let mut line = Vec::new();
        let remaining = (MAX_HEADER_SIZE - consumed) as u64;
        let n = (&mut *reader)
            .take(remaining)
            .read_until(b'\n', &mut line)
            .await?;
        consumed += n;

        if n == 0 && consumed == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            if consumed >= MAX_HEADER_SIZE {
                return Err(TransportError::HeaderTooLarge(consumed));
            }
            return Err(TransportError::Malformed("unexpected end of header".into()));
        }

        let text = std::str::from_utf8(&line)
            .map_err(|_| TransportError::Malformed("header is not UTF-8".into()))?
            .trim_end_matches(&['\r', '\n'][..]);

        if text.is_empty() {
            match start_line {
                Some(start) => return Ok(Some((start, headers, consumed))),
                None => continue,
            }
        }

        if start_line.is_none() {
            start_line = Some(text.to_string());
            continue;
        }

        let (name, value) = text
            .split_once(':')
            .ok_or_else(|| TransportError::Malformed(format!("bad header line {:?}", text)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
}

async fn read_body<R>(
    reader: &mut R,
    headers: &Headers,
    max_body: usize,
) -> Result<Vec<u8>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let length = match find_header(headers, "Content-Length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| TransportError::Malformed(format!("bad Content-Length {:?}", value)))?,
        None => 0,
    };
    if length > max_body {
        return Err(TransportError::BodyTooLarge(length));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => TransportError::Closed,
        _ => TransportError::Io(e),
    })?;
    Ok(body)
}

// ============================================================================
// REQUEST
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub resource: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Envelope POST with the default headers.
    pub fn post(resource: &str, body: Vec<u8>) -> Self {
        let mut request = Self {
            method: "POST".to_string(),
            resource: resource.to_string(),
            version: HTTP_VERSION.to_string(),
            headers: Vec::new(),
            body,
        };
        request.set_header("Content-Type", CONTENT_TYPE);
        request.set_header("Connection", "keep-alive");
        request
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        put_header(&mut self.headers, name, value);
    }

    /// Session id carried in the `Cookie` header.
    pub fn session(&self) -> Option<&str> {
        self.header("Cookie")
            .and_then(|cookies| cookie_param(cookies, SESSION_COOKIE))
    }

    pub fn set_session(&mut self, session_id: &str) {
        self.set_header("Cookie", &format!("{}={}", SESSION_COOKIE, session_id));
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(&self.headers, &self.version)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let start = format!("{} {} {}", self.method, self.resource, self.version);
        serialize(&start, &self.headers, &self.body)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
    ) -> Result<usize, TransportError> {
        let bytes = self.to_bytes();
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(bytes.len())
    }

    /// Read one request. Returns the request and its size on the wire,
    /// or `None` when the peer closed the connection between requests.
    pub async fn read_from<R>(
        reader: &mut R,
        max_body: usize,
    ) -> Result<Option<(Self, usize)>, TransportError>
    where
        R: AsyncBufRead + Unpin,
    {
        let Some((start, headers, head_len)) = read_head(reader).await? else {
            return Ok(None);
        };

        let mut parts = start.split_whitespace();
        let (Some(method), Some(resource), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TransportError::Malformed(format!("bad request line {:?}", start)));
        };
        if !version.starts_with("HTTP/") {
            return Err(TransportError::Malformed(format!("bad version {:?}", version)));
        }

        let body = read_body(reader, &headers, max_body).await?;
        let size = head_len + body.len();
        Ok(Some((
            Self {
                method: method.to_string(),
                resource: resource.to_string(),
                version: version.to_string(),
                headers,
                body,
            },
            size,
        )))
    }
}

// ============================================================================
// RESPONSE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, reason: &str, body: Vec<u8>) -> Self {
        let mut response = Self {
            version: HTTP_VERSION.to_string(),
            status,
            reason: reason.to_string(),
            headers: Vec::new(),
            body,
        };
        response.set_header("Content-Type", CONTENT_TYPE);
        response.set_header("Connection", "keep-alive");
        response
    }

    pub fn ok(body: Vec<u8>) -> Self {
        Self::new(200, "OK", body)
    }

    /// Empty rejection; the connection closes after it.
    pub fn bad_request() -> Self {
        let mut response = Self::new(400, "Bad Request", Vec::new());
        response.set_header("Connection", "close");
        response
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        put_header(&mut self.headers, name, value);
    }

    /// Session id from `Set-Cookie`.
    pub fn session(&self) -> Option<&str> {
        self.header("Set-Cookie")
            .and_then(|cookie| cookie_param(cookie, SESSION_COOKIE))
    }

    pub fn set_session(&mut self, session_id: &str) {
        self.set_header(
            "Set-Cookie",
            &format!("{}={}; HttpOnly", SESSION_COOKIE, session_id),
        );
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(&self.headers, &self.version)
    }

    pub fn close_connection(&mut self) {
        self.set_header("Connection", "close");
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let start = format!("{} {} {}", self.version, self.status, self.reason);
        serialize(&start, &self.headers, &self.body)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
    ) -> Result<usize, TransportError> {
        let bytes = self.to_bytes();
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(bytes.len())
    }

    pub async fn read_from<R>(reader: &mut R, max_body: usize) -> Result<(Self, usize), TransportError>
    where
        R: AsyncBufRead + Unpin,
    {
        let (start, headers, head_len) = read_head(reader).await?.ok_or(TransportError::Closed)?;

        let mut parts = start.splitn(3, ' ');
        let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
            return Err(TransportError::Malformed(format!("bad status line {:?}", start)));
        };
        let status = status
            .parse::<u16>()
            .map_err(|_| TransportError::Malformed(format!("bad status {:?}", status)))?;
        let reason = parts.next().unwrap_or_default().to_string();

        let body = read_body(reader, &headers, max_body).await?;
        let size = head_len + body.len();
        Ok((
            Self {
                version: version.to_string(),
                status,
                reason,
                headers,
                body,
            },
            size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_request_roundtrip() {
        let mut request = HttpRequest::post("/", b"envelope".to_vec());
        request.set_session("abc123");
        let bytes = request.to_bytes();

        let mut reader = BufReader::new(bytes.as_slice());
        let (parsed, size) = HttpRequest::read_from(&mut reader, MAX_BODY_SIZE)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(size, bytes.len());
        assert_eq!(parsed.method, "POST");
        assert_eq!(parsed.body, b"envelope");
        assert_eq!(parsed.session(), Some("abc123"));
        assert_eq!(parsed.header("content-type"), Some(CONTENT_TYPE));
        assert!(parsed.keep_alive());
    }

    #[tokio::test]
    async fn test_response_roundtrip() {
        let mut response = HttpResponse::ok(vec![1, 2, 3]);
        response.set_session("s-1");
        let bytes = response.to_bytes();

        let mut reader = BufReader::new(bytes.as_slice());
        let (parsed, _) = HttpResponse::read_from(&mut reader, MAX_BODY_SIZE).await.unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.reason, "OK");
        assert_eq!(parsed.body, vec![1, 2, 3]);
        assert_eq!(parsed.session(), Some("s-1"));
    }

    #[tokio::test]
    async fn test_bad_request_is_empty_and_closes() {
        let response = HttpResponse::bad_request();
        assert!(response.body.is_empty());
        assert!(!response.keep_alive());
        assert!(!response.is_success());

        let bytes = response.to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(HttpRequest::read_from(&mut reader, MAX_BODY_SIZE)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_header_limit() {
        let mut raw = b"POST / HTTP/1.1\r\nX-Padding: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEADER_SIZE));
        raw.extend_from_slice(b"\r\n\r\n");

        let mut reader = BufReader::new(raw.as_slice());
        let result = HttpRequest::read_from(&mut reader, MAX_BODY_SIZE).await;
        assert!(matches!(result, Err(TransportError::HeaderTooLarge(_))));
    }

    #[tokio::test]
    async fn test_body_limit() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let result = HttpRequest::read_from(&mut reader, 10).await;
        assert!(matches!(result, Err(TransportError::BodyTooLarge(100))));
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        let mut reader = BufReader::new(&raw[..]);
        let result = HttpRequest::read_from(&mut reader, MAX_BODY_SIZE).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_malformed_lines() {
        let raw = b"GARBAGE\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(matches!(
            HttpRequest::read_from(&mut reader, MAX_BODY_SIZE).await,
            Err(TransportError::Malformed(_))
        ));

        let raw = b"POST / HTTP/1.1\r\nNoColonHere\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(matches!(
            HttpRequest::read_from(&mut reader, MAX_BODY_SIZE).await,
            Err(TransportError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_pipelined_requests() {
        let mut raw = HttpRequest::post("/", b"one".to_vec()).to_bytes();
        raw.extend(HttpRequest::post("/", b"two".to_vec()).to_bytes());

        let mut reader = BufReader::new(raw.as_slice());
        let (first, _) = HttpRequest::read_from(&mut reader, MAX_BODY_SIZE).await.unwrap().unwrap();
        let (second, _) = HttpRequest::read_from(&mut reader, MAX_BODY_SIZE).await.unwrap().unwrap();
        assert_eq!(first.body, b"one");
        assert_eq!(second.body, b"two");
        assert!(HttpRequest::read_from(&mut reader, MAX_BODY_SIZE).await.unwrap().is_none());
    }

    #[test]
    fn test_cookie_parsing() {
        assert_eq!(cookie_param("session=abc", "session"), Some("abc"));
        assert_eq!(cookie_param("theme=dark; session=xyz", "session"), Some("xyz"));
        assert_eq!(cookie_param("theme=dark", "session"), None);
        assert_eq!(cookie_param("session=", "session"), None);
    }
}
