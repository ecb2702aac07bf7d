use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Scrape timeout header stamped by the proxy and honored by the client.
pub const SCRAPE_TIMEOUT_HEADER: &str = "x-prometheus-scrape-timeout-seconds";

/// How much data to read for a header section before it is considered invalid.
const HEADER_SECTION_MAX_LENGTH: usize = 8192;

const READ_CHUNK: usize = 4096;

/// An HTTP request read off a scrape stream.
#[derive(Debug)]
pub struct ScrapeRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
}

impl ScrapeRequest {
    pub fn host(&self) -> Option<&str> {
        self.headers.get(HOST).and_then(|v| v.to_str().ok())
    }

    /// First non-empty path segment; both `/name/...` and `name/...` are
    /// accepted.
    pub fn process_name(&self) -> Option<&str> {
        let path = self.path.split('?').next().unwrap_or("");
        path.split('/').find(|segment| !segment.is_empty())
    }
}

/// A buffered HTTP response carried over a scrape stream.
#[derive(Debug)]
pub struct ScrapeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ScrapeResponse {
    /// Scrape-level failure reported to the scraper with the reason as body.
    pub fn error(reason: impl Into<String>) -> Self {
        ScrapeResponse {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            headers: HeaderMap::new(),
            body: Bytes::from(reason.into()),
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn header_map_from_httparse(headers: &[httparse::Header<'_>]) -> HeaderMap {
    HeaderMap::from_iter(headers.iter().filter_map(|h| {
        let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
        let value = HeaderValue::from_bytes(h.value).ok()?;
        Some((name, value))
    }))
}

async fn fill<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut chunk = [0u8; READ_CHUNK];
    let n = reader.read(&mut chunk).await?;
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

fn parse_request(buf: &[u8]) -> Result<Option<(usize, ScrapeRequest)>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf).context("invalid http request")? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(header_len) => {
            let method: Method = req
                .method
                .context("missing http method")?
                .parse()
                .context("invalid http method")?;
            let path = req.path.context("missing request target")?.to_string();
            let headers = header_map_from_httparse(req.headers);
            Ok(Some((
                header_len,
                ScrapeRequest {
                    method,
                    path,
                    headers,
                },
            )))
        }
    }
}

/// Reads the next request off a scrape stream. `buf` persists across calls
/// so bytes read past a header section are never lost.
pub async fn read_request<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<ScrapeRequest>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        if let Some((consumed, request)) = parse_request(buf)? {
            if content_length(&request.headers)?.unwrap_or(0) != 0 {
                bail!("unexpected body on a scrape request");
            }
            buf.drain(..consumed);
            return Ok(request);
        }
        if buf.len() > HEADER_SECTION_MAX_LENGTH {
            bail!("request header section too large");
        }
        let n = fill(reader, buf).await.context("scrape stream read failed")?;
        if n == 0 {
            if buf.is_empty() {
                bail!("scrape stream closed");
            }
            bail!("scrape stream closed mid-request");
        }
    }
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>> {
    match headers.get(CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => {
            let parsed = value
                .to_str()
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok())
                .context("invalid content-length")?;
            Ok(Some(parsed))
        }
    }
}

fn parse_response_head(buf: &[u8]) -> Result<Option<(usize, StatusCode, HeaderMap)>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut rsp = httparse::Response::new(&mut headers);
    match rsp.parse(buf).context("invalid http response")? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(header_len) => {
            let code = rsp.code.context("missing response status code")?;
            let status = StatusCode::from_u16(code).context("invalid response status code")?;
            Ok(Some((header_len, status, header_map_from_httparse(rsp.headers))))
        }
    }
}

/// Reads one response off a scrape stream. The body must be framed with a
/// `Content-Length`; the client side always writes one.
pub async fn read_response<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<ScrapeResponse>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let (status, headers) = loop {
        if let Some((consumed, status, headers)) = parse_response_head(buf)? {
            buf.drain(..consumed);
            break (status, headers);
        }
        if buf.len() > HEADER_SECTION_MAX_LENGTH {
            bail!("response header section too large");
        }
        let n = fill(reader, buf).await.context("scrape stream read failed")?;
        if n == 0 {
            bail!("scrape stream closed mid-response");
        }
    };

    let length = content_length(&headers)?.context("scrape response lacks a content-length")?;
    while buf.len() < length {
        let n = fill(reader, buf).await.context("scrape stream read failed")?;
        if n == 0 {
            bail!("scrape stream closed mid-body");
        }
    }
    let body: Vec<u8> = buf.drain(..length).collect();
    Ok(ScrapeResponse {
        status,
        headers,
        body: Bytes::from(body),
    })
}

/// Writes a GET-style request head; scrape requests carry no body.
pub async fn write_request_head<W>(
    writer: &mut W,
    method: &Method,
    path_and_query: &str,
    host: &str,
    headers: &HeaderMap,
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut head = format!("{method} {path_and_query} HTTP/1.1\r\nhost: {host}\r\n");
    for (name, value) in headers {
        if name == HOST || name == CONTENT_LENGTH || is_hop_by_hop(name) {
            continue;
        }
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(String::from_utf8_lossy(value.as_bytes()).as_ref());
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes a buffered response, re-framed with an explicit `Content-Length`
/// so the stream stays reusable for the next exchange.
pub async fn write_response<W>(writer: &mut W, response: &ScrapeResponse) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let reason = response.status.canonical_reason().unwrap_or("");
    let mut head = format!("HTTP/1.1 {} {}\r\n", response.status.as_u16(), reason);
    for (name, value) in &response.headers {
        if name == CONTENT_LENGTH || is_hop_by_hop(name) {
            continue;
        }
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(String::from_utf8_lossy(value.as_bytes()).as_ref());
        head.push_str("\r\n");
    }
    head.push_str(&format!("content-length: {}\r\n\r\n", response.body.len()));
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&response.body).await?;
    writer.flush().await?;
    Ok(())
}

fn format_seconds(seconds: f64) -> String {
    if seconds == seconds.trunc() {
        format!("{}", seconds as i64)
    } else {
        format!("{seconds}")
    }
}

/// Stamps or clamps the scrape timeout header: absent or unparseable values
/// become the default, values above the maximum are clamped down, negative
/// values are clamped to zero.
pub fn ensure_timeout_header(headers: &mut HeaderMap, default: Duration, max: Duration) {
    let requested = headers
        .get(SCRAPE_TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|s| s.is_finite());
    let seconds = match requested {
        None => default.as_secs_f64(),
        Some(s) if s < 0.0 => 0.0,
        Some(s) if s > max.as_secs_f64() => max.as_secs_f64(),
        Some(s) => s,
    };
    let value = HeaderValue::from_str(&format_seconds(seconds)).unwrap_or(HeaderValue::from(0));
    headers.insert(SCRAPE_TIMEOUT_HEADER, value);
}

/// Reads the scrape timeout the proxy stamped on the request.
pub fn timeout_from_headers(headers: &HeaderMap) -> Result<Duration> {
    let seconds = headers
        .get(SCRAPE_TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .context("missing or invalid scrape timeout header")?;
    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::executor::block_on;

    fn headers_with_timeout(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SCRAPE_TIMEOUT_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn timeout_value(headers: &HeaderMap) -> &str {
        headers
            .get(SCRAPE_TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap()
    }

    #[test]
    fn absent_timeout_gets_the_default() {
        let mut headers = HeaderMap::new();
        ensure_timeout_header(&mut headers, Duration::from_secs(15), Duration::from_secs(300));
        assert_eq!(timeout_value(&headers), "15");
        assert_eq!(
            timeout_from_headers(&headers).unwrap(),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn unparseable_timeout_gets_the_default() {
        let mut headers = headers_with_timeout("soon");
        ensure_timeout_header(&mut headers, Duration::from_secs(15), Duration::from_secs(300));
        assert_eq!(timeout_value(&headers), "15");
    }

    #[test]
    fn oversized_timeout_is_clamped() {
        let mut headers = headers_with_timeout("900");
        ensure_timeout_header(&mut headers, Duration::from_secs(15), Duration::from_secs(300));
        assert_eq!(timeout_value(&headers), "300");
    }

    #[test]
    fn negative_timeout_is_clamped_to_zero() {
        let mut headers = headers_with_timeout("-3");
        ensure_timeout_header(&mut headers, Duration::from_secs(15), Duration::from_secs(300));
        assert_eq!(timeout_value(&headers), "0");
    }

    #[test]
    fn in_range_timeout_is_kept() {
        let mut headers = headers_with_timeout("30.5");
        ensure_timeout_header(&mut headers, Duration::from_secs(15), Duration::from_secs(300));
        assert_eq!(timeout_value(&headers), "30.5");
        assert_eq!(
            timeout_from_headers(&headers).unwrap(),
            Duration::from_secs_f64(30.5)
        );
    }

    #[test]
    fn request_roundtrip() {
        block_on(async {
            let mut headers = HeaderMap::new();
            headers.insert(SCRAPE_TIMEOUT_HEADER, HeaderValue::from_static("15"));
            let mut wire = Vec::new();
            write_request_head(&mut wire, &Method::GET, "/cpu/", "node-a", &headers)
                .await
                .unwrap();

            let mut buf = Vec::new();
            let request = read_request(&mut wire.as_slice(), &mut buf).await.unwrap();
            assert_eq!(request.method, Method::GET);
            assert_eq!(request.path, "/cpu/");
            assert_eq!(request.host(), Some("node-a"));
            assert_eq!(request.process_name(), Some("cpu"));
            assert_eq!(timeout_value(&request.headers), "15");
            assert!(buf.is_empty());
        });
    }

    #[test]
    fn process_name_accepts_both_path_forms() {
        let request = |path: &str| ScrapeRequest {
            method: Method::GET,
            path: path.to_string(),
            headers: HeaderMap::new(),
        };
        assert_eq!(request("/cpu/metrics").process_name(), Some("cpu"));
        assert_eq!(request("cpu/metrics").process_name(), Some("cpu"));
        assert_eq!(request("/cpu").process_name(), Some("cpu"));
        assert_eq!(request("/cpu?x=1").process_name(), Some("cpu"));
        assert_eq!(request("/").process_name(), None);
    }

    #[test]
    fn response_roundtrip() {
        block_on(async {
            let mut headers = HeaderMap::new();
            headers.insert("content-type", HeaderValue::from_static("text/plain"));
            let response = ScrapeResponse {
                status: StatusCode::OK,
                headers,
                body: Bytes::from_static(b"up 1\n"),
            };
            let mut wire = Vec::new();
            write_response(&mut wire, &response).await.unwrap();

            let mut buf = Vec::new();
            let back = read_response(&mut wire.as_slice(), &mut buf).await.unwrap();
            assert_eq!(back.status, StatusCode::OK);
            assert_eq!(back.body, Bytes::from_static(b"up 1\n"));
            assert_eq!(
                back.headers.get("content-type").unwrap(),
                HeaderValue::from_static("text/plain")
            );
        });
    }

    #[test]
    fn two_responses_back_to_back_are_separated() {
        block_on(async {
            let first = ScrapeResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"one"),
            };
            let second = ScrapeResponse::error("nope");
            let mut wire = Vec::new();
            write_response(&mut wire, &first).await.unwrap();
            write_response(&mut wire, &second).await.unwrap();

            let mut reader = wire.as_slice();
            let mut buf = Vec::new();
            let a = read_response(&mut reader, &mut buf).await.unwrap();
            let b = read_response(&mut reader, &mut buf).await.unwrap();
            assert_eq!(a.body, Bytes::from_static(b"one"));
            assert_eq!(b.status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(b.body, Bytes::from_static(b"nope"));
        });
    }

    #[test]
    fn response_without_content_length_is_rejected() {
        block_on(async {
            let wire = b"HTTP/1.1 200 OK\r\n\r\nbody".to_vec();
            let mut buf = Vec::new();
            let err = read_response(&mut wire.as_slice(), &mut buf)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("content-length"));
        });
    }
}
