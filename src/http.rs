//! HTTP/1.x message reconstruction from raw byte streams
//!
//! A [`MessageReader`] parses successive requests (or responses) out of one
//! direction of a connection while keeping the exact bytes each message
//! occupied on the wire.
use crate::errors::{new_io_error, Error, Result};
use crate::export::{Exporter, HttpRecord};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::debug;

const CR_LF: &[u8] = &[13, 10];
const SPACE: &[u8] = &[32];
const READ_CHUNK: usize = 8 * 1024;

/// A parsed request and the bytes it was parsed from.
#[derive(Debug, Clone)]
pub struct Request {
  /// request method
  pub method: Method,
  /// request target exactly as sent (origin form, absolute form or `*`)
  pub target: String,
  /// protocol version
  pub version: Version,
  /// header fields
  pub headers: HeaderMap,
  /// decoded body (chunked framing removed)
  pub body: Bytes,
  /// the message as it appeared on the wire
  pub raw: Bytes,
}

impl Request {
  /// The `Host` header, if present and printable.
  pub fn host(&self) -> Option<&str> {
    self
      .headers
      .get(http::header::HOST)
      .and_then(|h| h.to_str().ok())
  }
}

/// A parsed response and the bytes it was parsed from.
#[derive(Debug, Clone)]
pub struct Response {
  /// protocol version
  pub version: Version,
  /// final status code
  pub status: StatusCode,
  /// header fields
  pub headers: HeaderMap,
  /// decoded body
  pub body: Bytes,
  /// the message as it appeared on the wire, interim 1xx responses included
  pub raw: Bytes,
}

/// Reads HTTP messages one after another from a single stream.
#[derive(Debug)]
pub struct MessageReader<R> {
  reader: R,
  raw: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<BufReader<R>> {
  /// Wrap an unbuffered reader.
  pub fn buffered(reader: R) -> Self {
    Self::new(BufReader::new(reader))
  }
}

impl<R: AsyncBufRead + Unpin> MessageReader<R> {
  /// Constructs a reader over `reader`.
  pub fn new(reader: R) -> Self {
    Self {
      reader,
      raw: Vec::new(),
    }
  }

  /// Parse the next request.
  ///
  /// Blank lines between pipelined requests are skipped. Fails with
  /// [`Error::EndOfStream`] when the stream ends before a request line.
  pub async fn read_request(&mut self) -> Result<Request> {
    self.raw.clear();
    let line = loop {
      let line = self.read_line().await?;
      if !trim_line(&line).is_empty() {
        break line;
      }
      self.raw.clear();
    };
    let (method, target, version) = parser_request_line(trim_line(&line))?;
    let headers = self.read_headers().await?;
    let body = if is_chunked(&headers) {
      self.read_chunked_body().await?
    } else if let Some(length) = content_length(&headers)? {
      self.read_sized_body(length).await?
    } else {
      Vec::new()
    };
    Ok(Request {
      method,
      target,
      version,
      headers,
      body: Bytes::from(body),
      raw: Bytes::from(std::mem::take(&mut self.raw)),
    })
  }

  /// Parse the response to a request made with `method`.
  ///
  /// Interim 1xx responses (other than `101 Switching Protocols`) are folded
  /// into the raw bytes of the final response.
  pub async fn read_response(&mut self, method: &Method) -> Result<Response> {
    self.raw.clear();
    loop {
      let line = self.read_line().await?;
      let (version, status) = parser_status_line(trim_line(&line))?;
      let headers = self.read_headers().await?;
      if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
        debug!("skipping interim {} response", status);
        continue;
      }
      let body = if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
      {
        Vec::new()
      } else if is_chunked(&headers) {
        self.read_chunked_body().await?
      } else if let Some(length) = content_length(&headers)? {
        self.read_sized_body(length).await?
      } else {
        self.read_until_close().await?
      };
      return Ok(Response {
        version,
        status,
        headers,
        body: Bytes::from(body),
        raw: Bytes::from(std::mem::take(&mut self.raw)),
      });
    }
  }

  async fn read_line(&mut self) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let n = self
      .reader
      .read_until(b'\n', &mut line)
      .await
      .map_err(map_io)?;
    if n == 0 {
      return Err(Error::EndOfStream);
    }
    self.raw.extend_from_slice(&line);
    Ok(line)
  }

  async fn read_headers(&mut self) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    loop {
      let line = self.read_line().await?;
      if trim_line(&line).is_empty() {
        break;
      }
      match parser_headers(&line) {
        Ok((Some(k), Some(v))) => {
          headers.append(k, v);
        }
        _ => debug!("ignoring malformed header line"),
      }
    }
    Ok(headers)
  }

  async fn read_sized_body(&mut self, length: u64) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    (&mut self.reader)
      .take(length)
      .read_to_end(&mut body)
      .await
      .map_err(map_io)?;
    self.raw.extend_from_slice(&body);
    if (body.len() as u64) < length {
      return Err(Error::EndOfStream);
    }
    Ok(body)
  }

  async fn read_chunked_body(&mut self) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
      let line = self.read_line().await?;
      let size = trim_line(&line);
      // chunk extensions follow a ';'
      let size = size.split(|b| *b == b';').next().unwrap_or(size);
      let size = std::str::from_utf8(size)
        .ok()
        .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
        .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "invalid chunk size"))?;
      if size == 0 {
        // trailer section
        while !trim_line(&self.read_line().await?).is_empty() {}
        return Ok(body);
      }
      let chunk = self.read_sized_body(size as u64).await?;
      body.extend_from_slice(&chunk);
      self.read_line().await?;
    }
  }

  async fn read_until_close(&mut self) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut buffer = vec![0; READ_CHUNK];
    loop {
      match self.reader.read(&mut buffer).await {
        Ok(0) => break,
        Ok(n) => body.extend_from_slice(&buffer[..n]),
        // nothing more arrived in time, keep what we have
        Err(err) if err.kind() == ErrorKind::TimedOut => break,
        Err(err) => return Err(Error::IO(err)),
      }
    }
    self.raw.extend_from_slice(&body);
    Ok(body)
  }
}

fn map_io(err: std::io::Error) -> Error {
  match err.kind() {
    ErrorKind::TimedOut => Error::Timeout,
    ErrorKind::UnexpectedEof => Error::EndOfStream,
    _ => Error::IO(err),
  }
}

fn trim_line(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

fn parser_version(v: &[u8]) -> Result<Version> {
  match v {
    b"HTTP/0.9" => Ok(Version::HTTP_09),
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(new_io_error(ErrorKind::InvalidData, "invalid http version")),
  }
}

fn parser_request_line(line: &[u8]) -> Result<(Method, String, Version)> {
  let mut parts = line.splitn(3, |b| b == &SPACE[0]);
  let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
  else {
    return Err(new_io_error(ErrorKind::InvalidData, "invalid request line"));
  };
  let method = Method::from_bytes(method).map_err(|e| Error::Http(http::Error::from(e)))?;
  let target = String::from_utf8_lossy(target).into_owned();
  Ok((method, target, parser_version(version)?))
}

fn parser_status_line(line: &[u8]) -> Result<(Version, StatusCode)> {
  let mut parts = line.splitn(3, |b| b == &SPACE[0]);
  let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
    return Err(new_io_error(
      ErrorKind::InvalidData,
      "invalid http version and status_code data",
    ));
  };
  let version = parser_version(version)?;
  let status = StatusCode::from_bytes(code).map_err(|e| Error::Http(http::Error::from(e)))?;
  Ok((version, status))
}

pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let mut parts = buffer.splitn(2, |s| s == &b':');
  let k = match parts.next() {
    Some(name) => Some(http::HeaderName::from_bytes(name)?),
    None => None,
  };
  let v = match parts.next() {
    Some(value) => Some(http::HeaderValue::from_bytes(value.trim_ascii())?),
    None => None,
  };
  Ok((k, v))
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(http::header::TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .last()
    .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
  match headers.get(http::header::CONTENT_LENGTH) {
    None => Ok(None),
    Some(v) => v
      .to_str()
      .ok()
      .and_then(|s| s.trim().parse().ok())
      .map(Some)
      .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "invalid content-length")),
  }
}

/// Pair requests read from `requests` with responses read from `responses`
/// and hand each exchange to `exporter`.
///
/// Stops when no further request can be parsed. A request whose response
/// cannot be parsed is exported on its own and ends the loop. Returns the
/// number of records exported.
pub async fn reconstruct<Q, P>(requests: Q, responses: P, host: &str, exporter: &Exporter) -> usize
where
  Q: AsyncRead + Unpin,
  P: AsyncRead + Unpin,
{
  let mut requests = MessageReader::buffered(requests);
  let mut responses = MessageReader::buffered(responses);
  let mut exported = 0;
  loop {
    let request = match requests.read_request().await {
      Ok(request) => request,
      Err(e) => {
        if e.is_fatal_to_relay() {
          debug!("stopped parsing requests: {}", e);
        }
        break;
      }
    };
    match responses.read_response(&request.method).await {
      Ok(response) => {
        exporter
          .export(&HttpRecord::new(&request, Some(&response), host))
          .await;
        exported += 1;
        if response.status == StatusCode::SWITCHING_PROTOCOLS {
          debug!("connection upgraded, no more HTTP/1.x to parse");
          break;
        }
      }
      Err(e) => {
        debug!("no response for {} {}: {}", request.method, request.target, e);
        exporter.export(&HttpRecord::new(&request, None, host)).await;
        exported += 1;
        break;
      }
    }
  }
  exported
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::export::HistorySink;
  use std::sync::Arc;

  fn reader(data: &'static [u8]) -> MessageReader<BufReader<&'static [u8]>> {
    MessageReader::buffered(data)
  }

  #[tokio::test]
  async fn request_with_content_length() {
    let wire: &[u8] = b"POST /form?a=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello";
    let mut r = reader(wire);
    let request = r.read_request().await.unwrap();
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.target, "/form?a=1");
    assert_eq!(request.version, Version::HTTP_11);
    assert_eq!(request.host(), Some("example.com"));
    assert_eq!(&request.body[..], b"hello");
    assert_eq!(&request.raw[..], wire);
    assert!(matches!(r.read_request().await, Err(Error::EndOfStream)));
  }

  #[tokio::test]
  async fn pipelined_requests_keep_their_own_bytes() {
    let mut r = reader(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n\r\nGET /b HTTP/1.0\r\n\r\n");
    let first = r.read_request().await.unwrap();
    assert_eq!(first.target, "/a");
    assert_eq!(&first.raw[..], b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n");
    let second = r.read_request().await.unwrap();
    assert_eq!(second.target, "/b");
    assert_eq!(second.version, Version::HTTP_10);
    assert_eq!(&second.raw[..], b"GET /b HTTP/1.0\r\n\r\n");
  }

  #[tokio::test]
  async fn chunked_response_body_is_decoded() {
    let wire: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: t\r\n\r\n";
    let mut r = reader(wire);
    let response = r.read_response(&Method::GET).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(&response.body[..], b"hello world");
    assert_eq!(&response.raw[..], wire);
  }

  #[tokio::test]
  async fn head_and_no_content_have_no_body() {
    let mut r = reader(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n");
    let head = r.read_response(&Method::HEAD).await.unwrap();
    assert!(head.body.is_empty());
    let empty = r.read_response(&Method::DELETE).await.unwrap();
    assert_eq!(empty.status, StatusCode::NO_CONTENT);
  }

  #[tokio::test]
  async fn interim_responses_are_folded() {
    let wire: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok";
    let mut r = reader(wire);
    let response = r.read_response(&Method::POST).await.unwrap();
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(&response.body[..], b"ok");
    assert_eq!(&response.raw[..], wire);
  }

  #[tokio::test]
  async fn close_delimited_body() {
    let mut r = reader(b"HTTP/1.0 200 OK\r\nServer: x\r\n\r\nuntil the end");
    let response = r.read_response(&Method::GET).await.unwrap();
    assert_eq!(response.version, Version::HTTP_10);
    assert_eq!(&response.body[..], b"until the end");
  }

  #[tokio::test]
  async fn truncated_body_is_an_error() {
    let mut r = reader(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort");
    assert!(matches!(
      r.read_response(&Method::GET).await,
      Err(Error::EndOfStream)
    ));
    let mut r = reader(b"NOT HTTP AT ALL\r\n\r\n");
    assert!(r.read_response(&Method::GET).await.is_err());
  }

  #[tokio::test]
  async fn reconstruct_pairs_exchanges() {
    let history = Arc::new(HistorySink::new(8));
    let exporter = Exporter::new(vec![history.clone()]);
    let requests: &[u8] = b"GET /one HTTP/1.1\r\nHost: example.com\r\n\r\nGET /two HTTP/1.1\r\n\r\n";
    let responses: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\none";
    let exported = reconstruct(requests, responses, "fallback.test", &exporter).await;
    assert_eq!(exported, 2);

    let records = history.records();
    assert_eq!(records.len(), 2);
    // newest first
    assert_eq!(records[0].uri, "/two");
    assert_eq!(records[0].host, "fallback.test");
    assert!(records[0].raw_response.is_none());
    assert_eq!(records[1].uri, "/one");
    assert_eq!(records[1].host, "example.com");
    assert_eq!(records[1].status, Some(200));
  }

  #[tokio::test]
  async fn reconstruct_stops_at_unparsable_request() {
    let history = Arc::new(HistorySink::new(8));
    let exporter = Exporter::new(vec![history.clone()]);
    let requests: &[u8] = b"GET /one HTTP/1.1\r\n\r\n\x16\x03\x01 garbage\r\n\r\n";
    let responses: &[u8] = b"HTTP/1.1 204 No Content\r\n\r\nHTTP/1.1 200 OK\r\n\r\n";
    assert_eq!(reconstruct(requests, responses, "a.test", &exporter).await, 1);

    let empty: &[u8] = b"";
    assert_eq!(reconstruct(empty, empty, "a.test", &exporter).await, 0);
    assert_eq!(history.records().len(), 1);
  }
}
