//! Peek the first few bytes of a connection to determine the protocol.
//!
//! None of these functions consume input.
use crate::conn::{Conn, MAX_PEEK};
use tokio::io::{AsyncRead, AsyncReadExt};

const SOCKS5_VERSION: u8 = 0x05;
const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 22;
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const TLS_EXT_TYPE_SERVER_NAME: u16 = 0x0000;
const TLS_SERVER_NAME_TYPE_HOST: u8 = 0x00;
const HTTP_METHODS: [&[u8]; 8] = [
  b"CONNECT", b"DELETE", b"GET", b"HEAD", b"OPTIONS", b"POST", b"PUT", b"TRACE",
];

const SOCKS5_PEEK: usize = 2;
const TLS_PEEK: usize = 6;
const HTTP_PEEK: usize = 20;

/// `0x05` followed by a non-zero method count.
pub fn looks_like_socks5(p: &[u8]) -> bool {
  p.len() >= SOCKS5_PEEK && p[0] == SOCKS5_VERSION && p[1] > 0
}

/// Heuristic TLS ClientHello check on the record header and handshake type.
pub fn looks_like_client_hello(p: &[u8]) -> bool {
  p.len() >= TLS_PEEK
    && p[0] == TLS_CONTENT_TYPE_HANDSHAKE
    && p[1] >= 3
    && (p[3] > 0 || p[4] > 20)
    && p[5] == TLS_HANDSHAKE_TYPE_CLIENT_HELLO
}

/// An HTTP method token followed by a space, case-insensitive.
pub fn looks_like_http(p: &[u8]) -> bool {
  HTTP_METHODS.iter().any(|method| {
    p.len() > method.len() && p[..method.len()].eq_ignore_ascii_case(method) && p[method.len()] == b' '
  })
}

/// True when the connection starts with a SOCKS5 greeting.
pub async fn is_socks5<S: AsyncRead + Unpin>(conn: &mut Conn<S>) -> bool {
  match conn.peek(SOCKS5_PEEK).await {
    Ok(p) => looks_like_socks5(p),
    Err(_) => false,
  }
}

/// True when the connection starts with a TLS ClientHello record.
pub async fn is_tls<S: AsyncRead + Unpin>(conn: &mut Conn<S>) -> bool {
  match conn.peek(TLS_PEEK).await {
    Ok(p) => looks_like_client_hello(p),
    Err(_) => false,
  }
}

/// True when the connection starts with an HTTP/1.x request line.
pub async fn is_http<S: AsyncRead + Unpin>(conn: &mut Conn<S>) -> bool {
  match conn.peek(HTTP_PEEK).await {
    Ok(p) => looks_like_http(p),
    Err(_) => false,
  }
}

/// Like [`is_http`] for a stream that cannot be peeked, such as a reader
/// over a tapped copy. Consumes up to 20 bytes; a shorter stream is judged
/// on what arrived before its end or a read error.
pub async fn reads_as_http<R: AsyncRead + Unpin>(reader: &mut R) -> bool {
  let mut prefix = [0u8; HTTP_PEEK];
  let mut filled = 0;
  while filled < HTTP_PEEK {
    match reader.read(&mut prefix[filled..]).await {
      Ok(0) | Err(_) => break,
      Ok(n) => filled += n,
    }
  }
  looks_like_http(&prefix[..filled])
}

/// Reads the SNI host name out of a buffered ClientHello, if it carries one.
///
/// Only the first TLS record is examined.
pub async fn peek_server_name<S: AsyncRead + Unpin>(conn: &mut Conn<S>) -> Option<String> {
  let header = conn.peek(5).await.ok()?;
  if header.len() < 5 || header[0] != TLS_CONTENT_TYPE_HANDSHAKE {
    return None;
  }
  let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
  let total = std::cmp::min(5 + record_len, MAX_PEEK);
  let record = conn.peek(total).await.ok()?;
  client_hello_server_name(&record[5..])
}

/// Extracts the host name from the server_name extension of a ClientHello
/// handshake message (record header already stripped).
pub fn client_hello_server_name(handshake: &[u8]) -> Option<String> {
  let mut r = ByteReader::new(handshake);
  if r.u8()? != TLS_HANDSHAKE_TYPE_CLIENT_HELLO {
    return None;
  }
  // length(3) + legacy_version(2) + random(32)
  r.skip(3 + 2 + 32)?;
  let session_id_len = r.u8()? as usize;
  r.skip(session_id_len)?;
  let cipher_suites_len = r.u16()? as usize;
  r.skip(cipher_suites_len)?;
  let compression_len = r.u8()? as usize;
  r.skip(compression_len)?;
  let extensions_len = r.u16()? as usize;
  let mut extensions = ByteReader::new(r.take(extensions_len)?);
  while !extensions.is_empty() {
    let ext_type = extensions.u16()?;
    let ext_len = extensions.u16()? as usize;
    let body = extensions.take(ext_len)?;
    if ext_type != TLS_EXT_TYPE_SERVER_NAME {
      continue;
    }
    let mut list = ByteReader::new(body);
    let list_len = list.u16()? as usize;
    let mut names = ByteReader::new(list.take(list_len)?);
    while !names.is_empty() {
      let name_type = names.u8()?;
      let name_len = names.u16()? as usize;
      let name = names.take(name_len)?;
      if name_type == TLS_SERVER_NAME_TYPE_HOST {
        return std::str::from_utf8(name).ok().map(str::to_owned);
      }
    }
  }
  None
}

struct ByteReader<'a> {
  data: &'a [u8],
}

impl<'a> ByteReader<'a> {
  fn new(data: &'a [u8]) -> Self {
    Self { data }
  }
  fn is_empty(&self) -> bool {
    self.data.is_empty()
  }
  fn take(&mut self, n: usize) -> Option<&'a [u8]> {
    if self.data.len() < n {
      return None;
    }
    let (head, tail) = self.data.split_at(n);
    self.data = tail;
    Some(head)
  }
  fn skip(&mut self, n: usize) -> Option<()> {
    self.take(n).map(|_| ())
  }
  fn u8(&mut self) -> Option<u8> {
    self.take(1).map(|b| b[0])
  }
  fn u16(&mut self) -> Option<u16> {
    self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  /// Minimal TLS 1.2 style ClientHello record carrying `sni` when given.
  pub(crate) fn client_hello(sni: Option<&str>) -> Vec<u8> {
    let mut extensions = Vec::new();
    if let Some(name) = sni {
      let name = name.as_bytes();
      let mut entry = vec![TLS_SERVER_NAME_TYPE_HOST];
      entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
      entry.extend_from_slice(name);
      let mut body = (entry.len() as u16).to_be_bytes().to_vec();
      body.extend_from_slice(&entry);
      extensions.extend_from_slice(&TLS_EXT_TYPE_SERVER_NAME.to_be_bytes());
      extensions.extend_from_slice(&(body.len() as u16).to_be_bytes());
      extensions.extend_from_slice(&body);
    }
    // ec_point_formats
    extensions.extend_from_slice(&[0x00, 0x0b, 0x00, 0x02, 0x01, 0x00]);

    let mut hello = vec![0x03, 0x03];
    hello.extend_from_slice(&[7u8; 32]);
    hello.push(0); // session id
    hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    hello.extend_from_slice(&[0x01, 0x00]);
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);

    let mut handshake = vec![TLS_HANDSHAKE_TYPE_CLIENT_HELLO];
    handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);

    let mut record = vec![TLS_CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
  }

  #[test]
  fn socks5_greeting() {
    assert!(looks_like_socks5(&[0x05, 0x01]));
    assert!(looks_like_socks5(&[0x05, 0x03]));
    assert!(!looks_like_socks5(&[0x05, 0x00]));
    assert!(!looks_like_socks5(&[0x04, 0x01]));
    assert!(!looks_like_socks5(&[0x05]));
  }

  #[test]
  fn client_hello_header() {
    let hello = client_hello(Some("example.com"));
    assert!(looks_like_client_hello(&hello[..6]));
    // application data record
    assert!(!looks_like_client_hello(&[23, 3, 3, 0, 40, 1]));
    // ServerHello
    assert!(!looks_like_client_hello(&[22, 3, 3, 0, 90, 2]));
    // SSLv2-era major version
    assert!(!looks_like_client_hello(&[22, 2, 0, 0, 90, 1]));
    // tiny record
    assert!(!looks_like_client_hello(&[22, 3, 1, 0, 20, 1]));
    assert!(looks_like_client_hello(&[22, 3, 1, 1, 0, 1]));
  }

  #[test]
  fn http_request_lines() {
    assert!(looks_like_http(b"GET / HTTP/1.1\r\nHost: a"));
    assert!(looks_like_http(b"post /form HTTP/1.1\r\n"));
    assert!(looks_like_http(b"OPTIONS * HTTP/1.1\r\n"));
    assert!(!looks_like_http(b"GETX / HTTP/1.1\r\n"));
    assert!(!looks_like_http(b"PATCH / HTTP/1.1\r\n"));
    assert!(!looks_like_http(b"GET"));
    assert!(!looks_like_http(b"\x16\x03\x01\x02\x00\x01"));
  }

  #[tokio::test]
  async fn tapped_copy_sniffing() {
    let mut short: &[u8] = b"GET / HTTP/1.0\r\n\r\n";
    assert!(reads_as_http(&mut short).await);
    let mut banner: &[u8] = b"SSH-2.0-OpenSSH_9.6\r\n";
    assert!(!reads_as_http(&mut banner).await);
    let mut empty: &[u8] = b"";
    assert!(!reads_as_http(&mut empty).await);

    let (mut client, mut server) = tokio::io::duplex(64);
    client.write_all(b"PO").await.unwrap();
    let sniff = tokio::spawn(async move { reads_as_http(&mut server).await });
    client.write_all(b"ST /upload HTTP/1.1\r\n").await.unwrap();
    assert!(sniff.await.unwrap());
  }

  #[test]
  fn server_name_extraction() {
    let hello = client_hello(Some("example.com"));
    assert_eq!(
      client_hello_server_name(&hello[5..]).as_deref(),
      Some("example.com")
    );
    let hello = client_hello(None);
    assert_eq!(client_hello_server_name(&hello[5..]), None);
    // truncated input must not panic
    assert_eq!(client_hello_server_name(&hello[5..20]), None);
  }

  #[tokio::test]
  async fn sniffers_leave_the_stream_intact() {
    let hello = client_hello(Some("intercept.test"));
    let (mut client, server) = tokio::io::duplex(4096);
    client.write_all(&hello).await.unwrap();
    let mut conn = Conn::new(server);
    assert!(!is_socks5(&mut conn).await);
    assert!(is_tls(&mut conn).await);
    assert_eq!(
      peek_server_name(&mut conn).await.as_deref(),
      Some("intercept.test")
    );
    let mut all = vec![0u8; hello.len()];
    conn.read_exact(&mut all).await.unwrap();
    assert_eq!(all, hello);
  }
}
