//! Export of reconstructed HTTP exchanges
//!
//! Every finished exchange becomes an [`HttpRecord`] handed to each
//! configured [`RecordSink`]. Sink failures are logged and never reach the
//! relay.
use crate::errors::{Error, Result};
use crate::http::{Request, Response};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{info, warn};

const BROADCAST_CAPACITY: usize = 256;

/// One request with its response, if one was parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRecord {
  /// random 128-bit identifier, lowercase hex
  pub id: String,
  /// unix timestamp in seconds
  pub timestamp: u64,
  /// request method
  pub method: String,
  /// request target as sent
  pub uri: String,
  /// `Host` header, or the SOCKS5 target host without one
  pub host: String,
  /// response status
  pub status: Option<u16>,
  /// request bytes as seen on the wire
  #[serde(with = "raw_bytes")]
  pub raw_request: Bytes,
  /// response bytes as seen on the wire
  #[serde(with = "raw_bytes_opt", default)]
  pub raw_response: Option<Bytes>,
}

impl HttpRecord {
  /// Build a record; `fallback_host` is used when the request has no `Host`.
  pub fn new(request: &Request, response: Option<&Response>, fallback_host: &str) -> Self {
    let timestamp = std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .map(|d| d.as_secs())
      .unwrap_or_default();
    HttpRecord {
      id: format!("{:032x}", rand::random::<u128>()),
      timestamp,
      method: request.method.to_string(),
      uri: request.target.clone(),
      host: request.host().unwrap_or(fallback_host).to_string(),
      status: response.map(|r| r.status.as_u16()),
      raw_request: request.raw.clone(),
      raw_response: response.map(|r| r.raw.clone()),
    }
  }
}

mod raw_bytes {
  use base64::Engine;
  use bytes::Bytes;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(value))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    let s = String::deserialize(deserializer)?;
    base64::engine::general_purpose::STANDARD
      .decode(s)
      .map(Bytes::from)
      .map_err(serde::de::Error::custom)
  }
}

mod raw_bytes_opt {
  use bytes::Bytes;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
      Some(v) => super::raw_bytes::serialize(v, serializer),
      None => serializer.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Bytes>, D::Error> {
    #[derive(Deserialize)]
    struct Wrapper(#[serde(with = "super::raw_bytes")] Bytes);
    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
  }
}

/// Destination for exported records.
#[async_trait]
pub trait RecordSink: Send + Sync {
  /// short name used in log lines
  fn name(&self) -> &'static str;
  /// Deliver one record
  async fn export(&self, record: &HttpRecord) -> Result<()>;
}

/// Logs a one-line summary of each exchange.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl RecordSink for TracingSink {
  fn name(&self) -> &'static str {
    "tracing"
  }

  async fn export(&self, record: &HttpRecord) -> Result<()> {
    match record.status {
      Some(status) => info!(
        id = %record.id,
        "{} {}{} -> {} ({} bytes)",
        record.method,
        record.host,
        record.uri,
        status,
        record.raw_response.as_ref().map(Bytes::len).unwrap_or_default()
      ),
      None => info!(id = %record.id, "{} {}{} -> no response", record.method, record.host, record.uri),
    }
    Ok(())
  }
}

/// Appends each record as one JSON line, raw bytes base64 encoded.
#[derive(Debug)]
pub struct JsonLinesSink {
  path: PathBuf,
  file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesSink {
  /// The file is created on first export.
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      file: tokio::sync::Mutex::new(None),
    }
  }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
  fn name(&self) -> &'static str {
    "json-lines"
  }

  async fn export(&self, record: &HttpRecord) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    let mut guard = self.file.lock().await;
    if guard.is_none() {
      let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&self.path)
        .await
        .map_err(|e| Error::Export(format!("{}: {}", self.path.display(), e)))?;
      *guard = Some(file);
    }
    if let Some(file) = guard.as_mut() {
      file.write_all(&line).await?;
      file.flush().await?;
    }
    Ok(())
  }
}

/// Keeps the most recent records in memory, newest first, and broadcasts
/// each new one to subscribers.
#[derive(Debug)]
pub struct HistorySink {
  capacity: usize,
  entries: Mutex<VecDeque<Arc<HttpRecord>>>,
  tx: broadcast::Sender<Arc<HttpRecord>>,
}

impl HistorySink {
  /// Ring of at most `capacity` records
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
    Self {
      capacity,
      entries: Mutex::new(VecDeque::with_capacity(capacity)),
      tx,
    }
  }

  /// Snapshot of the ring, newest first
  pub fn records(&self) -> Vec<Arc<HttpRecord>> {
    let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    entries.iter().cloned().collect()
  }

  /// Look a record up by id
  pub fn get(&self, id: &str) -> Option<Arc<HttpRecord>> {
    let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    entries.iter().find(|e| e.id == id).cloned()
  }

  /// Receive records exported from now on
  pub fn subscribe(&self) -> broadcast::Receiver<Arc<HttpRecord>> {
    self.tx.subscribe()
  }
}

#[async_trait]
impl RecordSink for HistorySink {
  fn name(&self) -> &'static str {
    "history"
  }

  async fn export(&self, record: &HttpRecord) -> Result<()> {
    let record = Arc::new(record.clone());
    if self.capacity > 0 {
      let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
      if entries.len() >= self.capacity {
        entries.pop_back();
      }
      entries.push_front(record.clone());
    }
    // no subscribers is fine
    let _ = self.tx.send(record);
    Ok(())
  }
}

/// Fans records out to every sink.
#[derive(Clone, Default)]
pub struct Exporter {
  sinks: Vec<Arc<dyn RecordSink>>,
}

impl std::fmt::Debug for Exporter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_list()
      .entries(self.sinks.iter().map(|s| s.name()))
      .finish()
  }
}

impl Exporter {
  /// Exporter over `sinks`
  pub fn new(sinks: Vec<Arc<dyn RecordSink>>) -> Self {
    Self { sinks }
  }

  /// Add one more sink
  pub fn push(&mut self, sink: Arc<dyn RecordSink>) {
    self.sinks.push(sink);
  }

  /// Deliver `record` to every sink. Failures are logged and swallowed.
  pub async fn export(&self, record: &HttpRecord) {
    for sink in &self.sinks {
      if let Err(e) = sink.export(record).await {
        warn!("{} export of {} failed: {}", sink.name(), record.id, e);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::{HeaderMap, Method, StatusCode, Version};

  struct FailingSink;

  #[async_trait]
  impl RecordSink for FailingSink {
    fn name(&self) -> &'static str {
      "failing"
    }
    async fn export(&self, _record: &HttpRecord) -> Result<()> {
      Err(Error::Export("unreachable collector".into()))
    }
  }

  fn request() -> Request {
    Request {
      method: Method::GET,
      target: "/".into(),
      version: Version::HTTP_11,
      headers: HeaderMap::new(),
      body: Bytes::new(),
      raw: Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"),
    }
  }

  fn response() -> Response {
    Response {
      version: Version::HTTP_11,
      status: StatusCode::NOT_FOUND,
      headers: HeaderMap::new(),
      body: Bytes::new(),
      raw: Bytes::from_static(b"HTTP/1.1 404 Not Found\r\n\r\n"),
    }
  }

  #[test]
  fn record_uses_fallback_host_and_random_id() {
    let a = HttpRecord::new(&request(), Some(&response()), "example.com");
    let b = HttpRecord::new(&request(), None, "example.com");
    assert_eq!(a.host, "example.com");
    assert_eq!(a.status, Some(404));
    assert_eq!(a.id.len(), 32);
    assert_ne!(a.id, b.id);
    assert!(b.raw_response.is_none());
  }

  #[test]
  fn json_keeps_raw_bytes() {
    let record = HttpRecord::new(&request(), Some(&response()), "example.com");
    let json = serde_json::to_string(&record).unwrap();
    assert!(json.contains("R0VUIC8gSFRUUC8xLjENCg0K"));
    let back: HttpRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(back, record);
  }

  #[tokio::test]
  async fn failing_sink_does_not_stop_the_others() {
    let history = Arc::new(HistorySink::new(2));
    let mut updates = history.subscribe();
    let exporter = Exporter::new(vec![Arc::new(FailingSink), history.clone()]);
    for _ in 0..3 {
      exporter
        .export(&HttpRecord::new(&request(), None, "h"))
        .await;
    }
    assert_eq!(history.records().len(), 2);
    let first = updates.recv().await.unwrap();
    assert!(history.get(&first.id).is_none());
  }

  #[tokio::test]
  async fn json_lines_appends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.jsonl");
    let sink = JsonLinesSink::new(&path);
    let record = HttpRecord::new(&request(), Some(&response()), "example.com");
    sink.export(&record).await.unwrap();
    sink.export(&record).await.unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<_> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    let parsed: HttpRecord = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(parsed.id, record.id);
  }
}
