//! proxy error
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `tapsocks::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while handling a proxied connection.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Malformed SOCKS5 field: bad version, non-zero reserved byte, undecodable address
  #[error("socks5 protocol error: {0}")]
  Protocol(String),
  /// The client offered no authentication method we accept
  #[error("no acceptable authentication method")]
  NoAcceptableAuth,
  /// BIND, UDP ASSOCIATE or an unknown command byte
  #[error("unsupported socks5 command: {0:#04x}")]
  UnsupportedCommand(u8),
  /// The remote target could not be reached
  #[error("failed to dial {address}: {source}")]
  Dial {
    /// the address that was dialed, after routing
    address: String,
    /// the underlying failure
    #[source]
    source: std::io::Error,
  },
  /// TLS handshake failure on either leg
  #[error("tls handshake failed: {0}")]
  TlsHandshake(String),
  /// Certificate generation or signing failure
  #[error("certificate issuance failed: {0}")]
  Issuance(String),
  /// A buffer read did not see new data in time
  #[error("buffer read timed out")]
  Timeout,
  /// A buffer was closed and fully consumed
  #[error("end of stream")]
  EndOfStream,
  /// The record export collaborator failed
  #[error("export failed: {0}")]
  Export(String),
  /// Invalid or unreadable configuration
  #[error("config error: {0}")]
  Config(String),
  /// rustls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// yaml Error
  #[error(transparent)]
  Yaml(#[from] serde_yaml::Error),
  /// json Error
  #[error(transparent)]
  Json(#[from] serde_json::Error),
}

impl Error {
  /// Create a protocol error and log it
  pub fn protocol(msg: impl Into<String>) -> Self {
    let error = Error::Protocol(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an issuance error and log it
  pub fn issuance(msg: impl Into<String>) -> Self {
    let error = Error::Issuance(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS handshake error and log it
  pub fn tls_handshake(msg: impl Into<String>) -> Self {
    let error = Error::TlsHandshake(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Whether this error must tear down the raw relay.
  ///
  /// Buffer timeouts, end of stream and export failures only ever end the
  /// HTTP reconstruction loop.
  pub fn is_fatal_to_relay(&self) -> bool {
    !matches!(self, Error::Timeout | Error::EndOfStream | Error::Export(_))
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<Error> for std::io::Error {
  fn from(value: Error) -> Self {
    match value {
      Error::IO(e) => e,
      Error::Timeout => std::io::Error::new(ErrorKind::TimedOut, value.to_string()),
      Error::EndOfStream => std::io::Error::new(ErrorKind::UnexpectedEof, value.to_string()),
      other => std::io::Error::new(ErrorKind::Other, other.to_string()),
    }
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
