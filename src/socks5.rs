//! SOCKS5 server side handshake

use crate::errors::{Error, Result};
use std::fmt;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_NO_AUTHENTICATION: u8 = 0x00;
const SOCKS5_NO_ACCEPTABLE_METHODS: u8 = 0xFF;

const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_CMD_BIND: u8 = 0x02;
const SOCKS5_CMD_UDP_ASSOCIATE: u8 = 0x03;

const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
  /// Succeeded
  Succeeded = 0x00,
  /// General failure
  GeneralFailure = 0x01,
  /// Connection not allowed by ruleset
  ConnectionNotAllowed = 0x02,
  /// Network unreachable
  NetworkUnreachable = 0x03,
  /// Host unreachable
  HostUnreachable = 0x04,
  /// Connection refused
  ConnectionRefused = 0x05,
  /// TTL expired
  TtlExpired = 0x06,
  /// Command not supported
  CommandNotSupported = 0x07,
  /// Address type not supported
  AddressTypeNotSupported = 0x08,
}

impl Reply {
  /// Wire frame: `[VER, REP, RSV, ATYP, BND.ADDR, BND.PORT]`.
  ///
  /// The bound address is always `0.0.0.0:0`. The remote is dialed only after
  /// the reply, so there is no real local address to report and clients must
  /// not rely on this field.
  pub fn to_bytes(self) -> [u8; 10] {
    [
      SOCKS5_VERSION,
      self as u8,
      0x00,
      SOCKS5_ATYP_IPV4,
      0x00,
      0x00,
      0x00,
      0x00,
      0x00,
      0x00,
    ]
  }
}

/// SOCKS5 request command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
  /// CONNECT
  Connect,
  /// BIND
  Bind,
  /// UDP ASSOCIATE
  UdpAssociate,
  /// Anything else
  Unknown(u8),
}

impl From<u8> for Command {
  fn from(value: u8) -> Self {
    match value {
      SOCKS5_CMD_CONNECT => Command::Connect,
      SOCKS5_CMD_BIND => Command::Bind,
      SOCKS5_CMD_UDP_ASSOCIATE => Command::UdpAssociate,
      other => Command::Unknown(other),
    }
  }
}

impl Command {
  fn code(self) -> u8 {
    match self {
      Command::Connect => SOCKS5_CMD_CONNECT,
      Command::Bind => SOCKS5_CMD_BIND,
      Command::UdpAssociate => SOCKS5_CMD_UDP_ASSOCIATE,
      Command::Unknown(c) => c,
    }
  }
}

/// SOCKS5 target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
  /// IPv4 address
  Ipv4(Ipv4Addr, u16),
  /// IPv6 address
  Ipv6(Ipv6Addr, u16),
  /// Domain name
  Domain(String, u16),
}

impl TargetAddr {
  /// Get host and port as string, IPv6 hosts in brackets
  pub fn to_host_port(&self) -> String {
    self.to_string()
  }

  /// Get host (without port)
  pub fn host(&self) -> String {
    match self {
      TargetAddr::Ipv4(ip, _) => ip.to_string(),
      TargetAddr::Ipv6(ip, _) => ip.to_string(),
      TargetAddr::Domain(domain, _) => domain.clone(),
    }
  }

  /// Get port
  pub fn port(&self) -> u16 {
    match self {
      TargetAddr::Ipv4(_, port) | TargetAddr::Ipv6(_, port) | TargetAddr::Domain(_, port) => *port,
    }
  }
}

impl fmt::Display for TargetAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TargetAddr::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
      TargetAddr::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
      TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
    }
  }
}

/// The outcome of a successful CONNECT negotiation.
#[derive(Debug, Clone)]
pub struct Socks5Request {
  /// authentication methods the client offered
  pub methods: Vec<u8>,
  /// where the client wants to go; not dialed yet
  pub target: TargetAddr,
}

/// SOCKS5 server for the intercepting proxy
pub struct Socks5Server;

impl Socks5Server {
  /// Run the server side of the handshake.
  ///
  /// CONNECT is answered with success before anything is dialed; the relay
  /// stage dials later and simply closes the connection if that fails.
  /// BIND and UDP ASSOCIATE get a `0x07` reply and an
  /// [`Error::UnsupportedCommand`], after which the caller closes the
  /// connection.
  pub async fn handshake<S>(stream: &mut S) -> Result<Socks5Request>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let version = stream.read_u8().await?;
    if version != SOCKS5_VERSION {
      return Err(Error::protocol(format!(
        "unsupported socks version: {}",
        version
      )));
    }
    let nmethods = stream.read_u8().await?;
    if nmethods < 1 {
      return Err(Error::protocol("no authentication methods offered"));
    }
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    // only "no authentication" is accepted
    if methods.contains(&SOCKS5_NO_AUTHENTICATION) {
      stream
        .write_all(&[SOCKS5_VERSION, SOCKS5_NO_AUTHENTICATION])
        .await?;
    } else {
      stream
        .write_all(&[SOCKS5_VERSION, SOCKS5_NO_ACCEPTABLE_METHODS])
        .await?;
      return Err(Error::NoAcceptableAuth);
    }

    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    let [version, cmd, rsv, atyp] = buf;
    if version != SOCKS5_VERSION {
      return Err(Error::protocol(format!(
        "invalid socks version in request: {}",
        version
      )));
    }
    if rsv != 0x00 {
      return Err(Error::protocol(format!("reserved byte must be 0, got {}", rsv)));
    }

    let target = match Self::read_addr(stream, atyp).await {
      Ok(target) => target,
      Err(AddrError::Truncated) => {
        return Err(Error::protocol("truncated target address"));
      }
      Err(AddrError::Io(e)) => return Err(e.into()),
      Err(AddrError::Invalid(reply, msg)) => {
        Self::send_reply(stream, reply).await?;
        return Err(Error::protocol(msg));
      }
    };

    match Command::from(cmd) {
      Command::Connect => {
        Self::send_reply(stream, Reply::Succeeded).await?;
        Ok(Socks5Request { methods, target })
      }
      other => {
        Self::send_reply(stream, Reply::CommandNotSupported).await?;
        Err(Error::UnsupportedCommand(other.code()))
      }
    }
  }

  async fn read_addr<S>(stream: &mut S, atyp: u8) -> std::result::Result<TargetAddr, AddrError>
  where
    S: AsyncRead + Unpin,
  {
    let target = match atyp {
      SOCKS5_ATYP_IPV4 => {
        let mut addr = [0u8; 4];
        stream.read_exact(&mut addr).await?;
        TargetAddr::Ipv4(Ipv4Addr::from(addr), read_port(stream).await?)
      }
      SOCKS5_ATYP_IPV6 => {
        let mut addr = [0u8; 16];
        stream.read_exact(&mut addr).await?;
        TargetAddr::Ipv6(Ipv6Addr::from(addr), read_port(stream).await?)
      }
      SOCKS5_ATYP_DOMAIN => {
        let len = stream.read_u8().await? as usize;
        let mut domain = vec![0u8; len];
        stream.read_exact(&mut domain).await?;
        let port = read_port(stream).await?;
        let domain = String::from_utf8(domain)
          .ok()
          .filter(|d| !d.is_empty() && d.is_ascii())
          .ok_or_else(|| AddrError::Invalid(Reply::GeneralFailure, "invalid domain name".into()))?;
        TargetAddr::Domain(domain, port)
      }
      _ => {
        return Err(AddrError::Invalid(
          Reply::AddressTypeNotSupported,
          format!("unsupported address type: {}", atyp),
        ));
      }
    };
    Ok(target)
  }

  /// Send SOCKS5 reply
  async fn send_reply<S>(stream: &mut S, reply: Reply) -> Result<()>
  where
    S: AsyncWrite + Unpin,
  {
    stream.write_all(&reply.to_bytes()).await?;
    stream.flush().await?;
    Ok(())
  }
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<u16> {
  let mut port = [0u8; 2];
  stream.read_exact(&mut port).await?;
  Ok(u16::from_be_bytes(port))
}

enum AddrError {
  Truncated,
  Io(std::io::Error),
  Invalid(Reply, String),
}

impl From<std::io::Error> for AddrError {
  fn from(value: std::io::Error) -> Self {
    if value.kind() == ErrorKind::UnexpectedEof {
      AddrError::Truncated
    } else {
      AddrError::Io(value)
    }
  }
}
