//! Byte relays between the client and remote legs of a session.
use crate::buffer::Buffer;
use crate::export::Exporter;
use crate::http;
use crate::sniff;
use crate::tap::{self, Tap};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, Instrument};

/// Copy bytes both ways until both directions end.
///
/// Each direction shuts its own destination down when its source reaches
/// end of file, so a half-closed client still gets its response.
pub async fn pipe<C, R>(client: C, remote: R)
where
  C: AsyncRead + AsyncWrite + Unpin,
  R: AsyncRead + AsyncWrite + Unpin,
{
  let (mut client_read, mut client_write) = tokio::io::split(client);
  let (mut remote_read, mut remote_write) = tokio::io::split(remote);

  let client_to_remote = async {
    let res = tokio::io::copy(&mut client_read, &mut remote_write).await;
    debug!("client -> remote finished: {:?}", res);
    let _ = remote_write.shutdown().await;
  };
  let remote_to_client = async {
    let res = tokio::io::copy(&mut remote_read, &mut client_write).await;
    debug!("remote -> client finished: {:?}", res);
    let _ = client_write.shutdown().await;
  };
  tokio::join!(client_to_remote, remote_to_client);
}

/// Like [`pipe`], but every byte also lands in a per-direction [`Buffer`]
/// from which a background task rebuilds HTTP exchanges and exports them.
///
/// The relay never waits on reconstruction. The background task sniffs the
/// tapped request stream first; when it does not open with an HTTP request
/// line the readers are dropped and the taps stop copying.
pub async fn pipe_logged<C, R>(
  client: C,
  remote: R,
  host: String,
  exporter: Arc<Exporter>,
  read_timeout: Duration,
) where
  C: AsyncRead + AsyncWrite + Unpin,
  R: AsyncRead + AsyncWrite + Unpin,
{
  let (mut client_read, client_write) = tokio::io::split(client);
  let (mut remote_read, remote_write) = tokio::io::split(remote);
  let (mut to_remote, request_feed) = Tap::new(remote_write);
  let (mut to_client, response_feed) = Tap::new(client_write);

  let requests = Buffer::new();
  let responses = Buffer::new();
  let mut sniffer = requests.reader();
  sniffer.set_timeout(Some(read_timeout));
  let mut request_reader = requests.reader();
  request_reader.set_timeout(Some(read_timeout));
  let mut response_reader = responses.reader();
  response_reader.set_timeout(Some(read_timeout));

  tokio::spawn(requests.consume(request_feed));
  tokio::spawn(responses.consume(response_feed));
  tokio::spawn(
    async move {
      let is_http = sniff::reads_as_http(&mut sniffer).await;
      drop(sniffer);
      if !is_http {
        debug!("not HTTP, relaying {} without logging", host);
        return;
      }
      let exported = http::reconstruct(request_reader, response_reader, &host, &exporter).await;
      debug!("exported {} exchanges for {}", exported, host);
    }
    .in_current_span(),
  );

  let client_to_remote = async {
    let res = tap::copy(&mut client_read, &mut to_remote).await;
    debug!("client -> remote finished: {:?}", res);
    let _ = to_remote.shutdown().await;
  };
  let remote_to_client = async {
    let res = tap::copy(&mut remote_read, &mut to_client).await;
    debug!("remote -> client finished: {:?}", res);
    let _ = to_client.shutdown().await;
  };
  tokio::join!(client_to_remote, remote_to_client);
}
