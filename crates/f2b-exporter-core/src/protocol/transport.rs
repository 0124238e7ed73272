//! Sentinel-framed transport.
//!
//! fail2ban does not length-prefix its messages. Every request and every
//! response is terminated by [`END_COMMAND`]; a session is torn down by
//! sending [`CLOSE_COMMAND`] followed by [`END_COMMAND`].
//!
//! The functions here are generic over tokio's async I/O traits so the
//! same code drives a real `UnixStream` and an in-memory duplex pipe.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::value::{self, Command, EncodingError};

/// Terminates every request and response.
pub const END_COMMAND: &[u8] = b"<F2B_END_COMMAND>";

/// Asks the daemon to close the session.
pub const CLOSE_COMMAND: &[u8] = b"<F2B_CLOSE_COMMAND>";

/// Size of a single read from the socket.
pub const CHUNK_SIZE: usize = 512;

/// Errors from the framed transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("daemon closed the connection")]
    PeerClosed,

    #[error("no complete response within {0:?}")]
    Timeout(Duration),

    #[error("socket I/O failed: {0}")]
    Io(#[source] io::Error),

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => TransportError::PeerClosed,
            _ => TransportError::Io(err),
        }
    }
}

/// Where the end-of-command sentinel is searched for after each read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SentinelScan {
    /// Search everything read so far (starting just before the newest
    /// chunk), so a sentinel split across two reads is still found.
    #[default]
    Accumulated,
    /// Search only the newest chunk. A sentinel split across two reads is
    /// never found; the read then only ends when the peer closes or the
    /// caller's timeout fires.
    PerChunk,
}

impl std::str::FromStr for SentinelScan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accumulated" => Ok(SentinelScan::Accumulated),
            "per-chunk" => Ok(SentinelScan::PerChunk),
            other => Err(format!("unknown sentinel scan strategy {other:?}")),
        }
    }
}

/// Encode `cmd`, append the end sentinel and write it out.
pub async fn send_command<S>(stream: &mut S, cmd: &Command) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    let mut msg = value::encode(cmd)?;
    msg.extend_from_slice(END_COMMAND);
    debug!(command = %cmd, bytes = msg.len(), "sending command");

    stream.write_all(&msg).await?;
    stream.flush().await?;
    Ok(())
}

/// Read until the end sentinel and return everything before it.
///
/// Bytes the peer sent after the sentinel are discarded; fail2ban never
/// pipelines, so there are none in practice.
pub async fn receive_response<S>(
    stream: &mut S,
    scan: SentinelScan,
) -> Result<Vec<u8>, TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut msg = Vec::with_capacity(CHUNK_SIZE);
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            debug!(received = msg.len(), "stream ended before end sentinel");
            return Err(TransportError::PeerClosed);
        }

        let previous = msg.len();
        msg.extend_from_slice(&chunk[..n]);
        trace!(read = n, total = msg.len(), "read chunk");

        let found = match scan {
            SentinelScan::Accumulated => {
                let from = previous.saturating_sub(END_COMMAND.len() - 1);
                find(&msg[from..], END_COMMAND).map(|i| from + i)
            }
            SentinelScan::PerChunk => find(&chunk[..n], END_COMMAND).map(|i| previous + i),
        };

        if let Some(end) = found {
            msg.truncate(end);
            debug!(bytes = msg.len(), "received response");
            return Ok(msg);
        }
    }
}

/// Say goodbye to the daemon and release the socket.
///
/// Write errors are ignored: the socket is dropped either way. Passing
/// `None` (nothing open) does nothing.
pub async fn close_session<S>(stream: Option<S>)
where
    S: AsyncWrite + Unpin,
{
    let Some(mut stream) = stream else {
        return;
    };

    let mut msg = Vec::with_capacity(CLOSE_COMMAND.len() + END_COMMAND.len());
    msg.extend_from_slice(CLOSE_COMMAND);
    msg.extend_from_slice(END_COMMAND);

    let _ = stream.write_all(&msg).await;
    let _ = stream.shutdown().await;
    debug!("closed daemon session");
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::value::{Value, decode, encode_value};
    use pretty_assertions::assert_eq;
    use tokio::io::duplex;

    /// Pad a payload so the sentinel starts `offset` bytes before a chunk
    /// boundary.
    fn straddling_message(offset: usize) -> (Vec<u8>, usize) {
        let payload_len = CHUNK_SIZE - offset;
        let mut msg = vec![b'x'; payload_len];
        msg.extend_from_slice(END_COMMAND);
        (msg, payload_len)
    }

    /// Writes `parts` one by one with a short pause in between.
    async fn write_in_parts(mut tx: tokio::io::DuplexStream, parts: Vec<Vec<u8>>, close: bool) {
        for part in parts {
            tx.write_all(&part).await.unwrap();
            tx.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if close {
            drop(tx);
        } else {
            // Keep the pipe open until the reader gives up.
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    #[tokio::test]
    async fn test_send_appends_end_sentinel() {
        let (mut client, mut server) = duplex(4096);
        let cmd = Command::status(Some("sshd"));
        send_command(&mut client, &cmd).await.unwrap();
        drop(client);

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();
        assert!(wire.ends_with(END_COMMAND));

        let body = &wire[..wire.len() - END_COMMAND.len()];
        assert_eq!(decode(body).unwrap(), cmd.to_value());
    }

    #[tokio::test]
    async fn test_receive_single_chunk() {
        let (mut client, mut server) = duplex(4096);
        let payload = encode_value(&Value::Sequence(vec![Value::Integer(0), Value::from("pong")]))
            .unwrap();
        let mut msg = payload.clone();
        msg.extend_from_slice(END_COMMAND);
        server.write_all(&msg).await.unwrap();

        let got = receive_response(&mut client, SentinelScan::Accumulated)
            .await
            .unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn test_receive_spans_many_chunks() {
        let (mut client, server) = duplex(64);
        let payload: Vec<u8> = (0..3 * CHUNK_SIZE + 17).map(|i| (i % 251) as u8).collect();
        let mut msg = payload.clone();
        msg.extend_from_slice(END_COMMAND);

        let writer = tokio::spawn(write_in_parts(
            server,
            msg.chunks(100).map(<[u8]>::to_vec).collect(),
            true,
        ));

        let got = receive_response(&mut client, SentinelScan::Accumulated)
            .await
            .unwrap();
        assert_eq!(got, payload);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_accumulated_scan_finds_straddling_sentinel() {
        let (mut client, server) = duplex(4096);
        let (msg, payload_len) = straddling_message(5);
        let (first, second) = msg.split_at(CHUNK_SIZE);

        let writer = tokio::spawn(write_in_parts(
            server,
            vec![first.to_vec(), second.to_vec()],
            false,
        ));

        let got = tokio::time::timeout(
            Duration::from_secs(2),
            receive_response(&mut client, SentinelScan::Accumulated),
        )
        .await
        .expect("accumulated scan should not hang")
        .unwrap();
        assert_eq!(got.len(), payload_len);
        writer.abort();
    }

    #[tokio::test]
    async fn test_per_chunk_scan_misses_straddling_sentinel() {
        let (mut client, server) = duplex(4096);
        let (msg, _) = straddling_message(5);
        let (first, second) = msg.split_at(CHUNK_SIZE);

        let writer = tokio::spawn(write_in_parts(
            server,
            vec![first.to_vec(), second.to_vec()],
            true,
        ));

        // The sentinel is never seen, so the read only ends when the peer
        // closes the pipe.
        let result = receive_response(&mut client, SentinelScan::PerChunk).await;
        assert!(matches!(result, Err(TransportError::PeerClosed)));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_per_chunk_scan_finds_sentinel_inside_chunk() {
        let (mut client, mut server) = duplex(4096);
        let mut msg = b"payload".to_vec();
        msg.extend_from_slice(END_COMMAND);
        server.write_all(&msg).await.unwrap();

        let got = receive_response(&mut client, SentinelScan::PerChunk)
            .await
            .unwrap();
        assert_eq!(got, b"payload");
    }

    #[tokio::test]
    async fn test_eof_before_sentinel_is_peer_closed() {
        let (mut client, mut server) = duplex(4096);
        server.write_all(b"half a resp").await.unwrap();
        drop(server);

        let result = receive_response(&mut client, SentinelScan::Accumulated).await;
        assert!(matches!(result, Err(TransportError::PeerClosed)));
    }

    #[tokio::test]
    async fn test_close_session_writes_close_then_end() {
        let (client, mut server) = duplex(4096);
        close_session(Some(client)).await;

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire, [CLOSE_COMMAND, END_COMMAND].concat());
    }

    #[tokio::test]
    async fn test_close_session_without_stream_is_noop() {
        close_session::<tokio::io::DuplexStream>(None).await;
    }

    #[tokio::test]
    async fn test_close_session_ignores_write_errors() {
        let (client, server) = duplex(16);
        drop(server);
        close_session(Some(client)).await;
    }

    #[test]
    fn test_io_error_classification() {
        for kind in [io::ErrorKind::BrokenPipe, io::ErrorKind::ConnectionReset] {
            assert!(matches!(
                TransportError::from(io::Error::from(kind)),
                TransportError::PeerClosed
            ));
        }
        assert!(matches!(
            TransportError::from(io::Error::from(io::ErrorKind::PermissionDenied)),
            TransportError::Io(_)
        ));
    }

    #[test]
    fn test_sentinel_scan_from_str() {
        assert_eq!(
            "accumulated".parse::<SentinelScan>(),
            Ok(SentinelScan::Accumulated)
        );
        assert_eq!("per-chunk".parse::<SentinelScan>(), Ok(SentinelScan::PerChunk));
        assert!("whenever".parse::<SentinelScan>().is_err());
    }
}
