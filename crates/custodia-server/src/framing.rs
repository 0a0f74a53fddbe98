//! Line and byte framing over one connection.
//!
//! Text travels as `\n`-terminated UTF-8 lines, each written with a single
//! write. Binary bodies are announced by a decimal size (either a bare
//! `"<n>\n"` header or embedded in a `LISTO:` reply) and then read to exact
//! completion before line mode resumes, so TCP coalescing or fragmentation
//! can never blur a message boundary.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::warn;

use custodia_shared::constants::{CHUNK_SIZE, MAX_LINE_LEN};
use custodia_shared::protocol::Reply;

use crate::error::{FramingError, TransferError};

/// A framed connection. Generic over the byte stream so the same code runs
/// over TLS in production and over in-memory pipes in tests.
pub struct Connection<S> {
    stream: BufReader<S>,
    idle_timeout: Duration,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, idle_timeout: Duration) -> Self {
        Self {
            stream: BufReader::with_capacity(CHUNK_SIZE, stream),
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Send one line. Embedded newlines are flattened to spaces.
    pub async fn send_line(&mut self, text: &str) -> Result<(), FramingError> {
        let mut wire = String::with_capacity(text.len() + 1);
        wire.extend(text.chars().map(|c| if c == '\n' { ' ' } else { c }));
        wire.push('\n');

        let limit = self.idle_timeout;
        let stream = &mut self.stream;
        match timeout(limit, async {
            stream.write_all(wire.as_bytes()).await?;
            stream.flush().await
        })
        .await
        {
            Ok(result) => result.map_err(map_io),
            Err(_) => Err(FramingError::Timeout(limit)),
        }
    }

    pub async fn send_reply(&mut self, reply: &Reply) -> Result<(), FramingError> {
        self.send_line(&reply.to_line()).await
    }

    /// Receive one line, waiting at most the idle timeout.
    pub async fn recv_line(&mut self) -> Result<String, FramingError> {
        self.recv_line_within(self.idle_timeout).await
    }

    /// Receive one line, waiting at most `limit`. The trailing `\r\n` or `\n`
    /// is stripped. An over-long line is drained up to its newline and
    /// reported as [`FramingError::LineTooLong`], leaving the stream aligned
    /// on the next line.
    pub async fn recv_line_within(&mut self, limit: Duration) -> Result<String, FramingError> {
        match timeout(limit, self.read_line_limited()).await {
            Ok(result) => result,
            Err(_) => Err(FramingError::Timeout(limit)),
        }
    }

    async fn read_line_limited(&mut self) -> Result<String, FramingError> {
        let mut line = Vec::new();
        let mut overflow = false;

        loop {
            let (found_newline, used) = {
                let available = self.stream.fill_buf().await.map_err(map_io)?;
                if available.is_empty() {
                    return Err(FramingError::Closed);
                }
                match available.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        if !overflow {
                            line.extend_from_slice(&available[..pos]);
                        }
                        (true, pos + 1)
                    }
                    None => {
                        if !overflow {
                            line.extend_from_slice(available);
                        }
                        (false, available.len())
                    }
                }
            };
            self.stream.consume(used);

            if line.len() > MAX_LINE_LEN {
                overflow = true;
                line.clear();
            }
            if found_newline {
                break;
            }
        }

        if overflow {
            return Err(FramingError::LineTooLong { max: MAX_LINE_LEN });
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line).map_err(|_| FramingError::InvalidUtf8)
    }

    /// Read a newline-terminated ASCII decimal byte count.
    pub async fn recv_size_header(&mut self, limit: Duration) -> Result<u64, TransferError> {
        let line = self
            .recv_line_within(limit)
            .await
            .map_err(transfer_from_framing)?;
        let trimmed = line.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TransferError::InvalidSize(trimmed.to_string()));
        }
        trimmed
            .parse::<u64>()
            .map_err(|_| TransferError::InvalidSize(trimmed.to_string()))
    }

    /// Copy exactly `expected` bytes from the connection into `sink`, in
    /// chunks of at most [`CHUNK_SIZE`]. Each chunk must arrive within
    /// `chunk_timeout`. A short read is [`TransferError::PeerClosed`] and a
    /// stall is [`TransferError::Stalled`].
    ///
    /// If the sink fails, the rest of the body is still read and discarded
    /// before [`TransferError::Disk`] is returned, so the stream is left at a
    /// line boundary.
    pub async fn recv_exact_into<W>(
        &mut self,
        expected: u64,
        sink: &mut W,
        chunk_timeout: Duration,
    ) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received: u64 = 0;
        let mut disk_error: Option<std::io::Error> = None;

        while received < expected {
            let want = (expected - received).min(CHUNK_SIZE as u64) as usize;
            let n = match timeout(chunk_timeout, self.stream.read(&mut buf[..want])).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) if is_disconnect(&e) => 0,
                Ok(Err(e)) => return Err(TransferError::Connection(FramingError::Io(e))),
                Err(_) => return Err(TransferError::Stalled { received, expected }),
            };
            if n == 0 {
                return Err(TransferError::PeerClosed { received, expected });
            }
            received += n as u64;
            if disk_error.is_none() {
                if let Err(e) = sink.write_all(&buf[..n]).await {
                    warn!(error = %e, received, expected, "Sink failed, discarding rest of body");
                    disk_error = Some(e);
                }
            }
        }

        if disk_error.is_none() {
            disk_error = sink.flush().await.err();
        }
        match disk_error {
            Some(e) => Err(TransferError::Disk(e)),
            None => Ok(received),
        }
    }

    /// Read and drop exactly `expected` body bytes.
    pub async fn discard(&mut self, expected: u64, chunk_timeout: Duration) -> Result<u64, TransferError> {
        self.recv_exact_into(expected, &mut tokio::io::sink(), chunk_timeout)
            .await
    }

    /// Receive exactly `n` bytes into memory.
    pub async fn recv_exactly(&mut self, n: u64, chunk_timeout: Duration) -> Result<Vec<u8>, TransferError> {
        let mut out = Vec::with_capacity(n.min(CHUNK_SIZE as u64 * 16) as usize);
        self.recv_exact_into(n, &mut out, chunk_timeout).await?;
        Ok(out)
    }

    /// Stream exactly `len` bytes from `source` to the peer, in chunks of at
    /// most [`CHUNK_SIZE`]. Each chunk write must complete within
    /// `chunk_timeout`.
    pub async fn send_body<R>(
        &mut self,
        source: &mut R,
        len: u64,
        chunk_timeout: Duration,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent: u64 = 0;

        while sent < len {
            let want = (len - sent).min(CHUNK_SIZE as u64) as usize;
            let n = source
                .read(&mut buf[..want])
                .await
                .map_err(TransferError::Disk)?;
            if n == 0 {
                return Err(TransferError::SourceTruncated {
                    sent,
                    expected: len,
                });
            }
            let stream = &mut self.stream;
            match timeout(chunk_timeout, stream.write_all(&buf[..n])).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if is_disconnect(&e) => {
                    return Err(TransferError::PeerClosed {
                        received: sent,
                        expected: len,
                    })
                }
                Ok(Err(e)) => return Err(TransferError::Connection(FramingError::Io(e))),
                Err(_) => {
                    return Err(TransferError::Stalled {
                        received: sent,
                        expected: len,
                    })
                }
            }
            sent += n as u64;
        }

        match timeout(chunk_timeout, self.stream.flush()).await {
            Ok(Ok(())) => Ok(sent),
            Ok(Err(e)) => Err(TransferError::Connection(FramingError::Io(e))),
            Err(_) => Err(TransferError::Timeout(chunk_timeout)),
        }
    }

    /// Send a bare size header followed by the body.
    pub async fn send_frame<R>(
        &mut self,
        source: &mut R,
        len: u64,
        chunk_timeout: Duration,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        self.send_line(&len.to_string())
            .await
            .map_err(transfer_from_framing)?;
        self.send_body(source, len, chunk_timeout).await
    }

    /// Close the write half. Errors are irrelevant at this point.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.get_mut().shutdown().await;
    }
}

/// Lift a framing failure that happened mid-transfer into the transfer
/// taxonomy, keeping timeouts and disconnects distinct.
pub fn transfer_from_framing(e: FramingError) -> TransferError {
    match e {
        FramingError::Timeout(d) => TransferError::Timeout(d),
        FramingError::Closed => TransferError::PeerClosed {
            received: 0,
            expected: 0,
        },
        other => TransferError::Connection(other),
    }
}

fn is_disconnect(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe
    )
}

fn map_io(e: std::io::Error) -> FramingError {
    if is_disconnect(&e) {
        FramingError::Closed
    } else {
        FramingError::Io(e)
    }
}
