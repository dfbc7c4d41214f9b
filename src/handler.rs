//! Transfer handler: services exactly one request on one connection.
//!
//! Per-connection state machine:
//!
//! ```text
//! AwaitingRequestLine -> Validating -> Streaming -> Closed
//!          |                  |
//!          +------------------+--------------------> Closed
//! ```
//!
//! Every exit path shuts the stream down and drops the file handle.

use bytes::BytesMut;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::TransferLimits;
use crate::error::{Result, TransferError};
use crate::protocol::{parse_request_line, ParseResult, ResponseMode, StatusLine};
use crate::resolver::{lookup_error, PathResolver};

/// Immutable state shared by every connection of a server.
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub resolver: PathResolver,
    pub limits: TransferLimits,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    AwaitingRequestLine,
    Validating,
    Streaming,
    Closed,
}

/// Summary of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Path as requested by the client.
    pub path: String,
    /// Body bytes written, status line excluded.
    pub bytes_sent: u64,
    /// State the connection ended in.
    pub state: HandlerState,
}

/// Serve one request on `stream`.
///
/// In status mode, validation failures are reported with an `ERR` line
/// before the connection closes. In raw mode the connection is closed
/// without writing anything.
pub async fn handle_connection<S>(stream: S, ctx: &TransferContext) -> Result<TransferOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut transfer = Transfer {
        stream,
        ctx,
        state: HandlerState::AwaitingRequestLine,
    };

    let result = transfer.run().await;
    if let Err(ref e) = result {
        transfer.reject(e).await;
    }
    transfer.close().await;
    result.map(|outcome| TransferOutcome {
        state: transfer.state,
        ..outcome
    })
}

struct Transfer<'a, S> {
    stream: S,
    ctx: &'a TransferContext,
    state: HandlerState,
}

impl<S> Transfer<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn transition(&mut self, next: HandlerState) {
        trace!(from = ?self.state, to = ?next, "Handler state");
        self.state = next;
    }

    async fn run(&mut self) -> Result<TransferOutcome> {
        let request_timeout = self.ctx.limits.request_timeout;
        let path = match timeout(request_timeout, self.read_request_line()).await {
            Ok(result) => result?,
            Err(_) => return Err(TransferError::Timeout("awaiting request line")),
        };

        self.transition(HandlerState::Validating);
        let resolved = self.ctx.resolver.resolve(&path).await?;
        let file = File::open(&resolved).await.map_err(lookup_error)?;
        let length = file.metadata().await.map_err(lookup_error)?.len();

        self.transition(HandlerState::Streaming);
        trace!(path = %path, length, "Streaming file");
        let bytes_sent = self.stream_file(file, length).await?;

        Ok(TransferOutcome {
            path,
            bytes_sent,
            state: self.state,
        })
    }

    /// Read until the first newline, never buffering more than the
    /// configured maximum line length plus one byte.
    async fn read_request_line(&mut self) -> Result<String> {
        let max_len = self.ctx.limits.max_request_line;
        let mut buffer = BytesMut::with_capacity(max_len.saturating_add(1).min(8 * 1024));

        loop {
            match parse_request_line(&buffer, max_len) {
                ParseResult::Complete(path, _) => return Ok(path),
                ParseResult::TooLong => {
                    return Err(TransferError::InvalidRequest(format!(
                        "request line exceeds {max_len} bytes"
                    )))
                }
                ParseResult::Invalid(reason) => return Err(TransferError::InvalidRequest(reason)),
                ParseResult::Incomplete => {}
            }

            let remaining = max_len.saturating_add(1) - buffer.len();
            let n = (&mut self.stream)
                .take(remaining as u64)
                .read_buf(&mut buffer)
                .await?;
            if n == 0 {
                return Err(TransferError::InvalidRequest(
                    "connection closed before end of request line".to_string(),
                ));
            }
        }
    }

    async fn stream_file(&mut self, file: File, length: u64) -> Result<u64> {
        let ctx = self.ctx;
        let limits = &ctx.limits;
        if limits.mode == ResponseMode::Status {
            let header = StatusLine::Ok { length }.encode();
            self.write_bounded(&header).await?;
        }

        // The advertised length is authoritative in status mode.
        let mut reader = match limits.mode {
            ResponseMode::Status => file.take(length),
            ResponseMode::Raw => file.take(u64::MAX),
        };
        let mut chunk = BytesMut::with_capacity(limits.chunk_size);
        let mut sent: u64 = 0;

        loop {
            chunk.clear();
            let n = match (&mut reader)
                .take(limits.chunk_size as u64)
                .read_buf(&mut chunk)
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, sent, length, "File read failed mid-transfer");
                    return Err(TransferError::Truncated {
                        expected: length,
                        received: sent,
                    });
                }
            };
            if n == 0 {
                break;
            }

            self.write_bounded(&chunk).await?;
            sent += n as u64;
        }

        self.flush_bounded().await?;

        if limits.mode == ResponseMode::Status && sent < length {
            warn!(sent, length, "File shrank during transfer");
            return Err(TransferError::Truncated {
                expected: length,
                received: sent,
            });
        }

        Ok(sent)
    }

    async fn write_bounded(&mut self, data: &[u8]) -> Result<()> {
        let write_timeout = self.ctx.limits.write_timeout;
        match timeout(write_timeout, self.stream.write_all(data)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransferError::Timeout("writing response")),
        }
    }

    async fn flush_bounded(&mut self) -> Result<()> {
        let write_timeout = self.ctx.limits.write_timeout;
        match timeout(write_timeout, self.stream.flush()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransferError::Timeout("flushing response")),
        }
    }

    /// Report a failure to the client if nothing has been streamed yet.
    async fn reject(&mut self, err: &TransferError) {
        debug!(state = ?self.state, error = %err, "Request rejected");

        if self.ctx.limits.mode != ResponseMode::Status
            || self.state == HandlerState::Streaming
        {
            return;
        }

        if let Some(kind) = err.wire_kind() {
            let line = StatusLine::Err {
                kind,
                message: err.public_message().to_string(),
            }
            .encode();
            if let Err(e) = self.write_bounded(&line).await {
                trace!(error = %e, "Failed to send error status");
            }
        }
    }

    async fn close(&mut self) {
        self.transition(HandlerState::Closed);
        let write_timeout = self.ctx.limits.write_timeout;
        let _ = timeout(write_timeout, self.stream.shutdown()).await;
    }
}
