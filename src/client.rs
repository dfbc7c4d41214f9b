//! Client requester: one connection, one request, one response.

use bytes::{Buf, Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::error::{Result, TransferError};
use crate::protocol::{
    encode_request, parse_status_line, ParseResult, ResponseMode, StatusLine, MAX_STATUS_LINE,
};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Performs request/response cycles against a configured server.
#[derive(Debug, Clone)]
pub struct Requester {
    config: ClientConfig,
}

impl Requester {
    pub fn new(config: ClientConfig) -> Self {
        Requester { config }
    }

    /// Fetch `path` and return the whole response body.
    pub async fn fetch(&self, path: &str) -> Result<Bytes> {
        let mut body = Vec::new();
        self.fetch_to(path, &mut body).await?;
        Ok(Bytes::from(body))
    }

    /// Fetch `path`, streaming the body into `writer`.
    ///
    /// Returns the number of body bytes written.
    pub async fn fetch_to<W>(&self, path: &str, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let request = encode_request(path)?;
        let mut stream = self.connect().await?;
        self.bounded("sending request", stream.write_all(&request)).await?;
        trace!(path, "Request sent");

        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
        let limit = self.config.max_response_size;

        let expected = match self.config.mode {
            ResponseMode::Status => {
                let length = self.read_status(&mut stream, &mut buffer).await?;
                if length > limit {
                    return Err(TransferError::ResponseTooLarge { limit });
                }
                Some(length)
            }
            ResponseMode::Raw => None,
        };

        let mut received: u64 = 0;
        loop {
            if !buffer.is_empty() {
                let available = buffer.len() as u64;
                let take = match expected {
                    // Anything past the advertised length is discarded.
                    Some(length) => available.min(length - received),
                    None => {
                        if received + available > limit {
                            return Err(TransferError::ResponseTooLarge { limit });
                        }
                        available
                    }
                };

                writer
                    .write_all(&buffer[..take as usize])
                    .await
                    .map_err(TransferError::Output)?;
                received += take;
                buffer.clear();
            }

            if expected == Some(received) {
                break;
            }

            let n = self
                .bounded("reading response", stream.read_buf(&mut buffer))
                .await?;
            if n == 0 {
                break;
            }
        }
        writer.flush().await.map_err(TransferError::Output)?;

        if let Some(expected) = expected {
            if received < expected {
                return Err(TransferError::Truncated { expected, received });
            }
        }

        debug!(path, bytes = received, "Response received");
        Ok(received)
    }

    /// Fetch `path` into the file at `output`.
    ///
    /// The body is written to a sibling `.part` file that is renamed over
    /// `output` only after the whole response arrived; on failure it is
    /// removed and `output` is left untouched.
    pub async fn fetch_to_path(&self, path: &str, output: &Path) -> Result<u64> {
        let partial = partial_path(output);
        let result = self.fetch_into_file(path, &partial).await;

        match result {
            Ok(bytes) => {
                tokio::fs::rename(&partial, output)
                    .await
                    .map_err(TransferError::Output)?;
                Ok(bytes)
            }
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&partial).await {
                    trace!(error = %remove_err, "Failed to remove partial output");
                }
                Err(e)
            }
        }
    }

    async fn fetch_into_file(&self, path: &str, partial: &Path) -> Result<u64> {
        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(TransferError::Output)?;
        let bytes = self.fetch_to(path, &mut file).await?;
        file.sync_all().await.map_err(TransferError::Output)?;
        Ok(bytes)
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = (self.config.host.as_str(), self.config.port);
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransferError::Timeout("connecting")),
        };
        debug!(host = %self.config.host, port = self.config.port, "Connected");
        Ok(stream)
    }

    /// Read the status line, leaving any body bytes that followed it in
    /// `buffer`. Returns the advertised body length.
    async fn read_status(&self, stream: &mut TcpStream, buffer: &mut BytesMut) -> Result<u64> {
        loop {
            match parse_status_line(&buffer[..], MAX_STATUS_LINE) {
                ParseResult::Complete(StatusLine::Ok { length }, consumed) => {
                    buffer.advance(consumed);
                    return Ok(length);
                }
                ParseResult::Complete(StatusLine::Err { kind, message }, _) => {
                    return Err(TransferError::from_wire(kind, message));
                }
                ParseResult::TooLong => {
                    return Err(TransferError::MalformedResponse(
                        "status line too long".to_string(),
                    ))
                }
                ParseResult::Invalid(reason) => {
                    return Err(TransferError::MalformedResponse(reason))
                }
                ParseResult::Incomplete => {}
            }

            let n = self
                .bounded("reading status line", stream.read_buf(buffer))
                .await?;
            if n == 0 {
                return Err(TransferError::MalformedResponse(
                    "connection closed before status line".to_string(),
                ));
            }
        }
    }

    async fn bounded<T, F>(&self, what: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        match timeout(self.config.read_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransferError::Timeout(what)),
        }
    }
}

/// `<output>.part`, next to the final destination.
fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    output.with_file_name(name)
}
