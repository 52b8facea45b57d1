use std::future::Future;
use std::io;

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::conn::BufferedStream;
use crate::head::BodyMode;

const CHUNK_LINE_LIMIT: usize = 8 * 1024;

/// Pull-based body source. Layered wrappers (byte counting, capture tee)
/// implement the same trait so pipelines stay generic over the stack.
pub trait BodyRead: Send {
    /// Returns decoded body bytes; 0 means the body is complete.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

enum FrameState {
    Done,
    Sized { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    UntilEof,
}

/// Decodes one message body off a buffered connection according to its
/// framing. Chunked bodies are de-chunked; the caller re-frames on output.
pub struct FramedBody<'a, S> {
    conn: &'a mut BufferedStream<S>,
    state: FrameState,
}

impl<'a, S: AsyncRead + Send + Unpin> FramedBody<'a, S> {
    pub fn new(conn: &'a mut BufferedStream<S>, mode: BodyMode) -> Self {
        let state = match mode {
            BodyMode::None => FrameState::Done,
            BodyMode::ContentLength(length) if length == 0 => FrameState::Done,
            BodyMode::ContentLength(length) => FrameState::Sized { remaining: length },
            BodyMode::Chunked => FrameState::ChunkSize,
            BodyMode::CloseDelimited => FrameState::UntilEof,
        };
        Self { conn, state }
    }

    async fn read_sized(&mut self, buf: &mut [u8], remaining: u64) -> io::Result<usize> {
        let want = std::cmp::min(buf.len() as u64, remaining) as usize;
        let read = self.conn.read_some(&mut buf[..want]).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before body completed",
            ));
        }
        let left = remaining - read as u64;
        self.state = if left == 0 {
            FrameState::Done
        } else {
            FrameState::Sized { remaining: left }
        };
        Ok(read)
    }

    async fn next_chunk(&mut self) -> io::Result<()> {
        let line = self
            .conn
            .read_until(b"\r\n", CHUNK_LINE_LIMIT)
            .await?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before chunk size line",
                )
            })?;
        let length = parse_chunk_len(&line)?;
        if length == 0 {
            self.consume_trailers().await?;
            self.state = FrameState::Done;
        } else {
            self.state = FrameState::ChunkData { remaining: length };
        }
        Ok(())
    }

    async fn read_chunk_data(&mut self, buf: &mut [u8], remaining: u64) -> io::Result<usize> {
        let want = std::cmp::min(buf.len() as u64, remaining) as usize;
        let read = self.conn.read_some(&mut buf[..want]).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside a chunk",
            ));
        }
        let left = remaining - read as u64;
        if left == 0 {
            let terminator = self.conn.read_exact_buffered(2).await?;
            if terminator != b"\r\n" {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid chunk terminator",
                ));
            }
            self.state = FrameState::ChunkSize;
        } else {
            self.state = FrameState::ChunkData { remaining: left };
        }
        Ok(read)
    }

    async fn consume_trailers(&mut self) -> io::Result<()> {
        loop {
            let line = self
                .conn
                .read_until(b"\r\n", CHUNK_LINE_LIMIT)
                .await?
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside chunked trailers",
                    )
                })?;
            if line == b"\r\n" {
                return Ok(());
            }
        }
    }
}

impl<S: AsyncRead + Send + Unpin> BodyRead for FramedBody<'_, S> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                FrameState::Done => return Ok(0),
                FrameState::Sized { remaining } => return self.read_sized(buf, remaining).await,
                FrameState::ChunkSize => self.next_chunk().await?,
                FrameState::ChunkData { remaining } => {
                    return self.read_chunk_data(buf, remaining).await
                }
                FrameState::UntilEof => {
                    let read = self.conn.read_some(buf).await?;
                    if read == 0 {
                        self.state = FrameState::Done;
                    }
                    return Ok(read);
                }
            }
        }
    }
}

fn parse_chunk_len(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk size line had invalid UTF-8"))?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk size line had invalid hex length"))
}

/// In-memory body, used for synthetic and filter-replaced responses.
pub struct BytesBody {
    data: Bytes,
    offset: usize,
}

impl BytesBody {
    pub fn new(data: Bytes) -> Self {
        Self { data, offset: 0 }
    }
}

impl BodyRead for BytesBody {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.offset..];
        let take = std::cmp::min(buf.len(), remaining.len());
        buf[..take].copy_from_slice(&remaining[..take]);
        self.offset += take;
        Ok(take)
    }
}
