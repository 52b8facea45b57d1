use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Chunked transfer-coding encoder over any writer. Each `write_chunk`
/// emits one size-prefixed chunk; `finish` writes the zero-size terminator.
pub struct ChunkedWriter<'a, W> {
    sink: &'a mut W,
}

impl<'a, W: AsyncWrite + Unpin> ChunkedWriter<'a, W> {
    pub fn new(sink: &'a mut W) -> Self {
        Self { sink }
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size_line = format!("{:x}\r\n", data.len());
        self.sink.write_all(size_line.as_bytes()).await?;
        self.sink.write_all(data).await?;
        self.sink.write_all(b"\r\n").await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.sink.flush().await
    }

    pub async fn finish(self) -> io::Result<()> {
        self.sink.write_all(b"0\r\n\r\n").await
    }
}
