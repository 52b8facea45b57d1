use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

pub const IO_CHUNK_SIZE: usize = 8 * 1024;

/// A byte stream with a growable read-ahead buffer in front of it.
///
/// Head parsing reads past message boundaries in whole socket chunks; the
/// overshoot stays in `read_buf` and is consumed by the next head or body
/// read on the same connection.
pub struct BufferedStream<S> {
    stream: S,
    read_buf: Vec<u8>,
}

impl<S> BufferedStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    pub fn with_leftover(stream: S, leftover: Vec<u8>) -> Self {
        Self {
            stream,
            read_buf: leftover,
        }
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn buffered(&self) -> &[u8] {
        &self.read_buf
    }

    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.read_buf)
    }
}

impl<S: AsyncRead + Unpin> BufferedStream<S> {
    /// Reads until `pattern` appears, returning everything up to and
    /// including it. `Ok(None)` means the peer closed cleanly before any
    /// byte arrived; EOF mid-message is an error.
    pub async fn read_until(
        &mut self,
        pattern: &[u8],
        max_bytes: usize,
    ) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(start) = find_subsequence(&self.read_buf, pattern) {
                let end = start + pattern.len();
                let bytes = self.read_buf.drain(..end).collect::<Vec<_>>();
                return Ok(Some(bytes));
            }

            if self.read_buf.len() > max_bytes {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message head exceeded configured limit",
                ));
            }

            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before message boundary was reached",
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
    }

    pub async fn read_exact_buffered(&mut self, exact_len: usize) -> io::Result<Vec<u8>> {
        while self.read_buf.len() < exact_len {
            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before fixed-length read completed",
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
        Ok(self.read_buf.drain(..exact_len).collect::<Vec<_>>())
    }

    /// Reads whatever is available, draining the read-ahead buffer first.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.read_buf.is_empty() {
            let take = std::cmp::min(buf.len(), self.read_buf.len());
            buf[..take].copy_from_slice(&self.read_buf[..take]);
            self.read_buf.drain(..take);
            return Ok(take);
        }
        self.stream.read(buf).await
    }

    /// Non-destructive EOF probe: blocks until at least one byte is
    /// available (kept in the buffer) or the peer closes.
    pub async fn at_eof(&mut self) -> io::Result<bool> {
        if !self.read_buf.is_empty() {
            return Ok(false);
        }
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = self.stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(true);
        }
        self.read_buf.extend_from_slice(&chunk[..read]);
        Ok(false)
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::BufferedStream;

    #[tokio::test]
    async fn read_until_returns_head_and_keeps_overshoot() {
        let input: &[u8] = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nbody-bytes";
        let mut conn = BufferedStream::new(input);
        let head = conn
            .read_until(b"\r\n\r\n", 1024)
            .await
            .expect("read head")
            .expect("head present");
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(conn.buffered(), b"body-bytes");
    }

    #[tokio::test]
    async fn read_until_reports_clean_eof_as_none() {
        let input: &[u8] = b"";
        let mut conn = BufferedStream::new(input);
        let head = conn.read_until(b"\r\n\r\n", 1024).await.expect("read head");
        assert!(head.is_none());
    }

    #[tokio::test]
    async fn read_until_rejects_truncated_head() {
        let input: &[u8] = b"GET / HTTP/1.1\r\nHost";
        let mut conn = BufferedStream::new(input);
        let error = conn
            .read_until(b"\r\n\r\n", 1024)
            .await
            .expect_err("must fail");
        assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn read_until_enforces_head_limit() {
        let input = vec![b'a'; 64 * 1024];
        let mut conn = BufferedStream::new(input.as_slice());
        let error = conn.read_until(b"\r\n\r\n", 16).await.expect_err("must fail");
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn at_eof_does_not_consume_data() {
        let input: &[u8] = b"x";
        let mut conn = BufferedStream::new(input);
        assert!(!conn.at_eof().await.expect("probe"));
        let mut buf = [0_u8; 4];
        let read = conn.read_some(&mut buf).await.expect("read");
        assert_eq!(&buf[..read], b"x");
        assert!(conn.at_eof().await.expect("probe"));
    }
}
