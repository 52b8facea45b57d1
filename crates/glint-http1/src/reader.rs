use std::io;

use thiserror::Error;
use tokio::io::AsyncRead;

use crate::conn::BufferedStream;
use crate::head::{parse_request_head, HeadError, RequestHead};

#[derive(Debug, Error)]
pub enum ReadRequestError {
    #[error("network error while reading request head: {0}")]
    Io(#[from] io::Error),
    #[error("request head parse error: {0}")]
    Parse(#[from] HeadError),
}

impl ReadRequestError {
    /// Peer-closed conditions that end a pipelined loop without noise.
    pub fn is_connection_closed(&self) -> bool {
        match self {
            Self::Io(error) => matches!(
                error.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            Self::Parse(_) => false,
        }
    }
}

/// Reads one request head at a time from a client connection.
///
/// The wire parser keeps header names exactly as received. With
/// `preserve_casing` unset every name is rewritten to canonical MIME
/// casing, which is what policy code that never opted into raw casing
/// expects to match against.
pub struct RequestReader<S> {
    conn: BufferedStream<S>,
    preserve_casing: bool,
}

impl<S: AsyncRead + Unpin> RequestReader<S> {
    pub fn new(stream: S, preserve_casing: bool) -> Self {
        Self {
            conn: BufferedStream::new(stream),
            preserve_casing,
        }
    }

    pub fn from_buffered(conn: BufferedStream<S>, preserve_casing: bool) -> Self {
        Self {
            conn,
            preserve_casing,
        }
    }

    pub async fn is_eof(&mut self) -> io::Result<bool> {
        self.conn.at_eof().await
    }

    /// `Ok(None)` is a clean EOF between requests.
    pub async fn read_request(
        &mut self,
        max_head_bytes: usize,
    ) -> Result<Option<RequestHead>, ReadRequestError> {
        let raw = match self.conn.read_until(b"\r\n\r\n", max_head_bytes).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let mut head = parse_request_head(&raw)?;
        if !self.preserve_casing {
            head.headers.canonicalize();
        }
        Ok(Some(head))
    }

    pub fn conn_mut(&mut self) -> &mut BufferedStream<S> {
        &mut self.conn
    }

    pub fn into_inner(self) -> BufferedStream<S> {
        self.conn
    }
}
