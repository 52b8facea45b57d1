use std::io;
use std::sync::Arc;

use glint_http1::{
    is_websocket_handshake, BodyMode, BodyRead, ChunkedWriter, HeaderBlock, RequestHead,
    IO_CHUNK_SIZE,
};
use glint_observe::{ConnectionRegistry, ExchangeRecorder, TrafficCounter};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::config::ProxyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WireFraming {
    Raw,
    Chunked,
}

/// Drains a body stack into a writer, re-framing as requested. Returns the
/// decoded byte count delivered.
pub(crate) async fn pump_body<B: BodyRead, W: AsyncWrite + Unpin>(
    body: &mut B,
    writer: &mut W,
    framing: WireFraming,
    flush_each: bool,
) -> io::Result<u64> {
    let mut total = 0_u64;
    let mut buf = [0_u8; IO_CHUNK_SIZE];
    match framing {
        WireFraming::Raw => loop {
            let read = body.read(&mut buf).await?;
            if read == 0 {
                return Ok(total);
            }
            writer.write_all(&buf[..read]).await?;
            if flush_each {
                writer.flush().await?;
            }
            total += read as u64;
        },
        WireFraming::Chunked => {
            let mut chunked = ChunkedWriter::new(writer);
            loop {
                let read = body.read(&mut buf).await?;
                if read == 0 {
                    chunked.finish().await?;
                    return Ok(total);
                }
                chunked.write_chunk(&buf[..read]).await?;
                if flush_each {
                    chunked.flush().await?;
                }
                total += read as u64;
            }
        }
    }
}

/// Buffers an entire body stack into memory, for round-tripper overrides
/// that need the request body up front.
pub(crate) async fn read_all<B: BodyRead>(body: &mut B) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0_u8; IO_CHUNK_SIZE];
    loop {
        let read = body.read(&mut buf).await?;
        if read == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..read]);
    }
}

/// Source for the client-bound response body: streamed off the upstream
/// connection, or bytes a filter swapped in.
pub(crate) enum ResponseSource<U> {
    Upstream(U),
    Replaced(glint_http1::BytesBody),
}

impl<U: BodyRead> BodyRead for ResponseSource<U> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Upstream(body) => body.read(buf).await,
            Self::Replaced(body) => body.read(buf).await,
        }
    }
}

/// Proxy-hop headers never travel upstream, except that a WebSocket
/// handshake keeps its Connection header intact.
pub(crate) fn strip_proxy_headers(config: &ProxyConfig, request: &mut RequestHead) {
    if config.keep_proxy_headers {
        return;
    }
    if !config.keep_accept_encoding {
        request.headers.remove("Accept-Encoding");
    }
    request.headers.remove("Proxy-Connection");
    request.headers.remove("Proxy-Authenticate");
    request.headers.remove("Proxy-Authorization");
    if !is_websocket_handshake(&request.headers) {
        request.headers.remove("Connection");
    }
}

/// Rebuilds the client-facing header block from the origin's. Pre-existing
/// entries in `dst` survive only in keep-dest-headers mode.
pub(crate) fn build_headers(dst: &mut HeaderBlock, src: &HeaderBlock, keep_dest_headers: bool) {
    if !keep_dest_headers {
        *dst = HeaderBlock::new();
    }
    for header in src.iter() {
        dst.push(header.name.clone(), header.value.clone());
    }
}

/// Capture upload size hint derived from the wire framing.
pub(crate) fn declared_capture_length(mode: BodyMode) -> Option<u64> {
    match mode {
        BodyMode::None => Some(0),
        BodyMode::ContentLength(length) => Some(length),
        BodyMode::Chunked | BodyMode::CloseDelimited => None,
    }
}

pub(crate) fn bad_gateway_bytes(message: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{message}",
        message.len()
    )
    .into_bytes()
}

pub(crate) async fn write_bad_gateway<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &str,
) -> io::Result<()> {
    writer.write_all(&bad_gateway_bytes(message)).await
}

pub(crate) async fn write_plain_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: &str,
    body: &str,
) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    writer.write_all(response.as_bytes()).await
}

/// Terminal bookkeeping for an exchange that died before its response body
/// close hook could run.
pub(crate) fn fail_exchange(
    recorder: &Arc<ExchangeRecorder>,
    counter: &Arc<TrafficCounter>,
    registry: &Arc<ConnectionRegistry>,
    session: u64,
    error: String,
) {
    recorder.set_error(error);
    counter.update_total();
    recorder.emit(counter);
    registry.mark_closed(session);
}

/// Authority for URL display: elides the scheme's default port the way
/// clients write URLs.
pub(crate) fn display_authority(authority: &str, default_port: u16) -> String {
    let suffix = format!(":{default_port}");
    match authority.strip_suffix(&suffix) {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => authority.to_string(),
    }
}
