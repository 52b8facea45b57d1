use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use glint_observe::{TrafficGauges, TunnelCounters};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// Wraps the client side of an opaque tunnel: counts bytes per direction
/// into the tunnel counters and the process gauges. The close hook fires
/// once, when the stream is fully released (both split halves dropped).
pub struct CountingStream<S> {
    inner: S,
    counters: Arc<TunnelCounters>,
    gauges: Arc<TrafficGauges>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, counters: Arc<TunnelCounters>, gauges: Arc<TrafficGauges>) -> Self {
        Self {
            inner,
            counters,
            gauges,
            on_close: None,
        }
    }

    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }
}

impl<S> Drop for CountingStream<S> {
    fn drop(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = (buf.filled().len() - before) as u64;
                if read > 0 {
                    this.counters.add_read(read);
                    this.gauges.add_up(read);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                if written > 0 {
                    this.counters.add_write(written as u64);
                    this.gauges.add_down(written as u64);
                }
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Serves a byte prefix before delegating reads to the inner stream.
/// Lets a TLS handshake consume client bytes that arrived buffered behind
/// the CONNECT head.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let take = std::cmp::min(buf.remaining(), remaining.len());
            buf.put_slice(&remaining[..take]);
            this.offset += take;
            if this.offset == this.prefix.len() {
                this.prefix = Vec::new();
                this.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn tolerate_disconnect(result: io::Result<u64>) -> io::Result<u64> {
    match result {
        Ok(bytes) => Ok(bytes),
        Err(error)
            if matches!(
                error.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ) =>
        {
            Ok(0)
        }
        Err(error) => Err(error),
    }
}

/// Bidirectional copy with half-close discipline: when one direction hits
/// EOF its destination's write side is shut down, so the surviving
/// direction keeps flowing until the peer finishes. Returns bytes copied
/// client-to-target and target-to-client.
pub async fn relay_tunnel(
    client: CountingStream<TcpStream>,
    leftover: Vec<u8>,
    mut target: TcpStream,
) -> io::Result<(u64, u64)> {
    if !leftover.is_empty() {
        target.write_all(&leftover).await?;
    }

    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut target_rd, mut target_wr) = target.into_split();

    let uplink = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut client_rd, &mut target_wr).await;
        let _ = target_wr.shutdown().await;
        copied
    });
    let downlink = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut target_rd, &mut client_wr).await;
        let _ = client_wr.shutdown().await;
        copied
    });

    let uplink_bytes = tolerate_disconnect(flatten_join(uplink.await))?;
    let downlink_bytes = tolerate_disconnect(flatten_join(downlink.await))?;
    Ok((uplink_bytes, downlink_bytes))
}

fn flatten_join(result: Result<io::Result<u64>, tokio::task::JoinError>) -> io::Result<u64> {
    match result {
        Ok(inner) => inner,
        Err(error) => Err(io::Error::other(error)),
    }
}
