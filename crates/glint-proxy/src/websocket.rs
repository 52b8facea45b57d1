use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub type BoxedReadHalf = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// Relays an upgraded WebSocket connection after the 101 handshake has
/// been written to the client. Frame parsing is out of scope here; the
/// default implementation shuttles raw bytes. The buffered vectors carry
/// bytes each side already produced before hand-off (pipelined client
/// frames, server frames read behind the response head).
pub trait WebSocketRelay: Send + Sync + 'static {
    #[allow(clippy::too_many_arguments)]
    fn relay(
        &self,
        client_read: BoxedReadHalf,
        client_write: BoxedWriteHalf,
        client_buffered: Vec<u8>,
        upstream_read: BoxedReadHalf,
        upstream_write: BoxedWriteHalf,
        upstream_buffered: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;
}

/// Byte-level relay: flushes whatever either side already buffered, then
/// copies both directions until the tunnel drains, half-closing each
/// destination when its source reaches EOF.
#[derive(Debug, Default)]
pub struct PassthroughWebSocketRelay;

impl WebSocketRelay for PassthroughWebSocketRelay {
    fn relay(
        &self,
        mut client_read: BoxedReadHalf,
        mut client_write: BoxedWriteHalf,
        client_buffered: Vec<u8>,
        mut upstream_read: BoxedReadHalf,
        mut upstream_write: BoxedWriteHalf,
        upstream_buffered: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send>> {
        Box::pin(async move {
            if !client_buffered.is_empty() {
                upstream_write.write_all(&client_buffered).await?;
            }
            if !upstream_buffered.is_empty() {
                client_write.write_all(&upstream_buffered).await?;
            }

            let uplink = async {
                let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
                let _ = upstream_write.shutdown().await;
                copied
            };
            let downlink = async {
                let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
                let _ = client_write.shutdown().await;
                copied
            };
            let (uplink_result, downlink_result) = tokio::join!(uplink, downlink);
            tolerate_disconnect(uplink_result)?;
            tolerate_disconnect(downlink_result)?;
            Ok(())
        })
    }
}

fn tolerate_disconnect(result: io::Result<u64>) -> io::Result<u64> {
    match result {
        Ok(bytes) => Ok(bytes),
        Err(error) if is_disconnect(&error) => Ok(0),
        Err(error) => Err(error),
    }
}

fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
