use std::io;
use std::sync::Arc;

use glint_http1::{BufferedStream, RequestReader};
use glint_observe::TrafficCounter;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::mitm::{serve_mitm_exchange, ExchangeOutcome, TunnelScope};
use crate::server::ProxyCore;
use crate::upstream::RoundTripper;

/// Plaintext pipelined MITM inside a client tunnel. One request at a time
/// from the client; the upstream TCP connection is dialed once and kept
/// alive across the loop.
pub(crate) async fn run_http_mitm(
    core: Arc<ProxyCore>,
    mut client: BufferedStream<TcpStream>,
    remote_addr: String,
    tunnel_session: u64,
    tunnel_counter: Arc<TrafficCounter>,
    host: String,
    round_tripper: Option<Arc<dyn RoundTripper>>,
) -> io::Result<()> {
    client.stream_mut().write_all(b"HTTP/1.0 200 OK\r\n\r\n").await?;
    tracing::debug!(session = tunnel_session, host = %host, "HTTP tunnel established, plaintext MITM");

    let mut reader =
        RequestReader::from_buffered(client, core.config.prevent_canonicalization);
    let mut upstream: Option<BufferedStream<TcpStream>> = None;
    let scope = TunnelScope {
        host: &host,
        remote_addr: &remote_addr,
        tunnel_session,
        tunnel_counter: &tunnel_counter,
        secure: false,
    };

    loop {
        match reader.is_eof().await {
            Ok(true) => break,
            Ok(false) => {}
            Err(_) => break,
        }
        let request = match reader.read_request(core.config.max_http_head_bytes).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(error) => {
                if !error.is_connection_closed() {
                    tracing::warn!(
                        session = tunnel_session,
                        error = %error,
                        "HTTP MITM request parse failed"
                    );
                }
                break;
            }
        };

        let dial_core = Arc::clone(&core);
        let addr = scope.upstream_addr();
        let outcome = serve_mitm_exchange(
            &core,
            &scope,
            &mut reader,
            &mut upstream,
            request,
            round_tripper.clone(),
            move |head| async move {
                let stream = dial_core.dialers.dial(Some(&head), &addr).await?;
                Ok(BufferedStream::new(stream))
            },
        )
        .await;
        match outcome {
            ExchangeOutcome::Continue => continue,
            ExchangeOutcome::Abort | ExchangeOutcome::Upgrade => break,
        }
    }

    tunnel_counter.update_total();
    tracing::debug!(session = tunnel_session, "HTTP MITM tunnel drained");
    Ok(())
}
