use std::io;
use std::sync::Arc;

use glint_http1::{strip_port, BufferedStream, RequestReader};
use glint_observe::TrafficCounter;
use glint_tls::CertificateAuthority;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::mitm::{serve_mitm_exchange, ExchangeOutcome, TunnelScope};
use crate::server::ProxyCore;
use crate::tunnel::PrefixedStream;
use crate::upstream::{connect_upstream, MaybeTlsStream, RoundTripper, Scheme};

/// TLS-terminating MITM: handshakes toward the client with a certificate
/// forged for the tunnel host, re-encrypts toward the origin, and runs the
/// same pipelined exchange loop as the plaintext variant. A failed
/// handshake closes the tunnel without emitting any exchange.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_tls_mitm(
    core: Arc<ProxyCore>,
    mut client: TcpStream,
    leftover: Vec<u8>,
    remote_addr: String,
    tunnel_session: u64,
    tunnel_counter: Arc<TrafficCounter>,
    host: String,
    authority_override: Option<Arc<dyn CertificateAuthority>>,
    round_tripper: Option<Arc<dyn RoundTripper>>,
) -> io::Result<()> {
    client.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await?;
    tracing::debug!(session = tunnel_session, host = %host, "TLS MITM tunnel established");

    let hostname = strip_port(&host).to_string();
    let authority = authority_override.unwrap_or_else(|| Arc::clone(&core.authority));
    let server_config = match authority.server_config_for_host(&hostname) {
        Ok(config) => config,
        Err(error) => {
            tracing::warn!(
                session = tunnel_session,
                host = %host,
                error = %error,
                "cannot sign host certificate"
            );
            return Ok(());
        }
    };

    let acceptor = TlsAcceptor::from(server_config);
    let tls = match acceptor
        .accept(PrefixedStream::new(client, leftover))
        .await
    {
        Ok(stream) => stream,
        Err(error) => {
            tracing::warn!(
                session = tunnel_session,
                host = %host,
                error = %error,
                "client TLS handshake failed"
            );
            return Ok(());
        }
    };

    let mut reader = RequestReader::new(tls, core.config.prevent_canonicalization);
    let mut upstream: Option<BufferedStream<MaybeTlsStream>> = None;
    let scope = TunnelScope {
        host: &host,
        remote_addr: &remote_addr,
        tunnel_session,
        tunnel_counter: &tunnel_counter,
        secure: true,
    };
    let mut upgraded = false;

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
                        "TLS MITM request parse failed"
                    );
                }
                break;
            }
        };

        let dial_core = Arc::clone(&core);
        let addr = scope.upstream_addr();
        let sni = hostname.clone();
        let outcome = serve_mitm_exchange(
            &core,
            &scope,
            &mut reader,
            &mut upstream,
            request,
            round_tripper.clone(),
            move |head| async move {
                connect_upstream(
                    Scheme::Https,
                    &addr,
                    &sni,
                    &dial_core.dialers,
                    Some(&head),
                    &dial_core.upstream_tls,
                )
                .await
            },
        )
        .await;
        match outcome {
            ExchangeOutcome::Continue => continue,
            ExchangeOutcome::Upgrade => {
                upgraded = true;
                break;
            }
            ExchangeOutcome::Abort => break,
        }
    }

    if upgraded {
        if let Some(up) = upstream.take() {
            let (client_stream, client_buffered) = reader.into_inner().into_parts();
            let (upstream_stream, upstream_buffered) = up.into_parts();
            let (client_read, client_write) = tokio::io::split(client_stream);
            let (upstream_read, upstream_write) = tokio::io::split(upstream_stream);
            if let Err(error) = core
                .websocket_relay
                .relay(
                    Box::new(client_read),
                    Box::new(client_write),
                    client_buffered,
                    Box::new(upstream_read),
                    Box::new(upstream_write),
                    upstream_buffered,
                )
                .await
            {
                tracing::warn!(session = tunnel_session, error = %error, "websocket relay failed");
            }
        }
        tunnel_counter.update_total();
        return Ok(());
    }

    tunnel_counter.update_total();
    tracing::debug!(session = tunnel_session, "TLS MITM tunnel drained");
    Ok(())
}
