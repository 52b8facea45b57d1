use std::io;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use glint_capture::BlobStore;
use glint_http1::{parse_connect_authority, parse_request_head, BufferedStream, RequestHead};
use glint_observe::{
    exchange_log, ConnectionInfo, ConnectionRegistry, ConnectionStatus, Exchange, ExchangeLog,
    LiveTraffic, Protocol, TrafficCounter, TrafficGauges, TunnelCounters,
};
use glint_tls::{
    upstream_client_config, AuthorityConfig, CertificateAuthority, SigningAuthority,
};
use rustls::ClientConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::body_relay::{bad_gateway_bytes, write_plain_response};
use crate::config::ProxyConfig;
use crate::context::{ExchangeContext, SessionIds};
use crate::errors::ProxyError;
use crate::filters::FilterChain;
use crate::forward::{run_plain_forward, DirectHandler, ErrorPageDirectHandler};
use crate::http_mitm::run_http_mitm;
use crate::strategy::{decide_connect, ConnectStrategy};
use crate::tls_mitm::run_tls_mitm;
use crate::tunnel::{relay_tunnel, CountingStream};
use crate::upstream::{DialOverrides, MultiDialFn, RequestDialFn};
use crate::websocket::{PassthroughWebSocketRelay, WebSocketRelay};

/// Called when an opaque tunnel fails before or during the relay; returns
/// the raw bytes to write back to the client.
pub type ConnectionErrorHandler =
    dyn Fn(&ExchangeContext, &io::Error) -> Vec<u8> + Send + Sync;

pub(crate) struct ProxyCore {
    pub(crate) config: ProxyConfig,
    pub(crate) filters: FilterChain,
    pub(crate) authority: Arc<dyn CertificateAuthority>,
    pub(crate) blob_store: Option<Arc<dyn BlobStore>>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) gauges: Arc<TrafficGauges>,
    pub(crate) exchange_log: Arc<ExchangeLog>,
    pub(crate) sessions: SessionIds,
    pub(crate) dialers: DialOverrides,
    pub(crate) websocket_relay: Arc<dyn WebSocketRelay>,
    pub(crate) connection_error_handler: Option<Arc<ConnectionErrorHandler>>,
    pub(crate) direct_handler: Arc<dyn DirectHandler>,
    pub(crate) upstream_tls: Arc<ClientConfig>,
}

pub struct ProxyServerBuilder {
    config: ProxyConfig,
    filters: FilterChain,
    authority: Option<Arc<dyn CertificateAuthority>>,
    blob_store: Option<Arc<dyn BlobStore>>,
    dialers: DialOverrides,
    websocket_relay: Arc<dyn WebSocketRelay>,
    connection_error_handler: Option<Arc<ConnectionErrorHandler>>,
    direct_handler: Arc<dyn DirectHandler>,
}

impl ProxyServerBuilder {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            filters: FilterChain::new(),
            authority: None,
            blob_store: None,
            dialers: DialOverrides::default(),
            websocket_relay: Arc::new(PassthroughWebSocketRelay),
            connection_error_handler: None,
            direct_handler: Arc::new(ErrorPageDirectHandler),
        }
    }

    pub fn with_filters(mut self, filters: FilterChain) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_authority(mut self, authority: Arc<dyn CertificateAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn with_blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    pub fn with_multi_dialer(mut self, dialer: Arc<MultiDialFn>) -> Self {
        self.dialers.connect_multi_dial = Some(dialer);
        self
    }

    pub fn with_request_dialer(mut self, dialer: Arc<RequestDialFn>) -> Self {
        self.dialers.connect_with_req_dial = Some(dialer);
        self
    }

    pub fn with_websocket_relay(mut self, relay: Arc<dyn WebSocketRelay>) -> Self {
        self.websocket_relay = relay;
        self
    }

    pub fn with_connection_error_handler(
        mut self,
        handler: Arc<ConnectionErrorHandler>,
    ) -> Self {
        self.connection_error_handler = Some(handler);
        self
    }

    pub fn with_direct_handler(mut self, handler: Arc<dyn DirectHandler>) -> Self {
        self.direct_handler = handler;
        self
    }

    pub fn build(self) -> Result<ProxyServer, ProxyError> {
        self.config.validate()?;

        let authority: Arc<dyn CertificateAuthority> = match self.authority {
            Some(authority) => authority,
            None => Arc::new(SigningAuthority::new(AuthorityConfig {
                ca_cert_pem_path: self.config.ca_cert_pem_path.clone(),
                ca_key_pem_path: self.config.ca_key_pem_path.clone(),
                common_name: self.config.ca_common_name.clone(),
                organization: self.config.ca_organization.clone(),
                leaf_cache_capacity: self.config.leaf_cache_capacity,
            })?),
        };

        let (log, exchange_rx) = exchange_log(self.config.exchange_backlog);
        let upstream_tls =
            upstream_client_config(self.config.upstream_tls_insecure_skip_verify);

        let core = ProxyCore {
            config: self.config,
            filters: self.filters,
            authority,
            blob_store: self.blob_store,
            registry: Arc::new(ConnectionRegistry::new()),
            gauges: Arc::new(TrafficGauges::default()),
            exchange_log: log,
            sessions: SessionIds::default(),
            dialers: self.dialers,
            websocket_relay: self.websocket_relay,
            connection_error_handler: self.connection_error_handler,
            direct_handler: self.direct_handler,
            upstream_tls,
        };
        Ok(ProxyServer {
            core: Arc::new(core),
            exchange_rx: Mutex::new(Some(exchange_rx)),
        })
    }
}

/// Accepts client connections and dispatches them: CONNECT through the
/// strategy engine into one of the tunnel pipelines, absolute-form
/// requests through the plain forward path, anything else to the direct
/// handler.
pub struct ProxyServer {
    core: Arc<ProxyCore>,
    exchange_rx: Mutex<Option<mpsc::Receiver<Exchange>>>,
}

impl ProxyServer {
    pub fn builder(config: ProxyConfig) -> ProxyServerBuilder {
        ProxyServerBuilder::new(config)
    }

    /// The stream of completed exchange records; callable once.
    pub fn take_exchanges(&self) -> Option<mpsc::Receiver<Exchange>> {
        self.exchange_rx.lock().expect("exchange receiver lock").take()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.core.registry)
    }

    pub fn gauges(&self) -> Arc<TrafficGauges> {
        Arc::clone(&self.core.gauges)
    }

    pub fn ca_certificate_pem(&self) -> Result<String, glint_tls::TlsError> {
        self.core.authority.ca_certificate_pem()
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        let bind_addr = format!(
            "{}:{}",
            self.core.config.listen_addr, self.core.config.listen_port
        );
        TcpListener::bind(&bind_addr).await
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, client_addr) = listener.accept().await?;
            let core = Arc::clone(&self.core);
            tokio::spawn(async move {
                if let Err(error) =
                    handle_client(core, stream, client_addr.to_string()).await
                {
                    tracing::warn!(error = %error, "connection handling failed");
                }
            });
        }
    }
}

async fn handle_client(
    core: Arc<ProxyCore>,
    stream: TcpStream,
    remote_addr: String,
) -> io::Result<()> {
    let mut conn = BufferedStream::new(stream);
    let raw_head = match conn
        .read_until(b"\r\n\r\n", core.config.max_connect_head_bytes)
        .await
    {
        Ok(Some(raw)) => raw,
        Ok(None) => return Ok(()),
        Err(error) => {
            if error.kind() == io::ErrorKind::InvalidData {
                let _ = write_plain_response(
                    conn.stream_mut(),
                    "431 Request Header Fields Too Large",
                    "request head exceeded configured limit",
                )
                .await;
            }
            return Ok(());
        }
    };

    let mut head = match parse_request_head(&raw_head) {
        Ok(head) => head,
        Err(error) => {
            let _ = write_plain_response(
                conn.stream_mut(),
                "400 Bad Request",
                &error.to_string(),
            )
            .await;
            return Ok(());
        }
    };
    if !core.config.prevent_canonicalization {
        head.headers.canonicalize();
    }

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(core, conn, head, remote_addr).await
    } else {
        run_plain_forward(core, conn, head, remote_addr).await
    }
}

async fn handle_connect(
    core: Arc<ProxyCore>,
    mut conn: BufferedStream<TcpStream>,
    connect_head: RequestHead,
    remote_addr: String,
) -> io::Result<()> {
    let tunnel_session = core.sessions.allocate();
    let tunnel_counter = Arc::new(TrafficCounter::new());
    let mut ctx = ExchangeContext::new(tunnel_session, None);
    ctx.counter = Arc::clone(&tunnel_counter);
    ctx.request = Some(connect_head.clone());

    let decision = decide_connect(&core.filters, &connect_head.target, &mut ctx);
    tracing::debug!(
        session = tunnel_session,
        host = %decision.host,
        strategy = ?decision.strategy,
        "CONNECT decision"
    );
    let round_tripper = ctx.round_tripper.clone();

    match decision.strategy {
        ConnectStrategy::Reject => {
            let _ = write_plain_response(
                conn.stream_mut(),
                "403 Forbidden",
                "CONNECT rejected by policy",
            )
            .await;
            Ok(())
        }
        ConnectStrategy::Accept => {
            accept_tunnel(core, conn, decision.host, remote_addr, tunnel_session, ctx).await
        }
        ConnectStrategy::HttpMitm => {
            run_http_mitm(
                core,
                conn,
                remote_addr,
                tunnel_session,
                tunnel_counter,
                decision.host,
                round_tripper,
            )
            .await
        }
        ConnectStrategy::TlsMitm { authority } => {
            let authority = authority.or_else(|| ctx.cert_authority.clone());
            let (stream, leftover) = conn.into_parts();
            run_tls_mitm(
                core,
                stream,
                leftover,
                remote_addr,
                tunnel_session,
                tunnel_counter,
                decision.host,
                authority,
                round_tripper,
            )
            .await
        }
        ConnectStrategy::Hijack(hijacker) => {
            let (stream, leftover) = conn.into_parts();
            hijacker.hijack(stream, leftover, ctx).await;
            Ok(())
        }
    }
}

async fn accept_tunnel(
    core: Arc<ProxyCore>,
    mut conn: BufferedStream<TcpStream>,
    host: String,
    remote_addr: String,
    tunnel_session: u64,
    ctx: ExchangeContext,
) -> io::Result<()> {
    let addr = match parse_connect_authority(&host) {
        Ok(target) => target.authority_or(80),
        Err(_) => host.clone(),
    };

    let upstream = match core.dialers.dial(ctx.request.as_ref(), &addr).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::warn!(
                session = tunnel_session,
                host = %host,
                error = %error,
                "tunnel dial failed"
            );
            let payload = match &core.connection_error_handler {
                Some(handler) => handler(&ctx, &error),
                None => bad_gateway_bytes(&error.to_string()),
            };
            let _ = conn.stream_mut().write_all(&payload).await;
            return Ok(());
        }
    };

    conn.stream_mut()
        .write_all(b"HTTP/1.0 200 Connection established\r\n\r\n")
        .await?;
    tracing::debug!(session = tunnel_session, host = %host, "accepting CONNECT tunnel");

    let counters = Arc::new(TunnelCounters::default());
    core.registry.store(ConnectionInfo {
        session: tunnel_session,
        parent_session: None,
        host: host.clone(),
        method: "TUNNEL".to_string(),
        url: host.clone(),
        remote_addr,
        protocol: Protocol::HttpsTunnel,
        started_at: SystemTime::now(),
        status: ConnectionStatus::Active,
        ended_at: None,
        live: LiveTraffic::Tunnel(Arc::clone(&counters)),
    });

    let (stream, leftover) = conn.into_parts();
    if !leftover.is_empty() {
        counters.add_read(leftover.len() as u64);
        core.gauges.add_up(leftover.len() as u64);
    }

    let registry = Arc::clone(&core.registry);
    let counting = CountingStream::new(stream, Arc::clone(&counters), Arc::clone(&core.gauges))
        .on_close(move || registry.mark_closed(tunnel_session));

    match relay_tunnel(counting, leftover, upstream).await {
        Ok((from_client, from_server)) => {
            tracing::debug!(
                session = tunnel_session,
                bytes_up = from_client,
                bytes_down = from_server,
                "tunnel drained"
            );
            Ok(())
        }
        Err(error) => {
            tracing::warn!(session = tunnel_session, error = %error, "tunnel relay failed");
            Ok(())
        }
    }
}
