use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use glint_capture::{BodyDirection, CapturedBody, CountedBody};
use glint_http1::{
    encode_request_head, encode_response_head, is_websocket_handshake, parse_connect_authority,
    parse_response_head, BodyMode, BufferedStream, BytesBody, FramedBody, RequestHead,
    RequestReader,
};
use glint_observe::{
    ConnectionInfo, ConnectionStatus, ExchangeRecorder, LiveTraffic, Protocol, TrafficCounter,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::body_relay::{
    declared_capture_length, display_authority, fail_exchange, pump_body, read_all,
    strip_proxy_headers, write_bad_gateway, ResponseSource, WireFraming,
};
use crate::context::ExchangeContext;
use crate::filters::{FilterResponse, ResponseBody};
use crate::server::ProxyCore;
use crate::upstream::{RoundTripper, Scheme};

/// What one served exchange means for the tunnel loop.
pub(crate) enum ExchangeOutcome {
    /// Client may pipeline another request.
    Continue,
    /// Unrecoverable error; close the tunnel.
    Abort,
    /// WebSocket handshake completed; hand the streams to the relay.
    Upgrade,
}

/// Per-tunnel invariants shared by every exchange inside it.
pub(crate) struct TunnelScope<'a> {
    pub(crate) host: &'a str,
    pub(crate) remote_addr: &'a str,
    pub(crate) tunnel_session: u64,
    pub(crate) tunnel_counter: &'a Arc<TrafficCounter>,
    /// TLS-terminated tunnel: https URL rewriting, RFC 7230 framing rules
    /// and WebSocket hand-off apply.
    pub(crate) secure: bool,
}

impl TunnelScope<'_> {
    fn scheme(&self) -> Scheme {
        if self.secure {
            Scheme::Https
        } else {
            Scheme::Http
        }
    }

    fn protocol(&self) -> Protocol {
        if self.secure {
            Protocol::HttpsMitm
        } else {
            Protocol::HttpMitm
        }
    }

    pub(crate) fn upstream_addr(&self) -> String {
        match parse_connect_authority(self.host) {
            Ok(target) => target.authority_or(self.scheme().default_port()),
            Err(_) => self.host.to_string(),
        }
    }
}

fn count_request_head(
    core: &ProxyCore,
    scope: &TunnelScope<'_>,
    counter: &TrafficCounter,
    bytes: u64,
) {
    counter.record_req_header(bytes);
    scope.tunnel_counter.record_req_header(bytes);
    core.gauges.add_up(bytes);
}

fn count_response_head(
    core: &ProxyCore,
    scope: &TunnelScope<'_>,
    counter: &TrafficCounter,
    bytes: u64,
) {
    counter.record_resp_header(bytes);
    scope.tunnel_counter.record_resp_header(bytes);
    core.gauges.add_down(bytes);
}

fn request_body_stack<'a, CS: AsyncRead + Send + Unpin>(
    core: &Arc<ProxyCore>,
    scope: &TunnelScope<'_>,
    conn: &'a mut BufferedStream<CS>,
    request: &RequestHead,
    counter: &Arc<TrafficCounter>,
    recorder: &Arc<ExchangeRecorder>,
    session: u64,
) -> CapturedBody<FramedBody<'a, CS>> {
    let content_type = request.headers.get("Content-Type").unwrap_or("").to_string();
    let declared = declared_capture_length(request.body_mode);
    let framed = FramedBody::new(conn, request.body_mode);
    let counted = CountedBody::new(
        framed,
        Arc::clone(counter),
        Some(Arc::clone(scope.tunnel_counter)),
        Arc::clone(&core.gauges),
        BodyDirection::Request,
    );
    let body = CapturedBody::new(
        counted,
        core.blob_store.clone(),
        session,
        BodyDirection::Request,
        &content_type,
        declared,
        core.config.capture_pipe_depth,
    );
    if let Some(state) = body.capture_state() {
        recorder.attach_request_capture(state);
    }
    body
}

/// Serves one request-response pair inside a MITM tunnel: filter chains,
/// upstream I/O, byte accounting, capture wiring and the client write-back.
/// The upstream connection is dialed lazily on first use and reused across
/// exchanges of the same tunnel.
pub(crate) async fn serve_mitm_exchange<CS, US, F, Fut>(
    core: &Arc<ProxyCore>,
    scope: &TunnelScope<'_>,
    reader: &mut RequestReader<CS>,
    upstream: &mut Option<BufferedStream<US>>,
    request: RequestHead,
    round_tripper: Option<Arc<dyn RoundTripper>>,
    dial: F,
) -> ExchangeOutcome
where
    CS: AsyncRead + AsyncWrite + Send + Unpin,
    US: AsyncRead + AsyncWrite + Send + Unpin,
    F: FnOnce(RequestHead) -> Fut,
    Fut: Future<Output = io::Result<BufferedStream<US>>>,
{
    let session = core.sessions.allocate();
    let counter = Arc::new(TrafficCounter::new());
    let recorder = Arc::new(ExchangeRecorder::new(
        Arc::clone(&core.exchange_log),
        session,
        Some(scope.tunnel_session),
    ));

    let mut ctx = ExchangeContext::new(session, Some(scope.tunnel_session));
    ctx.counter = Arc::clone(&counter);
    ctx.parent_counter = Some(Arc::clone(scope.tunnel_counter));
    ctx.round_tripper = round_tripper;
    ctx.recorder = Some(Arc::clone(&recorder));

    let display_host = display_authority(scope.host, scope.scheme().default_port());
    let mut request = request;
    request.make_absolute(scope.scheme().as_str(), &display_host);

    core.registry.store(ConnectionInfo {
        session,
        parent_session: Some(scope.tunnel_session),
        host: scope.host.to_string(),
        method: request.method.clone(),
        url: request.target.clone(),
        remote_addr: scope.remote_addr.to_string(),
        protocol: scope.protocol(),
        started_at: SystemTime::now(),
        status: ConnectionStatus::Active,
        ended_at: None,
        live: LiveTraffic::Exchange(Arc::clone(&counter)),
    });

    let (request, synthetic) = core.filters.run_request(request, &mut ctx);
    let mut request = request;
    if synthetic.is_none() {
        strip_proxy_headers(&core.config, &mut request);
    }
    recorder.capture_request(
        request.method.clone(),
        request.target.clone(),
        request.host().unwrap_or(&display_host).to_string(),
        request.headers.to_map(),
    );
    ctx.request = Some(request.clone());

    // The wire carries origin form toward the upstream; the absolute URL
    // stays on the context for filters and the exchange record.
    let mut outbound = request.clone();
    outbound.target = {
        let path = request.path();
        if path.is_empty() {
            "/".to_string()
        } else {
            path.to_string()
        }
    };
    if outbound.headers.get("Host").is_none() {
        outbound.headers.set("Host", display_host.clone());
    }
    let head_bytes = encode_request_head(&outbound);
    count_request_head(core, scope, &counter, head_bytes.len() as u64);

    let response = if let Some(synthetic) = synthetic {
        // The unread request body has to leave the client pipe either way,
        // or the next pipelined head would parse mid-body.
        if request.body_mode != BodyMode::None {
            let mut body = request_body_stack(
                core,
                scope,
                reader.conn_mut(),
                &request,
                &counter,
                &recorder,
                session,
            );
            let drained = pump_body(&mut body, &mut tokio::io::sink(), WireFraming::Raw, false).await;
            body.close().await;
            if let Err(error) = drained {
                fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
                return ExchangeOutcome::Abort;
            }
        }
        synthetic
    } else if let Some(tripper) = ctx.round_tripper.clone() {
        let mut body = request_body_stack(
            core,
            scope,
            reader.conn_mut(),
            &request,
            &counter,
            &recorder,
            session,
        );
        let buffered = read_all(&mut body).await;
        body.close().await;
        let body_bytes = match buffered {
            Ok(bytes) => Bytes::from(bytes),
            Err(error) => {
                fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
                return ExchangeOutcome::Abort;
            }
        };
        match tripper
            .round_trip(
                scope.scheme(),
                scope.host.to_string(),
                request.clone(),
                body_bytes,
            )
            .await
        {
            Ok(response) => FilterResponse {
                head: response.head,
                body: ResponseBody::Replaced(response.body),
            },
            Err(error) => {
                let _ = write_bad_gateway(reader.conn_mut().stream_mut(), &error.to_string()).await;
                fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
                return ExchangeOutcome::Abort;
            }
        }
    } else {
        if upstream.is_none() {
            match dial(request.clone()).await {
                Ok(connection) => *upstream = Some(connection),
                Err(error) => {
                    tracing::warn!(
                        session,
                        host = scope.host,
                        error = %error,
                        "upstream dial failed"
                    );
                    let _ = write_bad_gateway(
                        reader.conn_mut().stream_mut(),
                        &format!("error dialing {}: {error}", scope.host),
                    )
                    .await;
                    fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
                    return ExchangeOutcome::Abort;
                }
            }
        }

        {
            let up = upstream.as_mut().expect("upstream just dialed");
            if let Err(error) = up.stream_mut().write_all(&head_bytes).await {
                fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
                return ExchangeOutcome::Abort;
            }
        }

        let request_framing = if request.body_mode == BodyMode::Chunked {
            WireFraming::Chunked
        } else {
            WireFraming::Raw
        };
        let forwarded = {
            let mut body = request_body_stack(
                core,
                scope,
                reader.conn_mut(),
                &request,
                &counter,
                &recorder,
                session,
            );
            let up = upstream.as_mut().expect("upstream present");
            let result = pump_body(&mut body, up.stream_mut(), request_framing, false).await;
            body.close().await;
            result
        };
        if let Err(error) = forwarded {
            fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
            return ExchangeOutcome::Abort;
        }

        let up = upstream.as_mut().expect("upstream present");
        let raw_head = match up
            .read_until(b"\r\n\r\n", core.config.max_http_head_bytes)
            .await
        {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                let _ = write_bad_gateway(
                    reader.conn_mut().stream_mut(),
                    "upstream closed before response headers",
                )
                .await;
                fail_exchange(
                    &recorder,
                    &counter,
                    &core.registry,
                    session,
                    "upstream closed before response headers".to_string(),
                );
                return ExchangeOutcome::Abort;
            }
            Err(error) => {
                let _ = write_bad_gateway(reader.conn_mut().stream_mut(), &error.to_string()).await;
                fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
                return ExchangeOutcome::Abort;
            }
        };
        match parse_response_head(&raw_head, &request.method) {
            Ok(head) => FilterResponse::from_upstream(head),
            Err(error) => {
                let _ = write_bad_gateway(reader.conn_mut().stream_mut(), &error.to_string()).await;
                fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
                return ExchangeOutcome::Abort;
            }
        }
    };

    let body_before = match &response.body {
        ResponseBody::Replaced(bytes) => Some((bytes.as_ptr() as usize, bytes.len())),
        ResponseBody::Upstream => None,
    };
    let mut response = core.filters.run_response(response, &mut ctx);
    if let Some(error) = ctx.error.take() {
        recorder.set_error(error);
    }

    // Body identity change relative to what entered the response pass.
    let body_modified = match (&body_before, &response.body) {
        (None, ResponseBody::Upstream) => false,
        (None, ResponseBody::Replaced(_)) => true,
        (Some(_), ResponseBody::Upstream) => false,
        (Some((ptr, len)), ResponseBody::Replaced(bytes)) => {
            !(bytes.as_ptr() as usize == *ptr && bytes.len() == *len)
        }
    };
    let upstream_body_mode = response.head.body_mode;
    let streamed_from_upstream = matches!(response.body, ResponseBody::Upstream);
    let status = response.head.status_code;
    let is_websocket = scope.secure
        && streamed_from_upstream
        && is_websocket_handshake(&response.head.headers);
    let is_head_request = request.method.eq_ignore_ascii_case("HEAD");

    if scope.secure {
        if is_websocket || is_head_request {
            // Content-Length stays as the origin sent it.
        } else if (100..200).contains(&status) || status == 204 {
            response.head.headers.remove("Content-Length");
        } else if body_modified {
            response.head.headers.remove("Content-Length");
            response.head.headers.set("Transfer-Encoding", "chunked");
        }
    } else if body_modified {
        response.head.headers.remove("Content-Length");
        response.head.headers.set("Transfer-Encoding", "chunked");
    }
    // Without this a client keeps the CONNECT tunnel open indefinitely:
    // the proxy never signals the origin-side close back to it.
    if !is_websocket {
        response.head.headers.set("Connection", "close");
    }

    let reason = response.head.reason.clone();
    recorder.record_response(status, &reason, response.head.headers.to_map());

    let out_head = encode_response_head(&response.head);
    count_response_head(core, scope, &counter, out_head.len() as u64);
    if let Err(error) = reader.conn_mut().stream_mut().write_all(&out_head).await {
        fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
        return ExchangeOutcome::Abort;
    }

    if is_websocket {
        recorder.skip();
        core.registry.mark_closed(session);
        return ExchangeOutcome::Upgrade;
    }

    let stream_framing = if body_modified {
        WireFraming::Chunked
    } else if streamed_from_upstream && upstream_body_mode == BodyMode::Chunked {
        WireFraming::Chunked
    } else {
        WireFraming::Raw
    };
    let content_type = response.head.headers.get("Content-Type").unwrap_or("").to_string();
    let declared = match &response.body {
        ResponseBody::Replaced(bytes) => Some(bytes.len() as u64),
        ResponseBody::Upstream => declared_capture_length(upstream_body_mode),
    };

    let source = match response.body {
        ResponseBody::Replaced(bytes) => ResponseSource::Replaced(BytesBody::new(bytes)),
        ResponseBody::Upstream => {
            let up = upstream.as_mut().expect("upstream present for streamed body");
            ResponseSource::Upstream(FramedBody::new(up, upstream_body_mode))
        }
    };

    let recorder_for_close = Arc::clone(&recorder);
    let counter_for_close = Arc::clone(&counter);
    let registry_for_close = Arc::clone(&core.registry);
    let counted = CountedBody::new(
        source,
        Arc::clone(&counter),
        Some(Arc::clone(scope.tunnel_counter)),
        Arc::clone(&core.gauges),
        BodyDirection::Response,
    )
    .on_close(move || {
        counter_for_close.update_total();
        recorder_for_close.emit(&counter_for_close);
        registry_for_close.mark_closed(session);
    });
    let mut body = CapturedBody::new(
        counted,
        core.blob_store.clone(),
        session,
        BodyDirection::Response,
        &content_type,
        declared,
        core.config.capture_pipe_depth,
    );
    if let Some(state) = body.capture_state() {
        recorder.attach_response_capture(state);
    }

    let pumped = pump_body(
        &mut body,
        reader.conn_mut().stream_mut(),
        stream_framing,
        false,
    )
    .await;
    match pumped {
        Ok(_) => {
            body.close().await;
            if streamed_from_upstream && upstream_body_mode == BodyMode::CloseDelimited {
                *upstream = None;
            }
            ExchangeOutcome::Continue
        }
        Err(error) => {
            recorder.set_error(error.to_string());
            body.close().await;
            ExchangeOutcome::Abort
        }
    }
}
