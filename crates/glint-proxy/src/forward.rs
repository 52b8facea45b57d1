use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use glint_capture::{BodyDirection, CapturedBody, CountedBody};
use glint_http1::{
    encode_request_head, encode_response_head, parse_connect_authority, parse_response_head,
    strip_port, BodyMode, BufferedStream, BytesBody, FramedBody, HeaderBlock, RequestHead,
    RequestReader, ResponseHead, split_absolute_url,
};
use glint_observe::{
    ConnectionInfo, ConnectionStatus, ExchangeRecorder, LiveTraffic, Protocol, TrafficCounter,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::body_relay::{
    build_headers, declared_capture_length, fail_exchange, pump_body, read_all,
    strip_proxy_headers, write_bad_gateway, ResponseSource, WireFraming,
};
use crate::context::ExchangeContext;
use crate::filters::{FilterResponse, ResponseBody};
use crate::server::ProxyCore;
use crate::upstream::{connect_upstream, MaybeTlsStream, Scheme};

/// Answers requests that reach the proxy without proxy addressing.
pub trait DirectHandler: Send + Sync + 'static {
    fn respond(&self, request: &RequestHead) -> (ResponseHead, Bytes);
}

/// Default: a plain error page telling the caller this is a proxy.
#[derive(Debug, Default)]
pub struct ErrorPageDirectHandler;

impl DirectHandler for ErrorPageDirectHandler {
    fn respond(&self, _request: &RequestHead) -> (ResponseHead, Bytes) {
        let body = Bytes::from_static(
            b"This is a proxy server. Does not respond to non-proxy requests.\n",
        );
        let mut head = ResponseHead::new(500, "Internal Server Error");
        head.headers.set("Content-Type", "text/plain; charset=utf-8");
        head.headers.set("Content-Length", body.len().to_string());
        head.headers.set("Connection", "close");
        (head, body)
    }
}

enum ForwardFlow {
    NextRequest,
    Close,
}

/// Classic forward-proxy path: absolute-form requests served one at a time
/// on the client connection until it signals close.
pub(crate) async fn run_plain_forward(
    core: Arc<ProxyCore>,
    client: BufferedStream<TcpStream>,
    first_request: RequestHead,
    remote_addr: String,
) -> io::Result<()> {
    let mut reader =
        RequestReader::from_buffered(client, core.config.prevent_canonicalization);
    let mut pending = Some(first_request);

    loop {
        let request = match pending.take() {
            Some(request) => request,
            None => {
                match reader.is_eof().await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(_) => break,
                }
                match reader.read_request(core.config.max_http_head_bytes).await {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(error) => {
                        if !error.is_connection_closed() {
                            tracing::warn!(error = %error, "forward request parse failed");
                        }
                        break;
                    }
                }
            }
        };
        match serve_forward_exchange(&core, &mut reader, request, &remote_addr).await {
            ForwardFlow::NextRequest => continue,
            ForwardFlow::Close => break,
        }
    }
    Ok(())
}

async fn serve_forward_exchange(
    core: &Arc<ProxyCore>,
    reader: &mut RequestReader<TcpStream>,
    request: RequestHead,
    remote_addr: &str,
) -> ForwardFlow {
    let session = core.sessions.allocate();
    let counter = Arc::new(TrafficCounter::new());
    let recorder = Arc::new(ExchangeRecorder::new(
        Arc::clone(&core.exchange_log),
        session,
        None,
    ));

    let mut ctx = ExchangeContext::new(session, None);
    ctx.counter = Arc::clone(&counter);
    ctx.recorder = Some(Arc::clone(&recorder));

    core.registry.store(ConnectionInfo {
        session,
        parent_session: None,
        host: request.host().unwrap_or_default().to_string(),
        method: request.method.clone(),
        url: request.target.clone(),
        remote_addr: remote_addr.to_string(),
        protocol: Protocol::Http,
        started_at: SystemTime::now(),
        status: ConnectionStatus::Active,
        ended_at: None,
        live: LiveTraffic::Exchange(Arc::clone(&counter)),
    });

    if !request.is_absolute_target() {
        let (head, body) = core.direct_handler.respond(&request);
        let bytes = encode_response_head(&head);
        let writer = reader.conn_mut().stream_mut();
        let _ = writer.write_all(&bytes).await;
        let _ = writer.write_all(&body).await;
        recorder.skip();
        core.registry.mark_closed(session);
        return ForwardFlow::Close;
    }

    let (request, synthetic) = core.filters.run_request(request, &mut ctx);
    let mut request = request;
    if synthetic.is_none() {
        strip_proxy_headers(&core.config, &mut request);
    }
    recorder.capture_request(
        request.method.clone(),
        request.target.clone(),
        request
            .authority()
            .unwrap_or_default()
            .to_string(),
        request.headers.to_map(),
    );
    ctx.request = Some(request.clone());

    let Some((scheme_text, authority, path)) = split_absolute_url(&request.target) else {
        // A filter rewrote the target into something unusable.
        let _ = write_bad_gateway(reader.conn_mut().stream_mut(), "invalid request target").await;
        fail_exchange(&recorder, &counter, &core.registry, session, "invalid request target".to_string());
        return ForwardFlow::Close;
    };
    let Some(scheme) = Scheme::parse(scheme_text) else {
        let _ = write_bad_gateway(reader.conn_mut().stream_mut(), "unsupported scheme").await;
        fail_exchange(&recorder, &counter, &core.registry, session, format!("unsupported scheme {scheme_text}"));
        return ForwardFlow::Close;
    };
    let authority = authority.to_string();
    let origin_path = if path.is_empty() { "/".to_string() } else { path.to_string() };

    let mut outbound = request.clone();
    outbound.target = origin_path;
    if outbound.headers.get("Host").is_none() {
        outbound.headers.set("Host", authority.clone());
    }
    let head_bytes = encode_request_head(&outbound);
    counter.record_req_header(head_bytes.len() as u64);
    core.gauges.add_up(head_bytes.len() as u64);

    let mut upstream: Option<BufferedStream<MaybeTlsStream>> = None;
    let response = if let Some(synthetic) = synthetic {
        if request.body_mode != BodyMode::None {
            let mut body = forward_request_body_stack(
                core, reader, &request, &counter, &recorder, session,
            );
            let drained =
                pump_body(&mut body, &mut tokio::io::sink(), WireFraming::Raw, false).await;
            body.close().await;
            if let Err(error) = drained {
                fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
                return ForwardFlow::Close;
            }
        }
        synthetic
    } else if let Some(tripper) = ctx.round_tripper.clone() {
        let mut body = forward_request_body_stack(
            core, reader, &request, &counter, &recorder, session,
        );
        let buffered = read_all(&mut body).await;
        body.close().await;
        let body_bytes = match buffered {
            Ok(bytes) => Bytes::from(bytes),
            Err(error) => {
                fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
                return ForwardFlow::Close;
            }
        };
        match tripper
            .round_trip(scheme, authority.clone(), outbound.clone(), body_bytes)
            .await
        {
            Ok(response) => FilterResponse {
                head: response.head,
                body: ResponseBody::Replaced(response.body),
            },
            Err(error) => {
                let _ =
                    write_bad_gateway(reader.conn_mut().stream_mut(), &error.to_string()).await;
                fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
                return ForwardFlow::Close;
            }
        }
    } else {
        let addr = match parse_connect_authority(&authority) {
            Ok(target) => target.authority_or(scheme.default_port()),
            Err(_) => authority.clone(),
        };
        let connected = connect_upstream(
            scheme,
            &addr,
            strip_port(&authority),
            &core.dialers,
            Some(&request),
            &core.upstream_tls,
        )
        .await;
        let mut up = match connected {
            Ok(connection) => connection,
            Err(error) => {
                tracing::warn!(session, host = %authority, error = %error, "forward dial failed");
                let _ =
                    write_bad_gateway(reader.conn_mut().stream_mut(), &error.to_string()).await;
                fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
                return ForwardFlow::Close;
            }
        };

        if let Err(error) = up.stream_mut().write_all(&head_bytes).await {
            fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
            return ForwardFlow::Close;
        }
        let request_framing = if request.body_mode == BodyMode::Chunked {
            WireFraming::Chunked
        } else {
            WireFraming::Raw
        };
        let forwarded = {
            let mut body = forward_request_body_stack(
                core, reader, &request, &counter, &recorder, session,
            );
            let result = pump_body(&mut body, up.stream_mut(), request_framing, false).await;
            body.close().await;
            result
        };
        if let Err(error) = forwarded {
            fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
            return ForwardFlow::Close;
        }

        let raw_head = match up
            .read_until(b"\r\n\r\n", core.config.max_http_head_bytes)
            .await
        {
            Ok(Some(raw)) => raw,
            Ok(None) | Err(_) => {
                let message = format!("error reading response from {authority}");
                let _ = write_bad_gateway(reader.conn_mut().stream_mut(), &message).await;
                fail_exchange(&recorder, &counter, &core.registry, session, message);
                return ForwardFlow::Close;
            }
        };
        match parse_response_head(&raw_head, &request.method) {
            Ok(head) => {
                upstream = Some(up);
                FilterResponse::from_upstream(head)
            }
            Err(error) => {
                let _ =
                    write_bad_gateway(reader.conn_mut().stream_mut(), &error.to_string()).await;
                fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
                return ForwardFlow::Close;
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

    if body_modified {
        response.head.headers.remove("Content-Length");
        response.head.headers.set("Transfer-Encoding", "chunked");
    }
    if streamed_from_upstream && upstream_body_mode == BodyMode::CloseDelimited {
        response.head.headers.set("Connection", "close");
    }

    let mut client_headers = HeaderBlock::new();
    build_headers(
        &mut client_headers,
        &response.head.headers,
        core.config.keep_dest_headers,
    );
    response.head.headers = client_headers;

    let reason = response.head.reason.clone();
    recorder.record_response(response.head.status_code, &reason, response.head.headers.to_map());

    let out_head = encode_response_head(&response.head);
    counter.record_resp_header(out_head.len() as u64);
    core.gauges.add_down(out_head.len() as u64);
    if let Err(error) = reader
        .conn_mut()
        .stream_mut()
        .write_all(&out_head)
        .await
    {
        fail_exchange(&recorder, &counter, &core.registry, session, error.to_string());
        return ForwardFlow::Close;
    }

    // SSE and chunked responses must reach the client event by event.
    let flush_each = response
        .head
        .headers
        .get("Content-Type")
        .map(|ct| ct.starts_with("text/event-stream"))
        .unwrap_or(false)
        || response.head.headers.has_token("Transfer-Encoding", "chunked");

    let stream_framing = if body_modified {
        WireFraming::Chunked
    } else if streamed_from_upstream && upstream_body_mode == BodyMode::Chunked {
        WireFraming::Chunked
    } else {
        WireFraming::Raw
    };
    let content_type = response
        .head
        .headers
        .get("Content-Type")
        .unwrap_or("")
        .to_string();
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
        None,
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
        flush_each,
    )
    .await;
    let flow = match &pumped {
        Ok(_) => {
            if request.connection_close
                || response.head.connection_close
                || (streamed_from_upstream && upstream_body_mode == BodyMode::CloseDelimited)
            {
                ForwardFlow::Close
            } else {
                ForwardFlow::NextRequest
            }
        }
        Err(error) => {
            recorder.set_error(error.to_string());
            ForwardFlow::Close
        }
    };
    body.close().await;
    flow
}

fn forward_request_body_stack<'a>(
    core: &Arc<ProxyCore>,
    reader: &'a mut RequestReader<TcpStream>,
    request: &RequestHead,
    counter: &Arc<TrafficCounter>,
    recorder: &Arc<ExchangeRecorder>,
    session: u64,
) -> CapturedBody<FramedBody<'a, TcpStream>> {
    let content_type = request.headers.get("Content-Type").unwrap_or("").to_string();
    let declared = declared_capture_length(request.body_mode);
    let framed = FramedBody::new(reader.conn_mut(), request.body_mode);
    let counted = CountedBody::new(
        framed,
        Arc::clone(counter),
        None,
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
