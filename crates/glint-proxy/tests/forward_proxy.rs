mod common;

use std::sync::Arc;

use bytes::Bytes;
use glint_capture::{MemoryBlobStore, RejectingBlobStore};
use glint_observe::{ConnectionStatus, Protocol};
use glint_proxy::{content_type_prefix, FilterChain, FilterResponse, ProxyConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use common::{
    head_has_header_name, next_exchange, parse_content_length, read_head, split_head_and_body,
    start_proxy, wait_for_closed,
};

async fn spawn_upstream_once(response: &'static [u8]) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept upstream");
        let _ = read_head(&mut stream).await;
        stream.write_all(response).await.expect("write response");
        stream.flush().await.expect("flush response");
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn absolute_form_get_streams_body_and_emits_an_exchange() {
    let upstream_addr = spawn_upstream_once(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
    )
    .await;

    let mut proxy = start_proxy(ProxyConfig::default(), FilterChain::new(), None).await;

    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET http://127.0.0.1:{}/x HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream_addr.port(),
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.expect("write request");

    let head = read_head(&mut client).await;
    let (head, mut body) = split_head_and_body(&head);
    assert!(head.starts_with(b"HTTP/1.1 200 OK"), "{}", String::from_utf8_lossy(&head));
    let content_length = parse_content_length(&head);
    assert_eq!(content_length, 5);
    while body.len() < content_length {
        let mut buf = [0_u8; 64];
        let read = client.read(&mut buf).await.expect("read body");
        assert!(read > 0, "upstream body truncated");
        body.extend_from_slice(&buf[..read]);
    }
    assert_eq!(body, b"hello");
    drop(client);

    let exchange = next_exchange(&mut proxy.exchanges).await;
    assert_eq!(exchange.parent_id, 0);
    assert_eq!(exchange.request.method, "GET");
    assert!(exchange.request.url.ends_with("/x"));
    assert_eq!(exchange.response.status_code, 200);
    assert_eq!(
        exchange.response.sum_size,
        head.len() as u64 + 5,
        "response sum covers header and body bytes"
    );
    assert!(exchange.response.body_key.is_none(), "no capture configured");

    let closed = wait_for_closed(&proxy.registry, 1).await;
    assert_eq!(closed[0].protocol, Protocol::Http);
    assert_eq!(closed[0].status, ConnectionStatus::Closed);
    assert_eq!(closed[0].download(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_proxy_request_gets_the_direct_error_page() {
    let mut proxy = start_proxy(ProxyConfig::default(), FilterChain::new(), None).await;

    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: nowhere\r\n\r\n")
        .await
        .expect("write request");

    let raw = common::read_to_end_tolerant(&mut client).await;
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 500"), "{text}");
    assert!(text.contains("This is a proxy server"), "{text}");
    assert!(
        proxy.exchanges.try_recv().is_err(),
        "direct requests emit no exchange"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn synthetic_response_short_circuits_the_upstream() {
    let mut filters = FilterChain::new();
    filters.on_request(Vec::new(), |request, _ctx| {
        let synthetic =
            FilterResponse::synthetic(451, "Unavailable For Legal Reasons", Bytes::from_static(b"blocked"));
        (request, Some(synthetic))
    });
    let mut proxy = start_proxy(ProxyConfig::default(), filters, None).await;

    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    client
        .write_all(b"GET http://unreachable.invalid/x HTTP/1.1\r\nHost: unreachable.invalid\r\n\r\n")
        .await
        .expect("write request");

    let raw = read_head(&mut client).await;
    let (head, body) = split_head_and_body(&raw);
    assert!(head.starts_with(b"HTTP/1.1 451"), "{}", String::from_utf8_lossy(&head));
    assert!(body.starts_with(b"blocked") || body.is_empty());

    let exchange = next_exchange(&mut proxy.exchanges).await;
    assert_eq!(exchange.response.status_code, 451);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn filter_replaced_body_is_rechunked_without_content_length() {
    let upstream_addr = spawn_upstream_once(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 8\r\n\r\noriginal",
    )
    .await;

    let mut filters = FilterChain::new();
    filters.on_response(
        Vec::new(),
        vec![content_type_prefix(&["text/plain"])],
        |mut response, _ctx| {
            response.replace_body(Bytes::from_static(b"rewritten by filter"));
            response
        },
    );
    let mut proxy = start_proxy(ProxyConfig::default(), filters, None).await;

    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET http://127.0.0.1:{}/x HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream_addr.port(),
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.expect("write request");

    let raw = common::read_until_marker(&mut client, b"0\r\n\r\n").await;
    let (head, body) = split_head_and_body(&raw);
    assert!(!head_has_header_name(&head, "Content-Length"));
    assert!(common::head_has_header(&head, "Transfer-Encoding", "chunked"));
    let body_text = String::from_utf8_lossy(&body);
    assert!(body_text.contains("rewritten by filter"), "{body_text}");
    assert!(body_text.ends_with("0\r\n\r\n"), "{body_text}");

    let exchange = next_exchange(&mut proxy.exchanges).await;
    assert_eq!(exchange.response.status_code, 200);
    assert!(
        exchange.response.sum_size >= b"rewritten by filter".len() as u64,
        "sum covers the replaced body"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_failure_is_recorded_without_breaking_the_data_path() {
    let upstream_addr = spawn_upstream_once(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok",
    )
    .await;

    let store = Arc::new(RejectingBlobStore::new("store unavailable"));
    let mut proxy = start_proxy(
        ProxyConfig::default(),
        FilterChain::new(),
        Some(store),
    )
    .await;

    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "POST http://127.0.0.1:{}/upload HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\ndata",
        upstream_addr.port(),
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.expect("write request");

    let raw = read_head(&mut client).await;
    let (head, _) = split_head_and_body(&raw);
    assert!(head.starts_with(b"HTTP/1.1 200 OK"), "{}", String::from_utf8_lossy(&head));

    let exchange = next_exchange(&mut proxy.exchanges).await;
    assert_eq!(exchange.request.body_uploaded, Some(false));
    let error = exchange.request.body_error.expect("upload error recorded");
    assert!(error.contains("store unavailable"), "{error}");
    assert!(exchange
        .request
        .body_key
        .as_deref()
        .expect("object key assigned")
        .ends_with("/req"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_body_capture_stores_the_payload() {
    let upstream_addr = spawn_upstream_once(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok",
    )
    .await;

    let store = Arc::new(MemoryBlobStore::new());
    let mut proxy = start_proxy(
        ProxyConfig::default(),
        FilterChain::new(),
        Some(Arc::clone(&store) as Arc<dyn glint_capture::BlobStore>),
    )
    .await;

    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "POST http://127.0.0.1:{}/upload HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Type: application/json\r\nContent-Length: 13\r\n\r\n{{\"body\":true}}",
        upstream_addr.port(),
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.expect("write request");
    let _ = read_head(&mut client).await;

    let exchange = next_exchange(&mut proxy.exchanges).await;
    assert_eq!(exchange.request.body_uploaded, Some(true));
    assert_eq!(exchange.request.body_size, Some(13));
    let key = exchange.request.body_key.expect("object key");
    let object = store.get(&key).expect("stored request body");
    assert_eq!(object.data, b"{\"body\":true}");
    assert_eq!(object.content_type, "application/json");
}
