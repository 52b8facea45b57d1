#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use glint_capture::BlobStore;
use glint_observe::{ConnectionInfo, ConnectionRegistry, Exchange, TrafficGauges};
use glint_proxy::{FilterChain, ProxyConfig, ProxyServer};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

pub struct TestProxy {
    pub addr: std::net::SocketAddr,
    pub registry: Arc<ConnectionRegistry>,
    pub gauges: Arc<TrafficGauges>,
    pub exchanges: mpsc::Receiver<Exchange>,
    pub ca_pem: String,
    pub handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

pub async fn start_proxy(
    config: ProxyConfig,
    filters: FilterChain,
    store: Option<Arc<dyn BlobStore>>,
) -> TestProxy {
    let mut builder = ProxyServer::builder(config).with_filters(filters);
    if let Some(store) = store {
        builder = builder.with_blob_store(store);
    }
    let server = builder.build().expect("proxy builds");
    let registry = server.registry();
    let gauges = server.gauges();
    let exchanges = server.take_exchanges().expect("exchange stream");
    let ca_pem = server.ca_certificate_pem().expect("ca pem");
    let listener = server.bind_listener().await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    let handle = tokio::spawn(server.run_with_listener(listener));
    TestProxy {
        addr,
        registry,
        gauges,
        exchanges,
        ca_pem,
        handle,
    }
}

pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0_u8; 1024];
    while !data.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut buf).await.expect("read head");
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buf[..read]);
    }
    data
}

pub async fn read_until_marker<S: AsyncRead + Unpin>(stream: &mut S, marker: &[u8]) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0_u8; 1024];
    while !data
        .windows(marker.len())
        .any(|window| window == marker)
    {
        let read = stream.read(&mut buf).await.expect("read until marker");
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buf[..read]);
    }
    data
}

pub async fn read_to_end_tolerant<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0_u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => out.extend_from_slice(&buf[..read]),
            Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(error) if error.kind() == std::io::ErrorKind::ConnectionReset => break,
            Err(error) if error.kind() == std::io::ErrorKind::ConnectionAborted => break,
            Err(error) if error.kind() == std::io::ErrorKind::BrokenPipe => break,
            Err(error) => panic!("read to end: {error}"),
        }
    }
    out
}

pub fn split_head_and_body(raw: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let boundary = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("head boundary present")
        + 4;
    (raw[..boundary].to_vec(), raw[boundary..].to_vec())
}

pub fn parse_content_length(head: &[u8]) -> usize {
    let text = String::from_utf8_lossy(head);
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                return value.trim().parse::<usize>().expect("valid content-length");
            }
        }
    }
    0
}

pub fn head_has_header(head: &[u8], name: &str, value: &str) -> bool {
    let text = String::from_utf8_lossy(head);
    text.split("\r\n").any(|line| {
        line.split_once(':')
            .map(|(n, v)| n.eq_ignore_ascii_case(name) && v.trim().eq_ignore_ascii_case(value))
            .unwrap_or(false)
    })
}

pub fn head_has_header_name(head: &[u8], name: &str) -> bool {
    let text = String::from_utf8_lossy(head);
    text.split("\r\n").any(|line| {
        line.split_once(':')
            .map(|(n, _)| n.eq_ignore_ascii_case(name))
            .unwrap_or(false)
    })
}

pub async fn next_exchange(rx: &mut mpsc::Receiver<Exchange>) -> Exchange {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("exchange within deadline")
        .expect("exchange channel open")
}

/// Waits until the registry has reaped `count` closed entries, returning
/// them in session order.
pub async fn wait_for_closed(registry: &ConnectionRegistry, count: usize) -> Vec<ConnectionInfo> {
    let mut collected = Vec::new();
    for _ in 0..100 {
        collected.extend(registry.remove_closed());
        if collected.len() >= count {
            collected.sort_by_key(|info| info.session);
            return collected;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "expected {count} closed connections, saw {}",
        collected.len()
    );
}
