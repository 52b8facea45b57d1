use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use glint_http1::{BufferedStream, RequestHead, ResponseHead};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        if text.eq_ignore_ascii_case("http") {
            Some(Self::Http)
        } else if text.eq_ignore_ascii_case("https") {
            Some(Self::Https)
        } else {
            None
        }
    }
}

/// Proxy-to-origin stream, plaintext or TLS, behind one type so pipelines
/// keep a single upstream slot per tunnel.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

pub type MultiDialFn = dyn Fn(&str) -> Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>
    + Send
    + Sync;
pub type RequestDialFn = dyn Fn(&RequestHead, &str) -> Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>
    + Send
    + Sync;

/// Optional dialer overrides. The request-aware dialer is consulted first
/// when a parsed request is at hand, then the plain multi dialer, then a
/// direct TCP connect.
#[derive(Clone, Default)]
pub struct DialOverrides {
    pub connect_multi_dial: Option<Arc<MultiDialFn>>,
    pub connect_with_req_dial: Option<Arc<RequestDialFn>>,
}

impl DialOverrides {
    pub async fn dial(
        &self,
        request: Option<&RequestHead>,
        addr: &str,
    ) -> io::Result<TcpStream> {
        if let (Some(dialer), Some(request)) = (&self.connect_with_req_dial, request) {
            return dialer(request, addr).await;
        }
        if let Some(dialer) = &self.connect_multi_dial {
            return dialer(addr).await;
        }
        TcpStream::connect(addr).await
    }
}

/// Dials `host:port` and, for https, completes the TLS handshake with SNI
/// set to `sni_host`.
pub async fn connect_upstream(
    scheme: Scheme,
    addr: &str,
    sni_host: &str,
    dialers: &DialOverrides,
    request: Option<&RequestHead>,
    tls_config: &Arc<ClientConfig>,
) -> io::Result<BufferedStream<MaybeTlsStream>> {
    let tcp = dialers.dial(request, addr).await?;
    let stream = match scheme {
        Scheme::Http => MaybeTlsStream::Plain(tcp),
        Scheme::Https => {
            let server_name = ServerName::try_from(sni_host.to_string()).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "invalid server name for upstream TLS",
                )
            })?;
            let connector = TlsConnector::from(Arc::clone(tls_config));
            let tls = connector.connect(server_name, tcp).await?;
            MaybeTlsStream::Tls(Box::new(tls))
        }
    };
    Ok(BufferedStream::new(stream))
}

/// Fully buffered response, returned by round-tripper overrides.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub head: ResponseHead,
    pub body: Bytes,
}

/// Hot-swappable upstream executor. When a handler installs one on the
/// context, the pipeline buffers the request body, delegates the round
/// trip, and treats the returned body as filter-replaced (re-chunked on
/// output). The default path streams over a pooled per-tunnel connection
/// instead.
pub trait RoundTripper: Send + Sync + 'static {
    fn round_trip(
        &self,
        scheme: Scheme,
        authority: String,
        request: RequestHead,
        body: Bytes,
    ) -> Pin<Box<dyn Future<Output = io::Result<BufferedResponse>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::{DialOverrides, Scheme};

    #[test]
    fn scheme_parsing_and_ports() {
        assert_eq!(Scheme::parse("http"), Some(Scheme::Http));
        assert_eq!(Scheme::parse("HTTPS"), Some(Scheme::Https));
        assert_eq!(Scheme::parse("ws"), None);
        assert_eq!(Scheme::Http.default_port(), 80);
        assert_eq!(Scheme::Https.default_port(), 443);
    }

    #[tokio::test]
    async fn request_aware_dialer_is_preferred() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        let req_dials = Arc::new(AtomicU32::new(0));
        let multi_dials = Arc::new(AtomicU32::new(0));
        let req_dials_clone = Arc::clone(&req_dials);
        let multi_dials_clone = Arc::clone(&multi_dials);

        let overrides = DialOverrides {
            connect_multi_dial: Some(Arc::new(move |addr: &str| {
                multi_dials_clone.fetch_add(1, Ordering::SeqCst);
                let addr = addr.to_string();
                Box::pin(async move { tokio::net::TcpStream::connect(addr).await })
            })),
            connect_with_req_dial: Some(Arc::new(move |_req: &glint_http1::RequestHead, addr: &str| {
                req_dials_clone.fetch_add(1, Ordering::SeqCst);
                let addr = addr.to_string();
                Box::pin(async move { tokio::net::TcpStream::connect(addr).await })
            })),
        };

        let request =
            glint_http1::parse_request_head(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").expect("head");
        let _ = overrides.dial(Some(&request), &addr).await.expect("dial");
        assert_eq!(req_dials.load(Ordering::SeqCst), 1);
        assert_eq!(multi_dials.load(Ordering::SeqCst), 0);

        let _ = overrides.dial(None, &addr).await.expect("dial");
        assert_eq!(multi_dials.load(Ordering::SeqCst), 1);
    }
}
