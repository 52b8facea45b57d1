mod body_relay;
mod config;
mod context;
mod errors;
mod filters;
mod forward;
mod http_mitm;
mod mitm;
mod server;
mod strategy;
mod tls_mitm;
mod tunnel;
mod upstream;
mod websocket;

pub use config::{ProxyConfig, ProxyConfigError};
pub use context::{ExchangeContext, SessionIds};
pub use errors::ProxyError;
pub use filters::{
    content_type_prefix, url_any, url_regex, FilterChain, FilterResponse, RequestPredicate,
    ResponseBody, ResponsePredicate,
};
pub use forward::{DirectHandler, ErrorPageDirectHandler};
pub use server::{ConnectionErrorHandler, ProxyServer, ProxyServerBuilder};
pub use strategy::{decide_connect, ConnectDecision, ConnectStrategy, ConnectionHijacker};
pub use tunnel::{relay_tunnel, CountingStream, PrefixedStream};
pub use upstream::{
    connect_upstream, BufferedResponse, DialOverrides, MaybeTlsStream, MultiDialFn,
    RequestDialFn, RoundTripper, Scheme,
};
pub use websocket::{
    BoxedReadHalf, BoxedWriteHalf, PassthroughWebSocketRelay, WebSocketRelay,
};
