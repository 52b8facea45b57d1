use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use glint_tls::CertificateAuthority;
use tokio::net::TcpStream;

use crate::context::ExchangeContext;
use crate::filters::FilterChain;

/// What to do with a CONNECT target.
#[derive(Clone)]
pub enum ConnectStrategy {
    /// Opaque byte tunnel.
    Accept,
    /// Refuse the tunnel and close.
    Reject,
    /// Plaintext HTTP man-in-the-middle inside the tunnel.
    HttpMitm,
    /// Terminate TLS with a forged certificate, re-encrypt upstream. An
    /// explicit authority overrides the server default for this tunnel.
    TlsMitm {
        authority: Option<Arc<dyn CertificateAuthority>>,
    },
    /// Hand the raw client socket to user code.
    Hijack(Arc<dyn ConnectionHijacker>),
}

impl fmt::Debug for ConnectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => f.write_str("Accept"),
            Self::Reject => f.write_str("Reject"),
            Self::HttpMitm => f.write_str("HttpMitm"),
            Self::TlsMitm { authority } => f
                .debug_struct("TlsMitm")
                .field("authority_override", &authority.is_some())
                .finish(),
            Self::Hijack(_) => f.write_str("Hijack"),
        }
    }
}

pub trait ConnectionHijacker: Send + Sync + 'static {
    /// Receives the hijacked client socket plus any bytes buffered past the
    /// CONNECT head.
    fn hijack(
        &self,
        client: TcpStream,
        leftover: Vec<u8>,
        ctx: ExchangeContext,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Outcome of the CONNECT handler chain: the chosen strategy plus the
/// possibly rewritten target authority.
#[derive(Debug, Clone)]
pub struct ConnectDecision {
    pub strategy: ConnectStrategy,
    pub host: String,
}

/// Runs the CONNECT handlers in registration order; the first to return a
/// decision wins. No match means an opaque tunnel.
pub fn decide_connect(
    chain: &FilterChain,
    host: &str,
    ctx: &mut ExchangeContext,
) -> ConnectDecision {
    chain.run_connect(host, ctx).unwrap_or(ConnectDecision {
        strategy: ConnectStrategy::Accept,
        host: host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::{decide_connect, ConnectDecision, ConnectStrategy};
    use crate::context::ExchangeContext;
    use crate::filters::FilterChain;

    #[test]
    fn default_strategy_is_an_opaque_tunnel() {
        let chain = FilterChain::new();
        let mut ctx = ExchangeContext::new(1, None);
        let decision = decide_connect(&chain, "a.example:443", &mut ctx);
        assert!(matches!(decision.strategy, ConnectStrategy::Accept));
        assert_eq!(decision.host, "a.example:443");
    }

    #[test]
    fn first_matching_handler_wins_and_may_rewrite_the_host() {
        let mut chain = FilterChain::new();
        chain.on_connect(Vec::new(), |host: &str, _ctx: &mut ExchangeContext| {
            if host.ends_with(":80") {
                Some(ConnectDecision {
                    strategy: ConnectStrategy::HttpMitm,
                    host: host.to_string(),
                })
            } else {
                None
            }
        });
        chain.on_connect(Vec::new(), |host: &str, _ctx: &mut ExchangeContext| {
            Some(ConnectDecision {
                strategy: ConnectStrategy::TlsMitm { authority: None },
                host: format!("rewritten-{host}"),
            })
        });

        let mut ctx = ExchangeContext::new(1, None);
        let plain = decide_connect(&chain, "a.example:80", &mut ctx);
        assert!(matches!(plain.strategy, ConnectStrategy::HttpMitm));

        let tls = decide_connect(&chain, "a.example:443", &mut ctx);
        assert!(matches!(tls.strategy, ConnectStrategy::TlsMitm { .. }));
        assert_eq!(tls.host, "rewritten-a.example:443");
    }
}
