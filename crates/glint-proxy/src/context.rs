use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use glint_http1::RequestHead;
use glint_observe::{ExchangeRecorder, TrafficCounter};
use glint_tls::CertificateAuthority;

use crate::upstream::RoundTripper;

/// Monotonic session allocator. Tunnel sessions and the exchange sessions
/// inside them draw from the same sequence.
#[derive(Debug)]
pub struct SessionIds {
    next: AtomicU64,
}

impl Default for SessionIds {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl SessionIds {
    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// State carried through the filter chain for one exchange (or one CONNECT
/// decision). Children of a tunnel hold the tunnel's counter and fold their
/// byte deltas into it.
pub struct ExchangeContext {
    pub session: u64,
    pub parent_session: Option<u64>,
    pub counter: Arc<TrafficCounter>,
    pub parent_counter: Option<Arc<TrafficCounter>>,
    /// Snapshot of the current request, visible to response predicates.
    pub request: Option<RequestHead>,
    /// Optional override for the upstream round trip; set by handlers.
    pub round_tripper: Option<Arc<dyn RoundTripper>>,
    /// Optional per-connection certificate issuer; set by CONNECT handlers.
    pub cert_authority: Option<Arc<dyn CertificateAuthority>>,
    pub recorder: Option<Arc<ExchangeRecorder>>,
    pub error: Option<String>,
}

impl ExchangeContext {
    pub fn new(session: u64, parent_session: Option<u64>) -> Self {
        Self {
            session,
            parent_session,
            counter: Arc::new(TrafficCounter::new()),
            parent_counter: None,
            request: None,
            round_tripper: None,
            cert_authority: None,
            recorder: None,
            error: None,
        }
    }

    pub fn with_parent_counter(mut self, parent: Arc<TrafficCounter>) -> Self {
        self.parent_counter = Some(parent);
        self
    }
}
