use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Byte tallies for one exchange (or one tunnel when used as a parent).
///
/// Sums are maintained incrementally so `req_sum == req_header + req_body`
/// and `resp_sum == resp_header + resp_body` hold after every update.
/// `update_total` freezes the counter; later mutation attempts are ignored.
/// Atomic adds are the only aggregation, which lets concurrent child
/// exchanges fold their deltas into a shared parent counter.
#[derive(Debug, Default)]
pub struct TrafficCounter {
    req_header: AtomicU64,
    req_body: AtomicU64,
    resp_header: AtomicU64,
    resp_body: AtomicU64,
    req_sum: AtomicU64,
    resp_sum: AtomicU64,
    total: AtomicU64,
    frozen: AtomicBool,
}

impl TrafficCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_req_header(&self, bytes: u64) {
        if self.frozen.load(Ordering::Acquire) {
            return;
        }
        self.req_header.fetch_add(bytes, Ordering::Relaxed);
        self.req_sum.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_req_body(&self, bytes: u64) {
        if self.frozen.load(Ordering::Acquire) {
            return;
        }
        self.req_body.fetch_add(bytes, Ordering::Relaxed);
        self.req_sum.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_resp_header(&self, bytes: u64) {
        if self.frozen.load(Ordering::Acquire) {
            return;
        }
        self.resp_header.fetch_add(bytes, Ordering::Relaxed);
        self.resp_sum.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_resp_body(&self, bytes: u64) {
        if self.frozen.load(Ordering::Acquire) {
            return;
        }
        self.resp_body.fetch_add(bytes, Ordering::Relaxed);
        self.resp_sum.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Settles `total` and freezes the counter. Only the first call takes
    /// effect.
    pub fn update_total(&self) {
        if self
            .frozen
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let total =
            self.req_sum.load(Ordering::Relaxed) + self.resp_sum.load(Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn req_sum(&self) -> u64 {
        self.req_sum.load(Ordering::Relaxed)
    }

    pub fn resp_sum(&self) -> u64 {
        self.resp_sum.load(Ordering::Relaxed)
    }

    pub fn req_body(&self) -> u64 {
        self.req_body.load(Ordering::Relaxed)
    }

    pub fn resp_body(&self) -> u64 {
        self.resp_body.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            req_header: self.req_header.load(Ordering::Relaxed),
            req_body: self.req_body.load(Ordering::Relaxed),
            resp_header: self.resp_header.load(Ordering::Relaxed),
            resp_body: self.resp_body.load(Ordering::Relaxed),
            req_sum: self.req_sum.load(Ordering::Relaxed),
            resp_sum: self.resp_sum.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub req_header: u64,
    pub req_body: u64,
    pub resp_header: u64,
    pub resp_body: u64,
    pub req_sum: u64,
    pub resp_sum: u64,
    pub total: u64,
}

/// Process-wide up/down byte gauges, injected rather than global so tests
/// can observe their own instance.
#[derive(Debug, Default)]
pub struct TrafficGauges {
    up: AtomicU64,
    down: AtomicU64,
}

impl TrafficGauges {
    pub fn add_up(&self, bytes: u64) {
        self.up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_down(&self, bytes: u64) {
        self.down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn up(&self) -> u64 {
        self.up.load(Ordering::Relaxed)
    }

    pub fn down(&self) -> u64 {
        self.down.load(Ordering::Relaxed)
    }
}

/// Per-direction byte counters for an opaque tunnel. `nread` counts bytes
/// read from the client, `nwrite` bytes written back to it.
#[derive(Debug, Default)]
pub struct TunnelCounters {
    nread: AtomicU64,
    nwrite: AtomicU64,
}

impl TunnelCounters {
    pub fn add_read(&self, bytes: u64) {
        self.nread.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_write(&self, bytes: u64) {
        self.nwrite.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn nread(&self) -> u64 {
        self.nread.load(Ordering::Relaxed)
    }

    pub fn nwrite(&self) -> u64 {
        self.nwrite.load(Ordering::Relaxed)
    }
}

/// Live read-out handle stored in the connection registry. The counter
/// storage outlives the registry entry because both sides hold the Arc.
#[derive(Debug, Clone)]
pub enum LiveTraffic {
    Exchange(Arc<TrafficCounter>),
    Tunnel(Arc<TunnelCounters>),
}

impl LiveTraffic {
    pub fn upload(&self) -> u64 {
        match self {
            Self::Exchange(counter) => counter.req_body(),
            Self::Tunnel(counters) => counters.nread(),
        }
    }

    pub fn download(&self) -> u64 {
        match self {
            Self::Exchange(counter) => counter.resp_body(),
            Self::Tunnel(counters) => counters.nwrite(),
        }
    }
}
