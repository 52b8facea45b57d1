use std::time::SystemTime;

use dashmap::DashMap;

use crate::counter::LiveTraffic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    HttpsTunnel,
    HttpMitm,
    HttpsMitm,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::HttpsTunnel => "HTTPS-Tunnel",
            Self::HttpMitm => "HTTP-MITM",
            Self::HttpsMitm => "HTTPS-MITM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    Closed,
}

/// Descriptor of one active transport, published for the control plane.
/// The `live` handle reads the owning exchange's counters directly, so the
/// read-out stays current without copying.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub session: u64,
    pub parent_session: Option<u64>,
    pub host: String,
    pub method: String,
    pub url: String,
    pub remote_addr: String,
    pub protocol: Protocol,
    pub started_at: SystemTime,
    pub status: ConnectionStatus,
    pub ended_at: Option<SystemTime>,
    pub live: LiveTraffic,
}

impl ConnectionInfo {
    pub fn upload(&self) -> u64 {
        self.live.upload()
    }

    pub fn download(&self) -> u64 {
        self.live.download()
    }
}

/// Process-wide map of active transports keyed by session id.
///
/// Pipelines insert on entry and mark entries Closed from their close
/// hooks; Closed entries stay visible until the control-plane pusher reaps
/// them with `remove_closed`.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<u64, ConnectionInfo>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, info: ConnectionInfo) {
        self.entries.insert(info.session, info);
    }

    pub fn mark_closed(&self, session: u64) {
        if let Some(mut entry) = self.entries.get_mut(&session) {
            entry.status = ConnectionStatus::Closed;
            entry.ended_at = Some(SystemTime::now());
        }
    }

    pub fn delete(&self, session: u64) {
        self.entries.remove(&session);
    }

    pub fn visit(&self, mut visitor: impl FnMut(&ConnectionInfo)) {
        for entry in self.entries.iter() {
            visitor(entry.value());
        }
    }

    pub fn get(&self, session: u64) -> Option<ConnectionInfo> {
        self.entries.get(&session).map(|entry| entry.value().clone())
    }

    /// Removes every Closed entry and returns it, newest state included.
    pub fn remove_closed(&self) -> Vec<ConnectionInfo> {
        let closed: Vec<u64> = self
            .entries
            .iter()
            .filter(|entry| entry.status == ConnectionStatus::Closed)
            .map(|entry| *entry.key())
            .collect();
        closed
            .into_iter()
            .filter_map(|session| self.entries.remove(&session).map(|(_, info)| info))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.status == ConnectionStatus::Active)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::SystemTime;

    use super::{ConnectionInfo, ConnectionRegistry, ConnectionStatus, Protocol};
    use crate::counter::{LiveTraffic, TunnelCounters};

    fn sample(session: u64, counters: Arc<TunnelCounters>) -> ConnectionInfo {
        ConnectionInfo {
            session,
            parent_session: None,
            host: "a.example:443".to_string(),
            method: "TUNNEL".to_string(),
            url: "a.example:443".to_string(),
            remote_addr: "127.0.0.1:9999".to_string(),
            protocol: Protocol::HttpsTunnel,
            started_at: SystemTime::now(),
            status: ConnectionStatus::Active,
            ended_at: None,
            live: LiveTraffic::Tunnel(counters),
        }
    }

    #[test]
    fn mark_closed_keeps_the_entry_visible() {
        let registry = ConnectionRegistry::new();
        let counters = Arc::new(TunnelCounters::default());
        registry.store(sample(1, Arc::clone(&counters)));

        registry.mark_closed(1);
        let info = registry.get(1).expect("entry still present");
        assert_eq!(info.status, ConnectionStatus::Closed);
        assert!(info.ended_at.is_some());
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn live_counters_stay_readable_after_close() {
        let registry = ConnectionRegistry::new();
        let counters = Arc::new(TunnelCounters::default());
        registry.store(sample(5, Arc::clone(&counters)));
        registry.mark_closed(5);

        counters.add_read(1000);
        counters.add_write(2000);
        let info = registry.get(5).expect("entry present");
        assert_eq!(info.upload(), 1000);
        assert_eq!(info.download(), 2000);
    }

    #[test]
    fn remove_closed_reaps_only_closed_entries() {
        let registry = ConnectionRegistry::new();
        let counters = Arc::new(TunnelCounters::default());
        registry.store(sample(1, Arc::clone(&counters)));
        registry.store(sample(2, Arc::clone(&counters)));
        registry.mark_closed(2);

        let reaped = registry.remove_closed();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].session, 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(1).is_some());
    }
}
