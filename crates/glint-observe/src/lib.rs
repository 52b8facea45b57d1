mod connections;
mod counter;
mod exchange;

pub use connections::{ConnectionInfo, ConnectionRegistry, ConnectionStatus, Protocol};
pub use counter::{
    LiveTraffic, TrafficCounter, TrafficGauges, TrafficSnapshot, TunnelCounters,
};
pub use exchange::{
    exchange_log, CaptureState, Exchange, ExchangeLog, ExchangeRecorder, RequestRecord,
    ResponseRecord, SharedCapture, DEFAULT_EXCHANGE_BACKLOG,
};
