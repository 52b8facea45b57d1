use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::counter::TrafficCounter;

pub const DEFAULT_EXCHANGE_BACKLOG: usize = 1000;

/// Upload state of one captured body, shared between the capture worker and
/// the recorder. Invariant: `uploaded == true` implies `error == None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureState {
    pub object_key: String,
    pub size: u64,
    pub uploaded: bool,
    pub content_type: String,
    pub error: Option<String>,
}

pub type SharedCapture = Arc<Mutex<CaptureState>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub host: String,
    pub header: BTreeMap<String, Vec<String>>,
    pub sum_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_uploaded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub status_code: u16,
    pub status: String,
    pub header: BTreeMap<String, Vec<String>>,
    pub sum_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_uploaded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_error: Option<String>,
}

/// One completed request-response pair. `parent_id` is 0 for exchanges that
/// have no owning tunnel (plain forward-proxy requests).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Exchange {
    pub id: u64,
    pub session_id: u64,
    pub parent_id: u64,
    pub time: u64,
    pub request: RequestRecord,
    pub response: ResponseRecord,
    pub duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bounded, drop-on-full sink for completed exchanges. One per proxy
/// instance; recorders clone the Arc.
#[derive(Debug)]
pub struct ExchangeLog {
    tx: mpsc::Sender<Exchange>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

pub fn exchange_log(backlog: usize) -> (Arc<ExchangeLog>, mpsc::Receiver<Exchange>) {
    let (tx, rx) = mpsc::channel(backlog.max(1));
    (
        Arc::new(ExchangeLog {
            tx,
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }),
        rx,
    )
}

impl ExchangeLog {
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn publish(&self, exchange: Exchange) {
        if self.tx.try_send(exchange).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("exchange channel full, record dropped");
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct RecorderInner {
    request: Option<RequestRecord>,
    response: Option<ResponseRecord>,
    request_capture: Option<SharedCapture>,
    response_capture: Option<SharedCapture>,
    error: Option<String>,
    skip: bool,
    sent: bool,
}

/// Collects the pieces of one exchange and emits the snapshot exactly once,
/// from the response body's close hook. By that point the capture workers
/// have settled, so the record sees the final upload state.
pub struct ExchangeRecorder {
    log: Arc<ExchangeLog>,
    session: u64,
    parent: Option<u64>,
    started_wall: SystemTime,
    started: Instant,
    inner: Mutex<RecorderInner>,
}

impl ExchangeRecorder {
    pub fn new(log: Arc<ExchangeLog>, session: u64, parent: Option<u64>) -> Self {
        Self {
            log,
            session,
            parent,
            started_wall: SystemTime::now(),
            started: Instant::now(),
            inner: Mutex::new(RecorderInner::default()),
        }
    }

    pub fn capture_request(
        &self,
        method: String,
        url: String,
        host: String,
        header: BTreeMap<String, Vec<String>>,
    ) {
        let mut inner = self.inner.lock().expect("recorder lock poisoned");
        inner.request = Some(RequestRecord {
            method,
            url,
            host,
            header,
            ..RequestRecord::default()
        });
    }

    pub fn record_response(
        &self,
        status_code: u16,
        reason: &str,
        header: BTreeMap<String, Vec<String>>,
    ) {
        let mut inner = self.inner.lock().expect("recorder lock poisoned");
        inner.response = Some(ResponseRecord {
            status_code,
            status: if reason.is_empty() {
                status_code.to_string()
            } else {
                format!("{status_code} {reason}")
            },
            header,
            ..ResponseRecord::default()
        });
    }

    pub fn attach_request_capture(&self, capture: SharedCapture) {
        let mut inner = self.inner.lock().expect("recorder lock poisoned");
        inner.request_capture = Some(capture);
    }

    pub fn attach_response_capture(&self, capture: SharedCapture) {
        let mut inner = self.inner.lock().expect("recorder lock poisoned");
        inner.response_capture = Some(capture);
    }

    /// Marks the exchange untracked; `emit` becomes a no-op. Used for
    /// WebSocket upgrades.
    pub fn skip(&self) {
        let mut inner = self.inner.lock().expect("recorder lock poisoned");
        inner.skip = true;
    }

    pub fn set_error(&self, error: String) {
        let mut inner = self.inner.lock().expect("recorder lock poisoned");
        inner.error = Some(error);
    }

    /// Idempotent. Reads the traffic counter and settled capture state and
    /// pushes the snapshot; drops silently when the channel is full.
    pub fn emit(&self, counter: &TrafficCounter) {
        let mut inner = self.inner.lock().expect("recorder lock poisoned");
        if inner.skip || inner.sent {
            return;
        }
        inner.sent = true;

        let mut request = inner.request.take().unwrap_or_default();
        request.sum_size = counter.req_sum();
        if let Some(capture) = inner.request_capture.take() {
            apply_capture(
                &capture,
                &mut request.body_key,
                &mut request.body_size,
                &mut request.body_uploaded,
                &mut request.content_type,
                &mut request.body_error,
            );
        }

        let mut response = inner.response.take().unwrap_or_default();
        response.sum_size = counter.resp_sum();
        if let Some(capture) = inner.response_capture.take() {
            apply_capture(
                &capture,
                &mut response.body_key,
                &mut response.body_size,
                &mut response.body_uploaded,
                &mut response.content_type,
                &mut response.body_error,
            );
        }

        let exchange = Exchange {
            id: self.log.allocate_id(),
            session_id: self.session,
            parent_id: self.parent.unwrap_or(0),
            time: unix_millis(self.started_wall),
            request,
            response,
            duration: self.started.elapsed().as_millis() as u64,
            error: inner.error.clone(),
        };
        self.log.publish(exchange);
    }
}

fn apply_capture(
    capture: &SharedCapture,
    body_key: &mut Option<String>,
    body_size: &mut Option<u64>,
    body_uploaded: &mut Option<bool>,
    content_type: &mut Option<String>,
    body_error: &mut Option<String>,
) {
    let state = capture.lock().expect("capture lock poisoned");
    *body_key = Some(state.object_key.clone());
    *body_size = Some(state.size);
    *body_uploaded = Some(state.uploaded);
    if !state.content_type.is_empty() {
        *content_type = Some(state.content_type.clone());
    }
    *body_error = state.error.clone();
}

fn unix_millis(at: SystemTime) -> u64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as u64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use super::{exchange_log, CaptureState, ExchangeRecorder};
    use crate::counter::TrafficCounter;

    fn sample_header() -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([("X-weird".to_string(), vec!["1".to_string()])])
    }

    #[test]
    fn emit_is_single_shot_per_exchange() {
        let (log, mut rx) = exchange_log(8);
        let recorder = ExchangeRecorder::new(Arc::clone(&log), 7, Some(3));
        recorder.capture_request(
            "GET".to_string(),
            "https://a.example/q".to_string(),
            "a.example".to_string(),
            sample_header(),
        );
        recorder.record_response(200, "OK", BTreeMap::new());

        let counter = TrafficCounter::new();
        counter.record_req_header(50);
        counter.record_resp_header(40);
        counter.add_resp_body(3);

        recorder.emit(&counter);
        recorder.emit(&counter);

        let exchange = rx.try_recv().expect("one exchange");
        assert!(rx.try_recv().is_err(), "emit must fire once");
        assert_eq!(exchange.session_id, 7);
        assert_eq!(exchange.parent_id, 3);
        assert_eq!(exchange.request.sum_size, 50);
        assert_eq!(exchange.response.sum_size, 43);
        assert_eq!(exchange.response.status, "200 OK");
        assert_eq!(
            exchange.request.header.get("X-weird"),
            Some(&vec!["1".to_string()])
        );
    }

    #[test]
    fn skipped_exchange_is_never_emitted() {
        let (log, mut rx) = exchange_log(8);
        let recorder = ExchangeRecorder::new(log, 1, None);
        recorder.skip();
        recorder.emit(&TrafficCounter::new());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let (log, _rx) = exchange_log(1);
        for session in 0..3 {
            let recorder = ExchangeRecorder::new(Arc::clone(&log), session, None);
            recorder.emit(&TrafficCounter::new());
        }
        assert_eq!(log.dropped(), 2);
    }

    #[test]
    fn capture_state_flows_into_the_record() {
        let (log, mut rx) = exchange_log(8);
        let recorder = ExchangeRecorder::new(log, 9, None);
        let capture = Arc::new(Mutex::new(CaptureState {
            object_key: "mitm-data/2026-08-02/9/resp".to_string(),
            size: 12,
            uploaded: true,
            content_type: "text/plain".to_string(),
            error: None,
        }));
        recorder.attach_response_capture(capture);
        recorder.emit(&TrafficCounter::new());

        let exchange = rx.try_recv().expect("exchange");
        assert_eq!(
            exchange.response.body_key.as_deref(),
            Some("mitm-data/2026-08-02/9/resp")
        );
        assert_eq!(exchange.response.body_size, Some(12));
        assert_eq!(exchange.response.body_uploaded, Some(true));
        assert_eq!(exchange.response.content_type.as_deref(), Some("text/plain"));
        assert!(exchange.response.body_error.is_none());
    }

    #[test]
    fn upload_error_is_reported_with_uploaded_false() {
        let (log, mut rx) = exchange_log(8);
        let recorder = ExchangeRecorder::new(log, 9, None);
        let capture = Arc::new(Mutex::new(CaptureState {
            object_key: "mitm-data/2026-08-02/9/req".to_string(),
            error: Some("store unavailable".to_string()),
            ..CaptureState::default()
        }));
        recorder.attach_request_capture(capture);
        recorder.emit(&TrafficCounter::new());

        let exchange = rx.try_recv().expect("exchange");
        assert_eq!(exchange.request.body_uploaded, Some(false));
        assert_eq!(
            exchange.request.body_error.as_deref(),
            Some("store unavailable")
        );
    }

    #[test]
    fn serialized_record_uses_camel_case_keys() {
        let (log, mut rx) = exchange_log(8);
        let recorder = ExchangeRecorder::new(log, 2, Some(1));
        recorder.capture_request(
            "GET".to_string(),
            "http://a.example/x".to_string(),
            "a.example".to_string(),
            BTreeMap::new(),
        );
        recorder.record_response(200, "OK", BTreeMap::new());
        recorder.emit(&TrafficCounter::new());

        let exchange = rx.try_recv().expect("exchange");
        let json = serde_json::to_value(&exchange).expect("serialize");
        assert!(json.get("sessionId").is_some());
        assert!(json.get("parentId").is_some());
        assert!(json["request"].get("sumSize").is_some());
        assert!(json["response"].get("statusCode").is_some());
        assert!(json.get("error").is_none(), "no error key when absent");
        assert!(
            json["request"].get("bodyKey").is_none(),
            "no capture keys when capture is absent"
        );
    }
}
