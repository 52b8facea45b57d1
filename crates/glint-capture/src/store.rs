use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Mutex;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyDirection {
    Request,
    Response,
}

impl BodyDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "req",
            Self::Response => "resp",
        }
    }
}

/// Object keys group bodies by day and session:
/// `mitm-data/YYYY-MM-DD/<session>/{req|resp}`.
pub fn object_key(session: u64, direction: BodyDirection) -> String {
    let day = chrono::Utc::now().format("%Y-%m-%d");
    format!("mitm-data/{day}/{session}/{}", direction.as_str())
}

/// Streaming media never settles, so capturing it would pin the pipe open
/// for the connection's lifetime.
pub fn should_skip_capture(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    ["text/event-stream", "websocket", "multipart/x-mixed-replace"]
        .iter()
        .any(|skip| lower.contains(skip))
}

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("object store rejected upload: {0}")]
    Rejected(String),
    #[error("object store I/O failure: {0}")]
    Io(#[from] io::Error),
}

pub type BlobPayload = Box<dyn AsyncRead + Send + Unpin>;

/// Object-store client boundary. Uploads always carry a known size; the
/// capture layer spools unknown-length bodies before calling in.
pub trait BlobStore: Send + Sync + 'static {
    fn put_object(
        &self,
        key: String,
        content_type: String,
        size: u64,
        payload: BlobPayload,
    ) -> Pin<Box<dyn Future<Output = Result<u64, BlobStoreError>> + Send + '_>>;
}

/// In-memory store used by tests and demos.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub content_type: String,
    pub data: Vec<u8>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .expect("store lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .expect("store lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put_object(
        &self,
        key: String,
        content_type: String,
        size: u64,
        mut payload: BlobPayload,
    ) -> Pin<Box<dyn Future<Output = Result<u64, BlobStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut data = Vec::with_capacity(size as usize);
            payload.read_to_end(&mut data).await?;
            let stored = data.len() as u64;
            self.objects
                .lock()
                .expect("store lock poisoned")
                .insert(key, StoredObject { content_type, data });
            Ok(stored)
        })
    }
}

/// Store that fails every upload; exercises the error path without a real
/// backend.
#[derive(Debug, Clone)]
pub struct RejectingBlobStore {
    pub reason: String,
}

impl RejectingBlobStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl BlobStore for RejectingBlobStore {
    fn put_object(
        &self,
        _key: String,
        _content_type: String,
        _size: u64,
        _payload: BlobPayload,
    ) -> Pin<Box<dyn Future<Output = Result<u64, BlobStoreError>> + Send + '_>> {
        let reason = self.reason.clone();
        Box::pin(async move { Err(BlobStoreError::Rejected(reason)) })
    }
}

#[cfg(test)]
mod tests {
    use super::{object_key, should_skip_capture, BlobStore, BodyDirection, MemoryBlobStore};

    #[test]
    fn skip_set_matches_streaming_content_types() {
        assert!(should_skip_capture("text/event-stream"));
        assert!(should_skip_capture("Text/Event-Stream; charset=utf-8"));
        assert!(should_skip_capture("multipart/x-mixed-replace; boundary=x"));
        assert!(should_skip_capture("websocket"));
        assert!(!should_skip_capture("application/json"));
        assert!(!should_skip_capture(""));
    }

    #[test]
    fn object_keys_carry_day_session_and_direction() {
        let key = object_key(42, BodyDirection::Request);
        assert!(key.starts_with("mitm-data/"));
        assert!(key.ends_with("/42/req"));
        let key = object_key(42, BodyDirection::Response);
        assert!(key.ends_with("/42/resp"));
    }

    #[tokio::test]
    async fn memory_store_round_trips_objects() {
        let store = MemoryBlobStore::new();
        let size = store
            .put_object(
                "k".to_string(),
                "text/plain".to_string(),
                5,
                Box::new(&b"hello"[..]),
            )
            .await
            .expect("upload");
        assert_eq!(size, 5);
        let object = store.get("k").expect("object stored");
        assert_eq!(object.data, b"hello");
        assert_eq!(object.content_type, "text/plain");
    }
}
