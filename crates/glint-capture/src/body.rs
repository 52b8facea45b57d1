use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use glint_http1::BodyRead;
use glint_observe::{CaptureState, SharedCapture, TrafficCounter, TrafficGauges};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::store::{object_key, should_skip_capture, BlobStore, BlobStoreError, BodyDirection};

pub const UPLOAD_DEADLINE: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_PIPE_DEPTH: usize = 32;

/// Counts every byte read off the wrapped body into the per-exchange
/// counter, the parent tunnel's counter, and the process gauges. The close
/// hook fires once, after any capture layer above has settled.
pub struct CountedBody<B> {
    inner: B,
    counter: Arc<TrafficCounter>,
    parent: Option<Arc<TrafficCounter>>,
    gauges: Arc<TrafficGauges>,
    direction: BodyDirection,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl<B: BodyRead> CountedBody<B> {
    pub fn new(
        inner: B,
        counter: Arc<TrafficCounter>,
        parent: Option<Arc<TrafficCounter>>,
        gauges: Arc<TrafficGauges>,
        direction: BodyDirection,
    ) -> Self {
        Self {
            inner,
            counter,
            parent,
            gauges,
            direction,
            on_close: None,
        }
    }

    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub async fn close(mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl<B: BodyRead> BodyRead for CountedBody<B> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf).await?;
        if read > 0 {
            let bytes = read as u64;
            match self.direction {
                BodyDirection::Request => {
                    self.counter.add_req_body(bytes);
                    if let Some(parent) = &self.parent {
                        parent.add_req_body(bytes);
                    }
                    self.gauges.add_up(bytes);
                }
                BodyDirection::Response => {
                    self.counter.add_resp_body(bytes);
                    if let Some(parent) = &self.parent {
                        parent.add_resp_body(bytes);
                    }
                    self.gauges.add_down(bytes);
                }
            }
        }
        Ok(read)
    }
}

struct CapturePipe {
    tx: mpsc::Sender<Bytes>,
    worker: JoinHandle<()>,
}

/// Tees body bytes into an object-store upload through a bounded pipe.
///
/// When capture is disabled or the content type is in the skip set the
/// wrapper is a transparent pass-through. Pipe-write failures are recorded
/// in the capture state, never surfaced on the data path. `close` does not
/// return until the upload worker has terminated, so whoever runs after it
/// observes the final upload state.
pub struct CapturedBody<B> {
    inner: CountedBody<B>,
    pipe: Option<CapturePipe>,
    state: Option<SharedCapture>,
}

impl<B: BodyRead> CapturedBody<B> {
    pub fn passthrough(inner: CountedBody<B>) -> Self {
        Self {
            inner,
            pipe: None,
            state: None,
        }
    }

    pub fn new(
        inner: CountedBody<B>,
        store: Option<Arc<dyn BlobStore>>,
        session: u64,
        direction: BodyDirection,
        content_type: &str,
        declared_length: Option<u64>,
        pipe_depth: usize,
    ) -> Self {
        let Some(store) = store else {
            return Self::passthrough(inner);
        };
        if should_skip_capture(content_type) {
            return Self::passthrough(inner);
        }

        let state: SharedCapture = Arc::new(std::sync::Mutex::new(CaptureState {
            object_key: object_key(session, direction),
            content_type: content_type.to_string(),
            ..CaptureState::default()
        }));
        let (tx, rx) = mpsc::channel(pipe_depth.max(1));
        let worker = tokio::spawn(run_upload(
            store,
            Arc::clone(&state),
            declared_length,
            rx,
        ));

        Self {
            inner,
            pipe: Some(CapturePipe { tx, worker }),
            state: Some(state),
        }
    }

    pub fn capture_state(&self) -> Option<SharedCapture> {
        self.state.clone()
    }

    /// Closes the pipe, waits for the upload worker, then closes the inner
    /// counting body (firing its hook).
    pub async fn close(mut self) {
        if let Some(pipe) = self.pipe.take() {
            drop(pipe.tx);
            if pipe.worker.await.is_err() {
                if let Some(state) = &self.state {
                    let mut state = state.lock().expect("capture lock poisoned");
                    if state.error.is_none() {
                        state.error = Some("upload worker panicked".to_string());
                    }
                }
            }
        }
        self.inner.close().await;
    }

    fn record_pipe_error(&self) {
        if let Some(state) = &self.state {
            let mut state = state.lock().expect("capture lock poisoned");
            if state.error.is_none() {
                state.error = Some("capture pipe closed early".to_string());
            }
        }
    }
}

impl<B: BodyRead> BodyRead for CapturedBody<B> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf).await?;
        if read > 0 {
            if let Some(pipe) = &self.pipe {
                if pipe
                    .tx
                    .send(Bytes::copy_from_slice(&buf[..read]))
                    .await
                    .is_err()
                {
                    self.record_pipe_error();
                }
            }
        }
        Ok(read)
    }
}

async fn run_upload(
    store: Arc<dyn BlobStore>,
    state: SharedCapture,
    declared_length: Option<u64>,
    rx: mpsc::Receiver<Bytes>,
) {
    let (key, content_type) = {
        let state = state.lock().expect("capture lock poisoned");
        (state.object_key.clone(), state.content_type.clone())
    };

    let outcome = tokio::time::timeout(UPLOAD_DEADLINE, async {
        match declared_length {
            Some(length) => {
                store
                    .put_object(key, content_type, length, Box::new(PipeReader::new(rx)))
                    .await
            }
            None => spool_then_upload(store.as_ref(), key, content_type, rx).await,
        }
    })
    .await;

    let mut state = state.lock().expect("capture lock poisoned");
    match outcome {
        Ok(Ok(size)) => {
            state.size = size;
            state.uploaded = true;
            state.error = None;
        }
        Ok(Err(error)) => {
            state.error = Some(error.to_string());
        }
        Err(_) => {
            state.error = Some("upload deadline exceeded".to_string());
        }
    }
}

/// Unknown length: spool to an unlinked temporary file, then upload with
/// the now-known size. The file is gone on every exit path because it was
/// never named.
async fn spool_then_upload(
    store: &dyn BlobStore,
    key: String,
    content_type: String,
    mut rx: mpsc::Receiver<Bytes>,
) -> Result<u64, BlobStoreError> {
    let spool = tempfile::tempfile()?;
    let mut file = tokio::fs::File::from_std(spool);
    let mut size = 0_u64;
    while let Some(chunk) = rx.recv().await {
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    file.flush().await?;
    file.rewind().await?;

    let content_type = if content_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        content_type
    };
    store
        .put_object(key, content_type, size, Box::new(file))
        .await
}

struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl PipeReader {
    fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.current.is_empty() {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.current = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let take = std::cmp::min(buf.remaining(), self.current.len());
        buf.put_slice(&self.current.split_to(take));
        Poll::Ready(Ok(()))
    }
}
