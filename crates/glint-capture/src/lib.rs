mod body;
mod store;

pub use body::{CapturedBody, CountedBody, DEFAULT_PIPE_DEPTH, UPLOAD_DEADLINE};
pub use store::{
    object_key, should_skip_capture, BlobPayload, BlobStore, BlobStoreError, BodyDirection,
    MemoryBlobStore, RejectingBlobStore, StoredObject,
};
