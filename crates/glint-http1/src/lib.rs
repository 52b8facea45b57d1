mod body;
mod chunked;
mod conn;
mod head;
mod reader;

pub use body::{BodyRead, BytesBody, FramedBody};
pub use chunked::ChunkedWriter;
pub use conn::{BufferedStream, IO_CHUNK_SIZE};
pub use head::{
    canonical_header_name, encode_request_head, encode_response_head, is_websocket_handshake,
    parse_connect_authority, parse_request_head, parse_response_head, split_absolute_url,
    strip_port, BodyMode, ConnectTarget, HeadError, Header, HeaderBlock, HttpVersion, RequestHead,
    ResponseHead,
};
pub use reader::{ReadRequestError, RequestReader};
