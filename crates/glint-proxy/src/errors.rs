use thiserror::Error;

use crate::config::ProxyConfigError;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ProxyConfigError),
    #[error("certificate authority failure: {0}")]
    Tls(#[from] glint_tls::TlsError),
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
