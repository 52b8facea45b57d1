use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    /// Informational logging for per-exchange detail.
    pub verbose: bool,
    /// Declared for forward compatibility; must stay false. The outgoing
    /// transport negotiates HTTP/1.1 only.
    pub allow_http2: bool,
    /// Retain proxy-specific request headers instead of stripping them.
    pub keep_proxy_headers: bool,
    pub keep_accept_encoding: bool,
    /// Keep exact on-wire header casing instead of canonical MIME casing.
    pub prevent_canonicalization: bool,
    /// Preserve pre-existing entries when rebuilding client response headers.
    pub keep_dest_headers: bool,
    pub max_connect_head_bytes: usize,
    pub max_http_head_bytes: usize,
    pub exchange_backlog: usize,
    pub capture_pipe_depth: usize,
    pub ca_cert_pem_path: Option<String>,
    pub ca_key_pem_path: Option<String>,
    pub ca_common_name: String,
    pub ca_organization: String,
    pub leaf_cache_capacity: usize,
    pub upstream_tls_insecure_skip_verify: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 8080,
            verbose: false,
            allow_http2: false,
            keep_proxy_headers: false,
            keep_accept_encoding: false,
            prevent_canonicalization: false,
            keep_dest_headers: false,
            max_connect_head_bytes: 64 * 1024,
            max_http_head_bytes: 64 * 1024,
            exchange_backlog: glint_observe::DEFAULT_EXCHANGE_BACKLOG,
            capture_pipe_depth: glint_capture::DEFAULT_PIPE_DEPTH,
            ca_cert_pem_path: None,
            ca_key_pem_path: None,
            ca_common_name: "glint Local CA".to_string(),
            ca_organization: "glint".to_string(),
            leaf_cache_capacity: 1024,
            upstream_tls_insecure_skip_verify: false,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ProxyConfigError::EmptyListenAddr);
        }
        if self.allow_http2 {
            return Err(ProxyConfigError::Http2NotSupported);
        }
        if self.max_connect_head_bytes == 0 {
            return Err(ProxyConfigError::ZeroValue("max_connect_head_bytes"));
        }
        if self.max_http_head_bytes == 0 {
            return Err(ProxyConfigError::ZeroValue("max_http_head_bytes"));
        }
        if self.exchange_backlog == 0 {
            return Err(ProxyConfigError::ZeroValue("exchange_backlog"));
        }
        if self.capture_pipe_depth == 0 {
            return Err(ProxyConfigError::ZeroValue("capture_pipe_depth"));
        }
        if self.leaf_cache_capacity == 0 {
            return Err(ProxyConfigError::ZeroValue("leaf_cache_capacity"));
        }
        if self.ca_cert_pem_path.is_some() != self.ca_key_pem_path.is_some() {
            return Err(ProxyConfigError::InvalidCaPathPair);
        }
        if self.ca_common_name.trim().is_empty() {
            return Err(ProxyConfigError::EmptyCaCommonName);
        }
        if self.ca_organization.trim().is_empty() {
            return Err(ProxyConfigError::EmptyCaOrganization);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyConfigError {
    #[error("listen_addr must not be empty")]
    EmptyListenAddr,
    #[error("allow_http2 must be false; HTTP/2 is disabled end to end")]
    Http2NotSupported,
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("ca_cert_pem_path and ca_key_pem_path must be provided together")]
    InvalidCaPathPair,
    #[error("ca_common_name must not be empty")]
    EmptyCaCommonName,
    #[error("ca_organization must not be empty")]
    EmptyCaOrganization,
}
