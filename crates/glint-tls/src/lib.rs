use std::fs;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("authority state lock poisoned")]
    LockPoisoned,
    #[error("invalid authority configuration: {0}")]
    InvalidConfiguration(String),
}

/// Hands out a TLS server config with a certificate forged for `host`.
/// Pipelines only see this trait; the strategy may swap in its own issuer.
pub trait CertificateAuthority: Send + Sync + 'static {
    fn server_config_for_host(&self, host: &str) -> Result<Arc<ServerConfig>, TlsError>;

    fn ca_certificate_pem(&self) -> Result<String, TlsError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityConfig {
    pub ca_cert_pem_path: Option<String>,
    pub ca_key_pem_path: Option<String>,
    pub common_name: String,
    pub organization: String,
    pub leaf_cache_capacity: usize,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            ca_cert_pem_path: None,
            ca_key_pem_path: None,
            common_name: "glint Local CA".to_string(),
            organization: "glint".to_string(),
            leaf_cache_capacity: 1024,
        }
    }
}

impl AuthorityConfig {
    fn validate(&self) -> Result<(), TlsError> {
        if self.ca_cert_pem_path.is_some() != self.ca_key_pem_path.is_some() {
            return Err(TlsError::InvalidConfiguration(
                "ca_cert_pem_path and ca_key_pem_path must be set together".to_string(),
            ));
        }
        if self.common_name.trim().is_empty() {
            return Err(TlsError::InvalidConfiguration(
                "common_name must not be empty".to_string(),
            ));
        }
        if self.organization.trim().is_empty() {
            return Err(TlsError::InvalidConfiguration(
                "organization must not be empty".to_string(),
            ));
        }
        if self.leaf_cache_capacity == 0 {
            return Err(TlsError::InvalidConfiguration(
                "leaf_cache_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_pem: String,
}

/// A forged leaf ready to serve: the rustls server config plus the leaf
/// certificate DER for callers that want to inspect what was issued.
#[derive(Debug, Clone)]
pub struct IssuedLeaf {
    pub server_config: Arc<ServerConfig>,
    pub leaf_cert_der: CertificateDer<'static>,
}

#[derive(Debug)]
struct AuthorityState {
    ca: CaMaterial,
    leaf_cache: LruCache<String, IssuedLeaf>,
}

/// rcgen-backed signing authority with an LRU cache of per-host leaves.
/// CA material is loaded from disk when both paths exist, generated and
/// persisted when both are absent.
#[derive(Debug)]
pub struct SigningAuthority {
    state: Mutex<AuthorityState>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl SigningAuthority {
    pub fn new(config: AuthorityConfig) -> Result<Self, TlsError> {
        config.validate()?;
        let ca = load_or_generate_ca(&config)?;
        let capacity = NonZeroUsize::new(config.leaf_cache_capacity)
            .expect("capacity validated non-zero");
        Ok(Self {
            state: Mutex::new(AuthorityState {
                ca,
                leaf_cache: LruCache::new(capacity),
            }),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn issue_for_host(&self, host: &str) -> Result<IssuedLeaf, TlsError> {
        let normalized = normalize_host(host);
        let mut state = self.state.lock().map_err(|_| TlsError::LockPoisoned)?;

        if let Some(cached) = state.leaf_cache.get(&normalized) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached.clone());
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let issued = issue_leaf(&state.ca, &normalized)?;
        state.leaf_cache.put(normalized, issued.clone());
        Ok(issued)
    }
}

impl CertificateAuthority for SigningAuthority {
    fn server_config_for_host(&self, host: &str) -> Result<Arc<ServerConfig>, TlsError> {
        Ok(self.issue_for_host(host)?.server_config)
    }

    fn ca_certificate_pem(&self) -> Result<String, TlsError> {
        let state = self.state.lock().map_err(|_| TlsError::LockPoisoned)?;
        Ok(state.ca.cert_pem.clone())
    }
}

/// Client config for the proxy-to-origin leg. ALPN is pinned to HTTP/1.1;
/// HTTP/2 stays disabled on the outgoing transport.
pub fn upstream_client_config(insecure_skip_verify: bool) -> Arc<ClientConfig> {
    let mut config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Client config that trusts a single CA certificate, for talking to a
/// MITM endpoint whose forged chain roots at that CA.
pub fn client_config_trusting_ca(ca_pem: &str) -> Result<Arc<ClientConfig>, TlsError> {
    let ca_der = CertificateDer::from_pem_slice(ca_pem.as_bytes()).map_err(|error| {
        TlsError::InvalidConfiguration(format!("failed to parse CA certificate PEM: {error}"))
    })?;
    let mut roots = RootCertStore::empty();
    roots
        .add(ca_der)
        .map_err(|error| TlsError::InvalidConfiguration(error.to_string()))?;
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

fn load_or_generate_ca(config: &AuthorityConfig) -> Result<CaMaterial, TlsError> {
    match (&config.ca_cert_pem_path, &config.ca_key_pem_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_exists = Path::new(cert_path).exists();
            let key_exists = Path::new(key_path).exists();
            match (cert_exists, key_exists) {
                (true, true) => load_ca(cert_path, key_path),
                (false, false) => {
                    let generated = generate_ca(config)?;
                    persist_ca(cert_path, key_path, &generated)?;
                    Ok(generated)
                }
                _ => Err(TlsError::InvalidConfiguration(
                    "CA cert and key files must both exist or both be absent".to_string(),
                )),
            }
        }
        (None, None) => generate_ca(config),
        _ => Err(TlsError::InvalidConfiguration(
            "ca_cert_pem_path and ca_key_pem_path must be set together".to_string(),
        )),
    }
}

fn generate_ca(config: &AuthorityConfig) -> Result<CaMaterial, TlsError> {
    let ca_key = KeyPair::generate()?;
    let key_pem = ca_key.serialize_pem();

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, config.common_name.clone());
    dn.push(DnType::OrganizationName, config.organization.clone());
    params.distinguished_name = dn;

    let ca_cert = params.self_signed(&ca_key)?;
    let cert_pem = ca_cert.pem();
    let cert_der = ca_cert.der().clone();
    let issuer = Issuer::new(params, ca_key);

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn load_ca(cert_path: &str, key_path: &str) -> Result<CaMaterial, TlsError> {
    let cert_pem = fs::read_to_string(cert_path)?;
    let key_pem = fs::read_to_string(key_path)?;
    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        TlsError::InvalidConfiguration(format!(
            "failed to parse CA certificate PEM from {cert_path}: {error}"
        ))
    })?;
    let ca_key = KeyPair::from_pem(&key_pem)?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, ca_key).map_err(|error| {
        TlsError::InvalidConfiguration(format!(
            "failed to parse issuer metadata from CA certificate {cert_path}: {error}"
        ))
    })?;

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn persist_ca(cert_path: &str, key_path: &str, ca: &CaMaterial) -> Result<(), TlsError> {
    ensure_parent_exists(cert_path)?;
    ensure_parent_exists(key_path)?;
    fs::write(cert_path, ca.cert_pem.as_bytes())?;
    fs::write(key_path, ca.key_pem.as_bytes())?;
    Ok(())
}

fn ensure_parent_exists(path: &str) -> Result<(), TlsError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn issue_leaf(ca: &CaMaterial, host: &str) -> Result<IssuedLeaf, TlsError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host.to_string());
    params.distinguished_name = dn;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    let leaf_key = KeyPair::generate()?;
    let leaf_key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
    let leaf_cert = params.signed_by(&leaf_key, &ca.issuer)?;

    let leaf_cert_der = leaf_cert.der().clone();
    let chain = vec![leaf_cert_der.clone(), ca.cert_der.clone()];
    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, PrivateKeyDer::from(leaf_key_der))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(IssuedLeaf {
        server_config: Arc::new(server_config),
        leaf_cert_der,
    })
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}
