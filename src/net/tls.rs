//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Hold the process-wide TLS policy ([`TLS_PROFILE`])
//! - Validate and load a certificate/key pair at configuration time
//! - Keep the live config swappable for certificate reloads
//!
//! # Design Decisions
//! - The policy is not configurable: TLS 1.2 minimum, fixed key exchange
//!   preference, fixed cipher-suite allow-list
//! - Missing, empty or unparsable material is a [`ConfigError`], never a
//!   plaintext fallback and never a first-connection failure

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use axum_server::tls_rustls::RustlsConfig;
use rustls::crypto::aws_lc_rs::{cipher_suite, kx_group};
use rustls::crypto::{CryptoProvider, SupportedKxGroup};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};
use tokio_rustls::TlsAcceptor;

use crate::error::ConfigError;

static VERSIONS: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Process-wide TLS policy, built on first use and never mutated.
pub static TLS_PROFILE: LazyLock<TlsProfile> = LazyLock::new(TlsProfile::strict);

/// Immutable TLS policy shared by every TLS listener.
#[derive(Debug)]
pub struct TlsProfile {
    versions: &'static [&'static SupportedProtocolVersion],
    provider: Arc<CryptoProvider>,
}

impl TlsProfile {
    fn strict() -> Self {
        let provider = CryptoProvider {
            cipher_suites: vec![
                cipher_suite::TLS13_AES_128_GCM_SHA256,
                cipher_suite::TLS13_AES_256_GCM_SHA384,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            ],
            // Strongest first.
            kx_groups: vec![kx_group::SECP384R1, kx_group::SECP256R1, kx_group::X25519],
            ..rustls::crypto::aws_lc_rs::default_provider()
        };
        Self {
            versions: VERSIONS,
            provider: Arc::new(provider),
        }
    }

    /// Lowest protocol version a client may negotiate.
    pub fn min_version(&self) -> rustls::ProtocolVersion {
        use rustls::ProtocolVersion;

        if self.versions.iter().any(|v| v.version == ProtocolVersion::TLSv1_2) {
            ProtocolVersion::TLSv1_2
        } else {
            ProtocolVersion::TLSv1_3
        }
    }

    pub fn cipher_suites(&self) -> &[SupportedCipherSuite] {
        &self.provider.cipher_suites
    }

    pub fn kx_groups(&self) -> &[&'static dyn SupportedKxGroup] {
        &self.provider.kx_groups
    }

    /// Build a server config for the given chain and key under this policy.
    pub fn server_config(
        &self,
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<ServerConfig, rustls::Error> {
        let mut config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(self.versions)?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }
}

/// Loaded TLS material, reloadable in place.
#[derive(Clone)]
pub struct TlsMaterial {
    config: RustlsConfig,
}

impl TlsMaterial {
    /// Validate and load a certificate/key pair.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, ConfigError> {
        let config = load_server_config(cert_path, key_path)?;
        Ok(Self {
            config: RustlsConfig::from_config(Arc::new(config)),
        })
    }

    /// Replace the certificate pair used for new handshakes.
    ///
    /// On error the previous material stays in use.
    pub fn reload(&self, cert_path: &Path, key_path: &Path) -> Result<(), ConfigError> {
        let config = load_server_config(cert_path, key_path)?;
        self.config.reload_from_config(Arc::new(config));
        tracing::info!(cert = ?cert_path, key = ?key_path, "TLS material reloaded");
        Ok(())
    }

    /// Acceptor bound to the material current at call time.
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.config.get_inner())
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.config.get_inner()
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial").finish_non_exhaustive()
    }
}

fn non_empty_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// Load certificate chain and key files into a config restricted to
/// [`TLS_PROFILE`].
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, ConfigError> {
    if !non_empty_file(cert_path) {
        return Err(ConfigError::InvalidCertificate(cert_path.to_path_buf()));
    }
    if !non_empty_file(key_path) {
        return Err(ConfigError::InvalidKey(key_path.to_path_buf()));
    }

    let mut reader = BufReader::new(
        File::open(cert_path).map_err(|_| ConfigError::InvalidCertificate(cert_path.to_path_buf()))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("{}: {}", cert_path.display(), e)))?;
    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "{}: no certificates found",
            cert_path.display()
        )));
    }

    let mut reader =
        BufReader::new(File::open(key_path).map_err(|_| ConfigError::InvalidKey(key_path.to_path_buf()))?);
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ConfigError::Tls(format!("{}: {}", key_path.display(), e)))?
        .ok_or_else(|| ConfigError::Tls(format!("{}: no private key found", key_path.display())))?;

    TLS_PROFILE
        .server_config(certs, key)
        .map_err(|e| ConfigError::Tls(e.to_string()))
}
