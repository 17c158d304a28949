//! TLS credential loading and negotiator configuration.
//!
//! # Responsibilities
//! - Decide whether the secure path is enabled (both PEM files present)
//! - Parse the certificate chain and private key
//! - Build the rustls server configuration shared by every TLS connection
//!
//! # Design Decisions
//! - TLS 1.3 only, no session tickets, no session cache
//! - ALPN advertises `h2` ahead of `http/1.1`
//! - Missing files disable TLS; unreadable or malformed files are fatal

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

/// First byte of a TLS record carrying a handshake message.
pub const TLS_HANDSHAKE_RECORD: u8 = 22;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Failure to turn the configured PEM files into credential material.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot load credential pair: certificate {}: {source}", path.display())]
    Certificate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot load credential pair: private key {}: {source}", path.display())]
    PrivateKey {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot load credential pair: {0}")]
    Config(#[from] rustls::Error),
}

/// ALPN protocol list offered to clients, most preferred first.
pub fn alpn_protocols(http2: bool) -> Vec<Vec<u8>> {
    if http2 {
        vec![ALPN_H2.to_vec(), ALPN_HTTP1.to_vec()]
    } else {
        vec![ALPN_HTTP1.to_vec()]
    }
}

/// Treat a path as present unless the filesystem positively says it is not.
///
/// Permission errors count as present so that loading reports them.
fn file_exists(path: &str) -> bool {
    !matches!(Path::new(path).try_exists(), Ok(false))
}

/// Whether both credential paths are set and point at existing files.
pub fn credentials_present(cert_path: &str, key_path: &str) -> bool {
    !cert_path.is_empty() && !key_path.is_empty() && file_exists(cert_path) && file_exists(key_path)
}

/// Load the credential pair if it is configured.
///
/// Returns `Ok(None)` when either path is empty or either file is missing:
/// the server then runs plaintext only.
pub fn load_credentials(
    cert_path: &str,
    key_path: &str,
    http2: bool,
) -> Result<Option<TlsAcceptor>, TlsError> {
    if !credentials_present(cert_path, key_path) {
        tracing::info!(
            cert_path = %cert_path,
            key_path = %key_path,
            "credential pair not available; secure path disabled"
        );
        return Ok(None);
    }

    let acceptor = build_acceptor(Path::new(cert_path), Path::new(key_path), http2)?;
    tracing::info!(
        cert_path = %cert_path,
        key_path = %key_path,
        "credential pair loaded; secure path enabled"
    );
    Ok(Some(acceptor))
}

/// Load certificates from a PEM file.
fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no certificates found",
        ));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#1, PKCS#8 or SEC1) from a PEM file.
fn load_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found"))
}

/// Build the TLS negotiator from PEM certificate and key files.
pub fn build_acceptor(cert_path: &Path, key_path: &Path, http2: bool) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(cert_path).map_err(|source| TlsError::Certificate {
        path: cert_path.to_path_buf(),
        source,
    })?;
    let key = load_private_key(key_path).map_err(|source| TlsError::PrivateKey {
        path: key_path.to_path_buf(),
        source,
    })?;

    let config = server_config(certs, key, http2)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Server-side rustls configuration for the secure path.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    http2: bool,
) -> Result<rustls::ServerConfig, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    config.alpn_protocols = alpn_protocols(http2);
    config.session_storage = Arc::new(rustls::server::NoServerSessionStorage {});
    config.send_tls13_tickets = 0;

    tracing::debug!(
        alpn = ?config
            .alpn_protocols
            .iter()
            .map(|p| String::from_utf8_lossy(p))
            .collect::<Vec<_>>(),
        "rustls server configured"
    );
    Ok(config)
}

/// Application protocol agreed through ALPN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedProtocol {
    /// HTTP/2 was negotiated
    H2,
    /// HTTP/1.1 was negotiated
    Http1,
    /// No ALPN negotiation occurred
    None,
}

impl NegotiatedProtocol {
    pub fn from_alpn(alpn: Option<&[u8]>) -> Self {
        match alpn {
            Some(ALPN_H2) => NegotiatedProtocol::H2,
            Some(ALPN_HTTP1) => NegotiatedProtocol::Http1,
            _ => NegotiatedProtocol::None,
        }
    }
}
