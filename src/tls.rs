//! Static certificate loading for the HTTPS and DoT listeners

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};

/// ALPN protocols offered by the HTTPS listener
pub const HTTPS_ALPN: &[&[u8]] = &[b"h2", b"http/1.1"];

/// ALPN protocol offered by the DoT listener (RFC 7858)
pub const DOT_ALPN: &[&[u8]] = &[b"dot"];

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Certificate error: {0}")]
    Cert(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Failed to build TLS config: {0}")]
    Config(#[from] rustls::Error),
}

/// Build a rustls server configuration from PEM files
pub fn build_server_config(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
    alpn: &[&[u8]],
) -> Result<ServerConfig, TlsError> {
    let certs = load_certs(cert_path.as_ref())?;
    let key = load_private_key(key_path.as_ref())?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    Ok(config)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path)
        .map_err(|e| TlsError::Cert(format!("Failed to open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader).filter_map(|r| r.ok()).collect();

    if certs.is_empty() {
        return Err(TlsError::Cert(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path)
        .map_err(|e| TlsError::Key(format!("Failed to open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .map_err(|e| TlsError::Key(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| TlsError::Key(format!("No private key found in {}", path.display())))
}
