//! Server-side TLS setup from a PEM certificate chain and private key.
//!
//! Clients are not asked for certificates. A missing or unreadable pair
//! fails startup; nothing is generated on the fly.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::info;

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path)
        .with_context(|| format!("open certificate {}", path.display()))?;
    let mut rd = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificate {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificate found in {}", path.display());
    }
    Ok(certs)
}

/// First PKCS#8, PKCS#1 or SEC1 key in the file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path).with_context(|| format!("open key {}", path.display()))?;
    let mut rd = BufReader::new(file);

    rustls_pemfile::private_key(&mut rd)
        .with_context(|| format!("parse key {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}

pub fn server_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server tls config")?;

    info!(cert = %cert_path.display(), "TLS configuration loaded");
    Ok(cfg)
}

pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(Arc::new(server_config(cert_path, key_path)?)))
}
