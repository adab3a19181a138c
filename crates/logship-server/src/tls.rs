//! TLS configuration loading.
//!
//! PEM files in, rustls configs out. The server side optionally demands
//! client certificates (mutual TLS); the client side optionally presents
//! an identity. Server-facing and peer-facing configs are built
//! independently by the agent.

use logship_core::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(Error::Io)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::Config(format!("no private key in {}", path.display())))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::Config(format!("bad CA certificate: {e}")))?;
    }
    Ok(roots)
}

/// Server-facing TLS. With `client_ca` set, clients must present a
/// certificate signed by it (mutual TLS); its common name becomes the ACL
/// subject.
pub fn load_server_config(
    cert_file: &Path,
    key_file: &Path,
    client_ca: Option<&Path>,
) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let config = match client_ca {
        Some(ca) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(load_roots(ca)?))
                .build()
                .map_err(|e| Error::Config(format!("client verifier: {e}")))?;
            ServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key),
    }
    .map_err(|e| Error::Config(format!("server TLS: {e}")))?;

    Ok(Arc::new(config))
}

/// Peer-facing TLS: trust `ca_file`, optionally presenting the given
/// certificate/key pair as this dialer's identity.
pub fn load_client_config(
    ca_file: &Path,
    identity: Option<(&Path, &Path)>,
) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder().with_root_certificates(load_roots(ca_file)?);
    let config = match identity {
        Some((cert_file, key_file)) => builder
            .with_client_auth_cert(load_certs(cert_file)?, load_key(key_file)?)
            .map_err(|e| Error::Config(format!("client TLS: {e}")))?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}
