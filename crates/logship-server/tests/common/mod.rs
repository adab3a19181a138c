//! Shared fixtures for server tests: a throwaway CA with server and client
//! leaf certificates, minted fresh per test run.

#![allow(dead_code)]

use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, SanType};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

pub struct TlsFixtures {
    pub ca_file: PathBuf,
    pub server_cert_file: PathBuf,
    pub server_key_file: PathBuf,
    /// Client identity with common name "root".
    pub root_cert_file: PathBuf,
    pub root_key_file: PathBuf,
    /// Client identity with common name "nobody".
    pub nobody_cert_file: PathBuf,
    pub nobody_key_file: PathBuf,
}

/// Mint a CA plus server and client leaves under `dir`. The server leaf is
/// valid for localhost; the client leaves carry the common names the ACL
/// policy speaks about.
pub fn generate_tls_fixtures(dir: &Path) -> TlsFixtures {
    let ca_key = KeyPair::generate().expect("generate CA key");
    let mut ca_params = CertificateParams::default();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "logship-test-ca");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).expect("self-sign CA");

    let ca_file = dir.join("ca.pem");
    std::fs::write(&ca_file, ca_cert.pem()).expect("write CA");

    let (server_cert_file, server_key_file) =
        write_server_identity(dir, "server", &ca_cert, &ca_key);
    let (root_cert_file, root_key_file) = write_client_identity(dir, "root", &ca_cert, &ca_key);
    let (nobody_cert_file, nobody_key_file) =
        write_client_identity(dir, "nobody", &ca_cert, &ca_key);

    TlsFixtures {
        ca_file,
        server_cert_file,
        server_key_file,
        root_cert_file,
        root_key_file,
        nobody_cert_file,
        nobody_key_file,
    }
}

fn write_server_identity(
    dir: &Path,
    name: &str,
    ca_cert: &Certificate,
    ca_key: &KeyPair,
) -> (PathBuf, PathBuf) {
    let mut params =
        CertificateParams::new(vec!["localhost".to_string()]).expect("server params");
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    params
        .distinguished_name
        .push(DnType::CommonName, "localhost");
    write_identity(dir, name, ca_cert, ca_key, params)
}

fn write_client_identity(
    dir: &Path,
    common_name: &str,
    ca_cert: &Certificate,
    ca_key: &KeyPair,
) -> (PathBuf, PathBuf) {
    let mut params = CertificateParams::new(Vec::new()).expect("client params");
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    write_identity(dir, common_name, ca_cert, ca_key, params)
}

fn write_identity(
    dir: &Path,
    name: &str,
    ca_cert: &Certificate,
    ca_key: &KeyPair,
    params: CertificateParams,
) -> (PathBuf, PathBuf) {
    let key = KeyPair::generate().expect("generate leaf key");
    let cert = params.signed_by(&key, ca_cert, ca_key).expect("sign leaf");

    let cert_file = dir.join(format!("{name}.pem"));
    let key_file = dir.join(format!("{name}.key"));
    std::fs::write(&cert_file, cert.pem()).expect("write cert");
    std::fs::write(&key_file, key.serialize_pem()).expect("write key");
    (cert_file, key_file)
}
