//! TLS material loading and rustls configuration.
//!
//! The server presents a certificate chain and private key; the client
//! trusts one or more root certificates. There is no client authentication.
//! The ring crypto provider is selected explicitly, so nothing depends on a
//! process-wide default provider being installed.

use crate::transport::{TransportError, TransportResult};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load every certificate from a PEM file
pub fn load_certs(path: impl AsRef<Path>) -> TransportResult<Vec<CertificateDer<'static>>> {
    let path = path.as_ref();
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| TransportError::Certificate(format!("{}: {e}", path.display())))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Certificate(format!("{}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(TransportError::Certificate(format!(
            "{}: no certificates found",
            path.display()
        )));
    }

    tracing::debug!("Loaded {} certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file
pub fn load_private_key(path: impl AsRef<Path>) -> TransportResult<PrivateKeyDer<'static>> {
    let path = path.as_ref();
    PrivateKeyDer::from_pem_file(path)
        .map_err(|e| TransportError::Certificate(format!("{}: {e}", path.display())))
}

/// Build a server configuration from a certificate chain and key
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> TransportResult<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Build a server configuration from PEM files
pub fn server_config_from_files(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> TransportResult<Arc<ServerConfig>> {
    server_config(load_certs(cert_path)?, load_private_key(key_path)?)
}

/// Build a client configuration trusting exactly `roots`
pub fn client_config(roots: Vec<CertificateDer<'static>>) -> TransportResult<Arc<ClientConfig>> {
    let mut store = RootCertStore::empty();
    for root in roots {
        store.add(root)?;
    }

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Build a client configuration trusting the roots in a PEM file
pub fn client_config_from_file(ca_path: impl AsRef<Path>) -> TransportResult<Arc<ClientConfig>> {
    client_config(load_certs(ca_path)?)
}

/// Parse the name the server certificate must match
pub fn server_name(name: &str) -> TransportResult<ServerName<'static>> {
    ServerName::try_from(name.to_string())
        .map_err(|_| TransportError::InvalidServerName(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::PrivatePkcs8KeyDer;
    use std::io::Write;

    fn self_signed() -> rcgen::CertifiedKey {
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap()
    }

    #[test]
    fn test_load_pem_files() {
        let ck = self_signed();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");

        std::fs::File::create(&cert_path)
            .unwrap()
            .write_all(ck.cert.pem().as_bytes())
            .unwrap();
        std::fs::File::create(&key_path)
            .unwrap()
            .write_all(ck.key_pair.serialize_pem().as_bytes())
            .unwrap();

        let certs = load_certs(&cert_path).unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].as_ref(), ck.cert.der().as_ref());

        assert!(server_config_from_files(&cert_path, &key_path).is_ok());
        assert!(client_config_from_file(&cert_path).is_ok());
    }

    #[test]
    fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_certs(dir.path().join("absent.crt")),
            Err(TransportError::Certificate(_))
        ));
        assert!(matches!(
            load_private_key(dir.path().join("absent.key")),
            Err(TransportError::Certificate(_))
        ));
    }

    #[test]
    fn test_empty_cert_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.crt");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(load_certs(&path), Err(TransportError::Certificate(_))));
    }

    #[test]
    fn test_server_config_in_memory() {
        let ck = self_signed();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(ck.key_pair.serialize_der()));
        assert!(server_config(vec![ck.cert.der().clone()], key).is_ok());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("localhost").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(matches!(
            server_name("not a host"),
            Err(TransportError::InvalidServerName(_))
        ));
    }
}
