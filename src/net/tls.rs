//! TLS material loading.
//!
//! Certificates and keys are read once at startup. Any problem here is fatal:
//! the proxy never discovers bad TLS material per connection.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

/// Only HTTP/1.1 is decoded inside intercepted tunnels.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Errors raised while loading certificates and keys.
#[derive(Debug, Error)]
pub enum TlsMaterialError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Crypto provider shared by the client and server configurations.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Read every PEM certificate in `path`.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsMaterialError> {
    let file = File::open(path).map_err(|source| TlsMaterialError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsMaterialError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsMaterialError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Read the first PEM private key (PKCS#1, PKCS#8 or SEC1) in `path`.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsMaterialError> {
    let file = File::open(path).map_err(|source| TlsMaterialError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|source| TlsMaterialError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsMaterialError::NoPrivateKey(path.to_path_buf()))
}

/// Build the acceptor that terminates intercepted CONNECT tunnels.
pub fn load_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, TlsMaterialError> {
    let certs = load_certs(Path::new(&config.cert_path))?;
    let key = load_private_key(Path::new(&config.key_path))?;

    let mut server_config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    server_config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

    tracing::info!(
        cert_path = %config.cert_path,
        "Loaded interception certificate"
    );

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_generated_pair() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = write_temp(&generated.cert.pem());
        let key = write_temp(&generated.key_pair.serialize_pem());

        let config = TlsConfig {
            cert_path: cert.path().display().to_string(),
            key_path: key.path().display().to_string(),
        };
        assert!(load_acceptor(&config).is_ok());
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = load_certs(Path::new("/nonexistent/certificate.crt")).unwrap_err();
        assert!(matches!(err, TlsMaterialError::Read { .. }));
    }

    #[test]
    fn garbage_is_rejected() {
        let garbage = write_temp("this is not PEM\n");
        assert!(matches!(
            load_certs(garbage.path()),
            Err(TlsMaterialError::NoCertificates(_))
        ));
        assert!(matches!(
            load_private_key(garbage.path()),
            Err(TlsMaterialError::NoPrivateKey(_))
        ));
    }
}
