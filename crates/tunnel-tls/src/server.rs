use std::fs;
use std::io::BufReader;
use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tracing::debug;

use crate::error::TlsError;

/// Loads a static certificate + private key pair into a server-side TLS
/// config with no client authentication. No renewal, no ACME: the spec
/// names only a certificate/key pair supplied once at startup.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, TlsError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    debug!(cert = %cert_path.display(), key = %key_path.display(), "loaded TLS certificate");

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let bytes = read_file(path)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(bytes.as_slice()))
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates {
            path: path.to_path_buf(),
        });
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let bytes = read_file(path)?;
    rustls_pemfile::private_key(&mut BufReader::new(bytes.as_slice()))
        .map_err(|source| TlsError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey {
            path: path.to_path_buf(),
        })
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct TempPaths {
        cert: std::path::PathBuf,
        key: std::path::PathBuf,
    }

    impl Drop for TempPaths {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.cert);
            let _ = fs::remove_file(&self.key);
        }
    }

    fn write_self_signed_pair(unique: &str) -> TempPaths {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let dir = std::env::temp_dir();
        let paths = TempPaths {
            cert: dir.join(format!("tunnel-tls-test-{unique}-cert.pem")),
            key: dir.join(format!("tunnel-tls-test-{unique}-key.pem")),
        };
        std::fs::File::create(&paths.cert)
            .unwrap()
            .write_all(cert.cert.pem().as_bytes())
            .unwrap();
        std::fs::File::create(&paths.key)
            .unwrap()
            .write_all(cert.signing_key.serialize_pem().as_bytes())
            .unwrap();
        paths
    }

    #[test]
    fn loads_a_valid_pem_pair() {
        let paths = write_self_signed_pair("happy-path");
        assert!(load_server_config(&paths.cert, &paths.key).is_ok());
    }

    #[test]
    fn missing_file_is_reported() {
        let missing = std::env::temp_dir().join("tunnel-tls-test-does-not-exist.pem");
        let err = load_certs(&missing).unwrap_err();
        assert!(matches!(err, TlsError::ReadFile { .. }));
    }
}
