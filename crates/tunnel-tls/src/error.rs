use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} contains no PEM-encoded certificates")]
    NoCertificates { path: PathBuf },

    #[error("{path} contains no PEM-encoded private key")]
    NoPrivateKey { path: PathBuf },

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}
