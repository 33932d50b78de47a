use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to complete TLS handshake with the relay: {0}")]
    TlsHandshake(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
