//! TLS configuration for the tunnel transport: a static certificate/key
//! pair on the Server side, the host's default trust store (or an
//! `--insecure` override) on the Relay side.

mod client;
mod error;
mod server;

pub use client::build_client_config;
pub use error::TlsError;
pub use server::load_server_config;

pub use tokio_rustls::{TlsAcceptor, TlsConnector};
