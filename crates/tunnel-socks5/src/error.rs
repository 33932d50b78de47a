use thiserror::Error;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("malformed SOCKS5 request")]
    BadSocksRequest,

    #[error("unsupported SOCKS5 address type 0x{0:02x}")]
    UnsupportedAddressType(u8),

    #[error("failed to dial SOCKS5 target")]
    DialFailed,

    #[error(transparent)]
    Channel(#[from] tunnel_core::TunnelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
