use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

use tunnel_core::Channel;

use crate::error::SocksError;

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

const MAX_MESSAGE_LEN: usize = 4096;

enum Host {
    Ip(IpAddr),
    Domain(String),
}

struct ConnectRequest {
    host: Host,
    port: u16,
}

/// Runs the SOCKS5 CONNECT handshake on `channel`'s application endpoint
/// and returns the connected target socket. Errors have already been
/// reported to the remote end of `channel` as a SOCKS5 reply before
/// being returned.
pub async fn negotiate(channel: &Channel) -> Result<TcpStream, SocksError> {
    await_greeting(channel).await?;
    let request = await_request(channel).await?;
    dial(channel, request).await
}

async fn await_greeting(channel: &Channel) -> Result<(), SocksError> {
    let greeting = channel.recv(MAX_MESSAGE_LEN).await?;
    if greeting.is_empty() {
        return Err(SocksError::BadSocksRequest);
    }
    channel.send(&[SOCKS_VERSION, 0x00]).await?;
    Ok(())
}

async fn await_request(channel: &Channel) -> Result<ConnectRequest, SocksError> {
    let request = channel.recv(MAX_MESSAGE_LEN).await?;
    if request.len() < 10 {
        return Err(SocksError::BadSocksRequest);
    }

    let ver = request[0];
    let cmd = request[1];
    let atyp = request[3];

    if ver != SOCKS_VERSION || cmd != CMD_CONNECT {
        let _ = channel
            .send(&[SOCKS_VERSION, REPLY_GENERAL_FAILURE, 0x00, 0x00])
            .await;
        return Err(SocksError::BadSocksRequest);
    }

    let (host, port) = match atyp {
        ATYP_IPV4 => {
            if request.len() < 10 {
                return Err(SocksError::BadSocksRequest);
            }
            let addr = Ipv4Addr::new(request[4], request[5], request[6], request[7]);
            let port = u16::from_be_bytes([request[8], request[9]]);
            (Host::Ip(IpAddr::V4(addr)), port)
        }
        ATYP_DOMAIN => {
            let len = *request.get(4).ok_or(SocksError::BadSocksRequest)? as usize;
            if request.len() < 5 + len + 2 {
                return Err(SocksError::BadSocksRequest);
            }
            let domain = String::from_utf8_lossy(&request[5..5 + len]).into_owned();
            let port = u16::from_be_bytes([request[5 + len], request[6 + len]]);
            (Host::Domain(domain), port)
        }
        ATYP_IPV6 => {
            if request.len() < 22 {
                return Err(SocksError::BadSocksRequest);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&request[4..20]);
            let port = u16::from_be_bytes([request[20], request[21]]);
            (Host::Ip(IpAddr::V6(Ipv6Addr::from(octets))), port)
        }
        other => {
            let _ = channel
                .send(&[SOCKS_VERSION, REPLY_ADDRESS_TYPE_NOT_SUPPORTED, 0x00, 0x00])
                .await;
            return Err(SocksError::UnsupportedAddressType(other));
        }
    };

    Ok(ConnectRequest { host, port })
}

async fn dial(channel: &Channel, request: ConnectRequest) -> Result<TcpStream, SocksError> {
    let attempted_atyp = attempted_atyp(&request.host);

    let target = match resolve(&request).await {
        Some(addr) => addr,
        None => {
            reply_dial_failed(channel, attempted_atyp).await;
            return Err(SocksError::DialFailed);
        }
    };

    match TcpStream::connect(target).await {
        Ok(stream) => {
            let bound = stream.local_addr()?;
            let reply = encode_reply(REPLY_SUCCESS, bound);
            channel.send(&reply).await?;
            Ok(stream)
        }
        Err(err) => {
            debug!(target = %target, error = %err, "SOCKS5 dial failed");
            reply_dial_failed(channel, attempted_atyp).await;
            Err(SocksError::DialFailed)
        }
    }
}

/// Domain names resolve to an IPv4 address, matching the address family
/// the request's own ATYP would imply for a plain IPv4/IPv6 request.
async fn resolve(request: &ConnectRequest) -> Option<SocketAddr> {
    match &request.host {
        Host::Ip(ip) => Some(SocketAddr::new(*ip, request.port)),
        Host::Domain(domain) => lookup_host((domain.as_str(), request.port))
            .await
            .ok()?
            .find(|addr| addr.is_ipv4()),
    }
}

/// The address family `resolve` will actually attempt: a domain name
/// always resolves to IPv4 here, so its reply (success or failure) is
/// always `ATYP_IPV4`, never the request's own `ATYP_DOMAIN` — there is
/// no CONNECT reply that ever carries `atyp=3`.
fn attempted_atyp(host: &Host) -> u8 {
    match host {
        Host::Ip(IpAddr::V4(_)) => ATYP_IPV4,
        Host::Ip(IpAddr::V6(_)) => ATYP_IPV6,
        Host::Domain(_) => ATYP_IPV4,
    }
}

async fn reply_dial_failed(channel: &Channel, atyp: u8) {
    let mut reply = vec![SOCKS_VERSION, REPLY_CONNECTION_REFUSED, 0x00, atyp];
    reply.extend_from_slice(&zero_bound_address(atyp));
    let _ = channel.send(&reply).await;
}

/// Zero-filled bound address sized for `atyp`. `reply_dial_failed` only
/// ever passes `ATYP_IPV4`/`ATYP_IPV6` (see `attempted_atyp`), never
/// `ATYP_DOMAIN` — a CONNECT reply never carries a domain-name address.
fn zero_bound_address(atyp: u8) -> Vec<u8> {
    match atyp {
        ATYP_IPV6 => vec![0x00; 18],
        _ => vec![0x00; 6],
    }
}

fn encode_reply(reply_code: u8, bound: SocketAddr) -> Vec<u8> {
    let mut out = vec![SOCKS_VERSION, reply_code, 0x00];
    match bound {
        SocketAddr::V4(addr) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    out
}
