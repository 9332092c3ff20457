use std::io::{self, Read, Write};
use std::net::SocketAddr;

use crate::error::{Error, Result};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// The destination a SOCKS5 CONNECT asks the proxy to reach.
pub(crate) enum SocksTarget<'a> {
    /// A hostname the proxy resolves itself (remote DNS).
    Domain(&'a str, u16),
    /// A locally resolved address.
    Addr(SocketAddr),
}

/// Run the SOCKS5 no-auth greeting and CONNECT exchange on a connected
/// proxy stream. On success the stream carries end-to-end traffic.
pub(crate) fn establish<S: Read + Write>(stream: &mut S, target: &SocksTarget<'_>) -> Result<()> {
    stream.write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice)?;

    if choice[0] != SOCKS_VERSION {
        return Err(Error::protocol(format_args!(
            "proxy speaks SOCKS version {}, expected 5",
            choice[0]
        )));
    }

    if choice[1] != METHOD_NO_AUTH {
        return Err(Error::protocol(
            "proxy refused the no-authentication method",
        ));
    }

    stream.write_all(&connect_request(target)?)?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head)?;

    if head[0] != SOCKS_VERSION {
        return Err(Error::protocol("malformed SOCKS reply"));
    }

    if head[1] != 0x00 {
        return Err(Error::ConnectRefused {
            source: io::Error::new(io::ErrorKind::ConnectionRefused, reply_message(head[1])),
        });
    }

    // consume the bound address trailing the reply
    let remaining = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            usize::from(len[0]) + 2
        }
        other => {
            return Err(Error::protocol(format_args!(
                "unknown address type {other} in SOCKS reply"
            )));
        }
    };

    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound)?;

    Ok(())
}

fn connect_request(target: &SocksTarget<'_>) -> Result<Vec<u8>> {
    let mut request = Vec::with_capacity(22);
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00]);

    match target {
        SocksTarget::Domain(host, port) => {
            if host.len() > 255 {
                return Err(Error::protocol("hostname too long for a SOCKS request"));
            }

            request.push(ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
            request.extend_from_slice(&port.to_be_bytes());
        }

        SocksTarget::Addr(SocketAddr::V4(addr)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&addr.ip().octets());
            request.extend_from_slice(&addr.port().to_be_bytes());
        }

        SocksTarget::Addr(SocketAddr::V6(addr)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&addr.ip().octets());
            request.extend_from_slice(&addr.port().to_be_bytes());
        }
    }

    Ok(request)
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS failure",
    }
}
