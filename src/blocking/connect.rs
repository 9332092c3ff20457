use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

use crate::budget::ConnectBudget;
use crate::error::{Error, Result};
use crate::options::ConnectOptions;

use super::socks::{self, SocksTarget};

/// Open a blocking TCP connection to the configured host and port.
///
/// The hostname is resolved to all of its addresses, which are attempted in
/// resolver order; the first established connection wins. Each attempt is
/// bounded by the smaller of the explicit connect timeout and the remaining
/// budget. When every candidate fails the error from the last attempt is
/// returned.
pub fn connect_tcp(options: &ConnectOptions, budget: &mut ConnectBudget) -> Result<TcpStream> {
    budget.check()?;
    let addrs = resolve(&options.host, options.port)?;
    budget.check()?;

    open_tcp(&addrs, options, budget)
}

/// Open a blocking TCP connection through the configured SOCKS5 proxy.
///
/// With remote DNS the target hostname is sent to the proxy verbatim;
/// otherwise it is resolved locally and each address is attempted through
/// the proxy in resolver order.
pub fn connect_socks(options: &ConnectOptions, budget: &mut ConnectBudget) -> Result<TcpStream> {
    let proxy_host = options
        .socks_host
        .as_deref()
        .ok_or_else(|| Error::Configuration("SOCKS connect requested without a proxy host".into()))?;

    budget.check()?;
    let proxy_addrs = resolve(proxy_host, options.socks_port)?;
    budget.check()?;

    if options.socks_remote_dns {
        let target = SocksTarget::Domain(&options.host, options.port);
        return socks_attempt(&proxy_addrs, &target, options, budget);
    }

    let targets = resolve(&options.host, options.port)?;
    budget.check()?;

    let mut last_err = None;

    for target in targets {
        budget.check()?;

        match socks_attempt(&proxy_addrs, &SocksTarget::Addr(target), options, budget) {
            Ok(stream) => return Ok(stream),
            Err(err @ Error::ConnectTimeout) => return Err(err),
            Err(err) => {
                log::debug!("SOCKS connect to {target} failed: {err}");
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| no_addresses()))
}

fn socks_attempt(
    proxy_addrs: &[SocketAddr],
    target: &SocksTarget<'_>,
    options: &ConnectOptions,
    budget: &mut ConnectBudget,
) -> Result<TcpStream> {
    // a refused CONNECT leaves the proxy connection unusable, so every
    // target candidate gets a fresh proxy connection
    let mut stream = open_tcp(proxy_addrs, options, budget)?;

    stream.set_read_timeout(budget.bound(None))?;
    stream.set_write_timeout(budget.bound(None))?;

    socks::establish(&mut stream, target)?;
    budget.check()?;

    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;

    Ok(stream)
}

/// Connect to a local named pipe (Unix domain socket) at `path`.
///
/// A busy pipe is retried every 10ms until it accepts or the budget runs
/// out. If the pipe is busy and no timeout is configured at all, the attempt
/// fails immediately rather than polling forever.
#[cfg(unix)]
pub fn connect_pipe(
    path: &std::path::Path,
    budget: &mut ConnectBudget,
) -> Result<std::os::unix::net::UnixStream> {
    use std::os::unix::net::UnixStream;

    const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);

    loop {
        budget.check()?;

        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),

            Err(err) if is_pipe_busy(&err) => {
                if !budget.is_limited() {
                    return Err(Error::PipeBusy);
                }

                std::thread::sleep(POLL_INTERVAL);
            }

            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(unix)]
fn is_pipe_busy(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock)
        || matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EBUSY))
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    // IPv6 addresses in URLs are wrapped in brackets
    let host = host.trim_matches(|c| c == '[' || c == ']');

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| Error::ConnectRefused { source })?
        .collect();

    if addrs.is_empty() {
        return Err(no_addresses());
    }

    Ok(addrs)
}

fn no_addresses() -> Error {
    Error::ConnectRefused {
        source: io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "hostname did not resolve to any addresses",
        ),
    }
}

pub(crate) fn open_tcp(
    addrs: &[SocketAddr],
    options: &ConnectOptions,
    budget: &mut ConnectBudget,
) -> Result<TcpStream> {
    let mut last_err = None;

    // Loop through all the socket addresses the hostname resolved to
    for addr in addrs {
        budget.check()?;

        match connect_candidate(addr, options, budget) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                log::debug!("connect to {addr} failed: {err}");
                last_err = Some(err);
            }
        }
    }

    match last_err {
        Some(source) => Err(Error::ConnectRefused { source }),
        None => Err(no_addresses()),
    }
}

fn connect_candidate(
    addr: &SocketAddr,
    options: &ConnectOptions,
    budget: &ConnectBudget,
) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;

    apply_tuning(&socket, options)?;

    if let Some(ip) = options.local_address {
        socket.bind(&SocketAddr::new(ip, 0).into())?;
    }

    match budget.bound(options.connect_timeout) {
        Some(limit) => socket.connect_timeout(&(*addr).into(), limit)?,
        None => socket.connect(&(*addr).into())?,
    }

    Ok(socket.into())
}

fn apply_tuning(socket: &Socket, options: &ConnectOptions) -> io::Result<()> {
    socket.set_nodelay(options.tcp_nodelay)?;

    if let Some(idle) = options.tcp_keepalive {
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }

    if let Some(size) = options.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }

    if let Some(size) = options.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }

    #[cfg(unix)]
    if let Some(tos) = options.traffic_class {
        socket.set_tos(tos)?;
    }

    Ok(())
}
