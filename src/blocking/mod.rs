//! Blocking transport surface: std-socket connect variants, in-place TLS
//! upgrade, and read-ahead buffering.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::budget::ConnectBudget;
use crate::error::Result;
use crate::options::ConnectOptions;

mod connect;
mod read_ahead;
mod socks;
mod tls;

pub use connect::{connect_socks, connect_tcp};
pub use read_ahead::{Available, ReadAheadBuffer};
pub use tls::MaybeTlsStream;

#[cfg(unix)]
pub use connect::connect_pipe;

/// A connected blocking stream, over whichever transport the options chose.
#[derive(Debug)]
pub enum NetStream {
    Tcp(TcpStream),

    #[cfg(unix)]
    Pipe(std::os::unix::net::UnixStream),
}

/// Establish a blocking transport per the configured variant: a named pipe
/// when a socket path is set, a SOCKS5-proxied connection when a proxy host
/// is set, and plain TCP otherwise.
///
/// The returned stream is unencrypted; the protocol layer upgrades it with
/// [`MaybeTlsStream::upgrade`] once it has negotiated TLS with the server.
pub fn connect(options: &ConnectOptions) -> Result<MaybeTlsStream<NetStream>> {
    let mut budget = ConnectBudget::new(options.connect_timeout);

    #[cfg(unix)]
    if let Some(path) = &options.socket {
        let stream = connect_pipe(path, &mut budget)?;
        return Ok(MaybeTlsStream::new(NetStream::Pipe(stream)));
    }

    let stream = if options.socks_host.is_some() {
        connect_socks(options, &mut budget)?
    } else {
        connect_tcp(options, &mut budget)?
    };

    Ok(MaybeTlsStream::new(NetStream::Tcp(stream)))
}

impl Read for NetStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            NetStream::Tcp(stream) => stream.read(buf),

            #[cfg(unix)]
            NetStream::Pipe(stream) => stream.read(buf),
        }
    }
}

impl Write for NetStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            NetStream::Tcp(stream) => stream.write(buf),

            #[cfg(unix)]
            NetStream::Pipe(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            NetStream::Tcp(stream) => stream.flush(),

            #[cfg(unix)]
            NetStream::Pipe(stream) => stream.flush(),
        }
    }
}

impl Available for NetStream {
    fn available(&self) -> std::io::Result<usize> {
        match self {
            NetStream::Tcp(stream) => stream.available(),

            #[cfg(unix)]
            NetStream::Pipe(stream) => stream.available(),
        }
    }
}
