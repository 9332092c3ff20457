use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::BufMut;
use socket2::SockRef;
use tokio::io::AsyncWrite;
use tokio::net::{TcpSocket, TcpStream};

use crate::budget::ConnectBudget;
use crate::error::{Error, Result};
use crate::options::ConnectOptions;

pub trait Socket: Send + Sync + Unpin + 'static {
    fn try_read(&mut self, buf: &mut dyn BufMut) -> io::Result<usize>;

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    fn poll_flush(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // `flush()` is a no-op for TCP/UDS
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    fn read<'a, B: BufMut>(&'a mut self, buf: &'a mut B) -> Read<'a, Self, B>
    where
        Self: Sized,
    {
        Read { socket: self, buf }
    }

    fn write<'a>(&'a mut self, buf: &'a [u8]) -> Write<'a, Self>
    where
        Self: Sized,
    {
        Write { socket: self, buf }
    }

    fn flush(&mut self) -> Flush<'_, Self>
    where
        Self: Sized,
    {
        Flush { socket: self }
    }

    fn shutdown(&mut self) -> Shutdown<'_, Self>
    where
        Self: Sized,
    {
        Shutdown { socket: self }
    }
}

pub struct Read<'a, S: ?Sized, B> {
    socket: &'a mut S,
    buf: &'a mut B,
}

impl<S: ?Sized, B> Future for Read<'_, S, B>
where
    S: Socket,
    B: BufMut,
{
    type Output = io::Result<usize>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        while this.buf.has_remaining_mut() {
            match this.socket.try_read(&mut *this.buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ready!(this.socket.poll_read_ready(cx))?;
                }
                ready => return Poll::Ready(ready),
            }
        }

        Poll::Ready(Ok(0))
    }
}

pub struct Write<'a, S: ?Sized> {
    socket: &'a mut S,
    buf: &'a [u8],
}

impl<S: ?Sized> Future for Write<'_, S>
where
    S: Socket,
{
    type Output = io::Result<usize>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        while !this.buf.is_empty() {
            match this.socket.try_write(this.buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ready!(this.socket.poll_write_ready(cx))?;
                }
                ready => return Poll::Ready(ready),
            }
        }

        Poll::Ready(Ok(0))
    }
}

pub struct Flush<'a, S: ?Sized> {
    socket: &'a mut S,
}

impl<S: Socket + ?Sized> Future for Flush<'_, S> {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.socket.poll_flush(cx)
    }
}

pub struct Shutdown<'a, S: ?Sized> {
    socket: &'a mut S,
}

impl<S: ?Sized> Future for Shutdown<'_, S>
where
    S: Socket,
{
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.socket.poll_shutdown(cx)
    }
}

pub trait WithSocket {
    type Output;

    fn with_socket<S: Socket>(self, socket: S) -> impl Future<Output = Self::Output> + Send;
}

pub struct SocketIntoBox;

impl WithSocket for SocketIntoBox {
    type Output = Box<dyn Socket>;

    async fn with_socket<S: Socket>(self, socket: S) -> Self::Output {
        Box::new(socket)
    }
}

impl<S: Socket + ?Sized> Socket for Box<S> {
    fn try_read(&mut self, buf: &mut dyn BufMut) -> io::Result<usize> {
        (**self).try_read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).try_write(buf)
    }

    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        (**self).poll_read_ready(cx)
    }

    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        (**self).poll_write_ready(cx)
    }

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        (**self).poll_flush(cx)
    }

    fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        (**self).poll_shutdown(cx)
    }
}

impl Socket for TcpStream {
    fn try_read(&mut self, mut buf: &mut dyn BufMut) -> io::Result<usize> {
        // Requires `&mut impl BufMut`
        self.try_read_buf(&mut buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (*self).try_write(buf)
    }

    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        (*self).poll_read_ready(cx)
    }

    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        (*self).poll_write_ready(cx)
    }

    fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(self), cx)
    }
}

#[cfg(unix)]
impl Socket for tokio::net::UnixStream {
    fn try_read(&mut self, mut buf: &mut dyn BufMut) -> io::Result<usize> {
        self.try_read_buf(&mut buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (*self).try_write(buf)
    }

    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        (*self).poll_read_ready(cx)
    }

    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        (*self).poll_write_ready(cx)
    }

    fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(self), cx)
    }
}

/// Establish an async transport per the configured variant: a Unix domain
/// socket when a socket path is set, plain TCP otherwise.
///
/// Every await inside is bounded by the remaining connect budget.
pub async fn connect_async<Ws: WithSocket>(
    options: &ConnectOptions,
    with_socket: Ws,
) -> Result<Ws::Output> {
    let mut budget = ConnectBudget::new(options.connect_timeout);

    #[cfg(unix)]
    if let Some(path) = options.get_socket() {
        let stream = bounded(&mut budget, tokio::net::UnixStream::connect(path)).await??;
        return Ok(with_socket.with_socket(stream).await);
    }

    let stream = connect_tcp_async(options, &mut budget).await?;

    Ok(with_socket.with_socket(stream).await)
}

async fn connect_tcp_async(
    options: &ConnectOptions,
    budget: &mut ConnectBudget,
) -> Result<TcpStream> {
    budget.check()?;
    let addrs = resolve_async(options.get_host(), options.get_port(), budget).await?;

    let mut last_err = None;

    // Loop through all the socket addresses the hostname resolved to
    for addr in addrs {
        budget.check()?;

        match connect_candidate(addr, options, budget).await {
            Ok(stream) => return Ok(stream),
            Err(err @ Error::ConnectTimeout) => return Err(err),
            Err(Error::Io(err)) => {
                log::debug!("connect to {addr} failed: {err}");
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    match last_err {
        Some(source) => Err(Error::ConnectRefused { source }),
        None => Err(no_addresses()),
    }
}

async fn connect_candidate(
    addr: SocketAddr,
    options: &ConnectOptions,
    budget: &mut ConnectBudget,
) -> Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    apply_tuning(&socket, options)?;

    if let Some(ip) = options.local_address {
        socket.bind(SocketAddr::new(ip, 0))?;
    }

    let stream = bounded(budget, socket.connect(addr)).await??;

    Ok(stream)
}

fn apply_tuning(socket: &TcpSocket, options: &ConnectOptions) -> io::Result<()> {
    let sock = SockRef::from(socket);

    sock.set_nodelay(options.tcp_nodelay)?;

    if let Some(idle) = options.tcp_keepalive {
        sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(idle))?;
    }

    if let Some(size) = options.send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }

    if let Some(size) = options.recv_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }

    #[cfg(unix)]
    if let Some(tos) = options.traffic_class {
        sock.set_tos(tos)?;
    }

    Ok(())
}

async fn resolve_async(
    host: &str,
    port: u16,
    budget: &mut ConnectBudget,
) -> Result<Vec<SocketAddr>> {
    // IPv6 addresses in URLs are wrapped in brackets
    let host = host.trim_matches(|c| c == '[' || c == ']');

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let addrs: Vec<SocketAddr> = bounded(budget, tokio::net::lookup_host((host, port)))
        .await?
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

/// Run a future under the remaining budget, charging the elapsed time.
async fn bounded<F: Future>(budget: &mut ConnectBudget, fut: F) -> Result<F::Output> {
    budget.check()?;

    let out = match budget.remaining() {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::ConnectTimeout)?,
        None => fut.await,
    };

    budget.check()?;

    Ok(out)
}
