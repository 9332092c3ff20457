use std::io::{self, Read as _, Write as _};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_channel::oneshot;
use rustls::pki_types::ServerName;
use rustls::ClientConnection;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::{Error, Result};
use crate::net::WriteQueue;
use crate::options::{ConnectOptions, SslMode};
use crate::tls::{self, TlsMaterials};

/// Ciphertext buffers retained for reuse; beyond this they are released.
const CIPHER_POOL_MAX: usize = 10;

/// How much spare capacity each transport read gets.
const READ_CHUNK: usize = 8192;

type InFlight = Vec<(oneshot::Receiver<io::Result<usize>>, Bytes)>;

/// An encrypted async channel over a split transport.
///
/// The two directions share one TLS session behind a mutex that is only held
/// across session operations, never across transport I/O. `&mut self` on each
/// half enforces one outstanding operation per direction; [`split`] hands the
/// halves out so reads and writes can run concurrently.
///
/// [`split`]: TlsChannel::split
pub struct TlsChannel<S> {
    read: TlsReadHalf<S>,
    write: TlsWriteHalf<S>,
}

/// The decrypting read half of a [`TlsChannel`].
pub struct TlsReadHalf<S> {
    session: Arc<Mutex<ClientConnection>>,
    transport: ReadHalf<S>,
    /// Ciphertext staged from the transport, not yet fed to the session.
    /// Grows as needed and never shrinks.
    cipher_buf: BytesMut,
    /// Plaintext decrypted but not yet handed to the caller.
    clear_buf: BytesMut,
    closed: Arc<AtomicBool>,
}

/// The encrypting write half of a [`TlsChannel`]. Writes are serialized onto
/// the transport through a [`WriteQueue`].
pub struct TlsWriteHalf<S> {
    session: Arc<Mutex<ClientConnection>>,
    queue: WriteQueue<WriteHalf<S>>,
    /// Reusable ciphertext buffers.
    pool: Vec<BytesMut>,
    closed: Arc<AtomicBool>,
}

impl<S> TlsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Drive the TLS handshake over `stream` and hand back the channel.
    ///
    /// Transport failures during the handshake surface as
    /// [`Error::TlsHandshake`], not as plain I/O errors. The post-handshake
    /// checks the configured [`SslMode`] asks for run before the channel is
    /// produced; on failure the transport is shut down rather than returned
    /// half-verified.
    pub async fn handshake(mut stream: S, options: &ConnectOptions) -> Result<Self> {
        let materials = TlsMaterials::load_async(options).await?;
        let setup = tls::client_config(options, &materials)?;

        let host = options.get_host().to_owned();
        let server_name = ServerName::try_from(host.clone())
            .map_err(|err| Error::tls_config(format_args!("invalid server name: {err}")))?;

        let mut session =
            ClientConnection::new(setup.config, server_name).map_err(Error::handshake)?;

        let mut cipher_buf = BytesMut::with_capacity(READ_CHUNK);

        let handshake = async {
            while session.is_handshaking() {
                send_tls(&mut session, &mut stream)
                    .await
                    .map_err(Error::handshake)?;

                if !session.is_handshaking() {
                    break;
                }

                if cipher_buf.is_empty() {
                    let received = stream
                        .read_buf(&mut cipher_buf)
                        .await
                        .map_err(Error::handshake)?;

                    if received == 0 {
                        return Err(Error::TlsHandshake(
                            io::Error::from(io::ErrorKind::UnexpectedEof).into(),
                        ));
                    }
                }

                let mut staged = &cipher_buf[..];
                let consumed = session.read_tls(&mut staged).map_err(Error::handshake)?;
                cipher_buf.advance(consumed);

                session.process_new_packets().map_err(session_error)?;
            }

            // the session may still hold the final flight
            send_tls(&mut session, &mut stream)
                .await
                .map_err(Error::handshake)
        };

        if let Err(err) = handshake.await {
            let _ = stream.shutdown().await;
            return Err(err);
        }

        if options.ssl_mode.requires_verification() {
            let checked = {
                let chain = session
                    .peer_certificates()
                    .ok_or_else(|| Error::verification("server presented no certificate"))?;

                if options.ssl_mode == SslMode::VerifyIdentity {
                    tls::check_identity(&host, chain, &setup.anchors)
                } else {
                    tls::check_expiry(chain, &setup.anchors)
                }
            };

            if let Err(err) = checked {
                let _ = stream.shutdown().await;
                return Err(err);
            }
        }

        let session = Arc::new(Mutex::new(session));
        let closed = Arc::new(AtomicBool::new(false));
        let (read_half, write_half) = split(stream);

        Ok(Self {
            read: TlsReadHalf {
                session: Arc::clone(&session),
                transport: read_half,
                cipher_buf,
                clear_buf: BytesMut::new(),
                closed: Arc::clone(&closed),
            },
            write: TlsWriteHalf {
                session,
                queue: WriteQueue::new(write_half),
                pool: Vec::new(),
                closed,
            },
        })
    }

    /// Read decrypted bytes into `dst`, returning how many were copied.
    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.read.read(dst).await
    }

    /// Read exactly `dst.len()` decrypted bytes.
    pub async fn read_exact(&mut self, dst: &mut [u8]) -> io::Result<()> {
        self.read.read_exact(dst).await
    }

    /// Encrypt and send every buffer, returning the aggregate plaintext
    /// byte count once the transport has accepted all of it.
    pub async fn write(&mut self, bufs: &[Bytes]) -> Result<usize> {
        self.write.write(bufs).await
    }

    /// Send close_notify, drain the queue, and shut the channel down.
    /// Subsequent reads and writes fail.
    pub async fn close(&mut self) -> Result<()> {
        self.write.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.write.closed.load(Ordering::SeqCst)
    }

    /// Split into independently owned halves so one read and one write can
    /// be outstanding at the same time.
    pub fn split(self) -> (TlsReadHalf<S>, TlsWriteHalf<S>) {
        (self.read, self.write)
    }
}

impl<S> TlsReadHalf<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Read decrypted bytes into `dst`, returning how many were copied.
    ///
    /// Returns `Ok(0)` once the peer has cleanly closed the session and all
    /// buffered plaintext is drained. A transport EOF that truncates a TLS
    /// record fails with `UnexpectedEof`.
    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(stream_closed());
        }

        loop {
            if !self.clear_buf.is_empty() {
                let n = self.clear_buf.len().min(dst.len());
                dst[..n].copy_from_slice(&self.clear_buf[..n]);
                self.clear_buf.advance(n);
                return Ok(n);
            }

            {
                let mut session = self.session.lock().unwrap();

                if !self.cipher_buf.is_empty() {
                    let mut staged = &self.cipher_buf[..];
                    let consumed = session.read_tls(&mut staged)?;
                    self.cipher_buf.advance(consumed);

                    let state = session
                        .process_new_packets()
                        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                    if state.plaintext_bytes_to_read() > 0 {
                        let n = session.reader().read(dst)?;
                        stash_plaintext(&mut session, &mut self.clear_buf)?;
                        return Ok(n);
                    }

                    if state.peer_has_closed() {
                        return Ok(0);
                    }

                    // an incomplete record is staged; fall through, read more
                } else if session
                    .process_new_packets()
                    .map_or(false, |state| state.peer_has_closed())
                {
                    return Ok(0);
                }
            }

            self.cipher_buf.reserve(READ_CHUNK);

            if self.transport.read_buf(&mut self.cipher_buf).await? == 0 {
                if !self.cipher_buf.is_empty() {
                    // the transport died mid-record
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }

                return Ok(0);
            }
        }
    }

    /// Read exactly `dst.len()` decrypted bytes.
    pub async fn read_exact(&mut self, dst: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;

        while filled < dst.len() {
            let n = self.read(&mut dst[filled..]).await?;

            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }

            filled += n;
        }

        Ok(())
    }
}

impl<S> TlsWriteHalf<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Encrypt and send every buffer, returning the aggregate plaintext
    /// byte count once the transport has accepted all of it.
    ///
    /// On failure the channel is closed; how many plaintext bytes were
    /// durably written is unspecified.
    pub async fn write(&mut self, bufs: &[Bytes]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::StreamClosed);
        }

        let mut total = 0;
        let mut in_flight: InFlight = Vec::new();

        if let Err(err) = self.encrypt_all(bufs, &mut total, &mut in_flight) {
            self.abort();
            return Err(err);
        }

        for (rx, cipher) in in_flight {
            let result = match rx.await {
                Ok(result) => result,
                Err(_canceled) => Err(io::ErrorKind::BrokenPipe.into()),
            };

            if let Err(err) = result {
                self.abort();
                return Err(err.into());
            }

            self.reclaim(cipher);
        }

        Ok(total)
    }

    /// Send close_notify, drain the queue, and shut the channel down.
    /// Subsequent reads and writes fail.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut in_flight: InFlight = Vec::new();

        let queued = {
            let mut session = self.session.lock().unwrap();
            session.send_close_notify();
            drain_session(&mut session, &mut self.pool, &self.queue, &mut in_flight)
        };

        if let Err(err) = queued {
            self.queue.close();
            return Err(err);
        }

        for (rx, _) in in_flight {
            if let Ok(Err(err)) = rx.await {
                self.queue.close();
                return Err(err.into());
            }
        }

        self.queue.close();

        Ok(())
    }

    /// Feed every buffer through the session and queue the resulting
    /// ciphertext. Holds the session lock; does no transport I/O.
    fn encrypt_all(
        &mut self,
        bufs: &[Bytes],
        total: &mut usize,
        in_flight: &mut InFlight,
    ) -> Result<()> {
        let mut session = self.session.lock().unwrap();

        for buf in bufs {
            let mut remaining = &buf[..];

            while !remaining.is_empty() {
                let n = session.writer().write(remaining)?;
                remaining = &remaining[n..];
                *total += n;

                drain_session(&mut session, &mut self.pool, &self.queue, in_flight)?;

                if n == 0 && !remaining.is_empty() {
                    return Err(Error::protocol("TLS session accepted no plaintext"));
                }
            }
        }

        drain_session(&mut session, &mut self.pool, &self.queue, in_flight)
    }

    /// Recover a ciphertext buffer for the pool once the queue has released
    /// its copy of the bytes.
    fn reclaim(&mut self, cipher: Bytes) {
        if self.pool.len() >= CIPHER_POOL_MAX {
            return;
        }

        if let Ok(mut buf) = cipher.try_into_mut() {
            buf.clear();
            self.pool.push(buf);
        }
    }

    fn abort(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.queue.close();
    }
}

/// An async stream that can be upgraded to TLS in place, presenting the same
/// read/write surface whether or not the upgrade happened.
pub enum MaybeTlsChannel<S> {
    Raw(S),
    Tls(TlsChannel<S>),
    Upgrading,
}

impl<S> MaybeTlsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        MaybeTlsChannel::Raw(stream)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsChannel::Tls(_))
    }

    /// Replace the plaintext stream with an encrypted channel over it.
    /// A failed upgrade leaves the stream unusable.
    pub async fn upgrade(&mut self, options: &ConnectOptions) -> Result<()> {
        match mem::replace(self, MaybeTlsChannel::Upgrading) {
            MaybeTlsChannel::Raw(stream) => {
                let channel = TlsChannel::handshake(stream, options).await?;
                *self = MaybeTlsChannel::Tls(channel);
                Ok(())
            }
            tls @ MaybeTlsChannel::Tls(_) => {
                *self = tls;
                Err(Error::protocol("stream is already encrypted"))
            }
            MaybeTlsChannel::Upgrading => Err(Error::StreamClosed),
        }
    }

    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match self {
            MaybeTlsChannel::Raw(stream) => stream.read(dst).await,
            MaybeTlsChannel::Tls(channel) => channel.read(dst).await,
            MaybeTlsChannel::Upgrading => Err(stream_closed()),
        }
    }

    pub async fn read_exact(&mut self, dst: &mut [u8]) -> io::Result<()> {
        match self {
            MaybeTlsChannel::Raw(stream) => stream.read_exact(dst).await.map(|_| ()),
            MaybeTlsChannel::Tls(channel) => channel.read_exact(dst).await,
            MaybeTlsChannel::Upgrading => Err(stream_closed()),
        }
    }

    pub async fn write(&mut self, bufs: &[Bytes]) -> Result<usize> {
        match self {
            MaybeTlsChannel::Raw(stream) => {
                let mut total = 0;

                for buf in bufs {
                    stream.write_all(buf).await?;
                    total += buf.len();
                }

                stream.flush().await?;

                Ok(total)
            }
            MaybeTlsChannel::Tls(channel) => channel.write(bufs).await,
            MaybeTlsChannel::Upgrading => Err(Error::StreamClosed),
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        match self {
            MaybeTlsChannel::Raw(stream) => {
                stream.shutdown().await?;
                Ok(())
            }
            MaybeTlsChannel::Tls(channel) => channel.close().await,
            MaybeTlsChannel::Upgrading => Ok(()),
        }
    }
}

/// Drain everything the session wants to send into pooled ciphertext buffers
/// and hand them to the write queue.
fn drain_session<W>(
    session: &mut ClientConnection,
    pool: &mut Vec<BytesMut>,
    queue: &WriteQueue<W>,
    in_flight: &mut InFlight,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while session.wants_write() {
        let mut out = pool.pop().unwrap_or_default();

        {
            let mut writer = (&mut out).writer();
            session.write_tls(&mut writer).map_err(Error::Io)?;
        }

        if out.is_empty() {
            break;
        }

        let cipher = out.freeze();
        let rx = queue.enqueue(cipher.clone());
        in_flight.push((rx, cipher));
    }

    Ok(())
}

/// Move any plaintext still buffered in the session aside so the next read
/// serves it without touching the transport.
fn stash_plaintext(session: &mut ClientConnection, clear_buf: &mut BytesMut) -> io::Result<()> {
    let mut tmp = [0u8; 4096];

    loop {
        match session.reader().read(&mut tmp) {
            Ok(0) => return Ok(()),
            Ok(n) => clear_buf.extend_from_slice(&tmp[..n]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

fn stream_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream is closed")
}

fn session_error(err: rustls::Error) -> Error {
    if matches!(err, rustls::Error::InvalidCertificate(_)) {
        return Error::verification(&err);
    }

    Error::TlsHandshake(Box::new(err))
}

/// Write everything the session has queued to the transport.
async fn send_tls<S>(session: &mut ClientConnection, stream: &mut S) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    while session.wants_write() {
        let mut out = Vec::with_capacity(READ_CHUNK);
        session.write_tls(&mut out)?;

        if out.is_empty() {
            break;
        }

        stream.write_all(&out).await?;
    }

    Ok(())
}
