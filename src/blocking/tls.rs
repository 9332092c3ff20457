use std::io::{self, Read, Write};
use std::mem;

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};

use crate::budget::ConnectBudget;
use crate::error::{Error, Result};
use crate::options::{ConnectOptions, SslMode};
use crate::tls::{self, TlsMaterials};

use super::Available;

/// A blocking stream which may be encrypted, upgraded in place once the
/// protocol layer has negotiated TLS with the server.
pub enum MaybeTlsStream<S>
where
    S: Read + Write,
{
    Raw(S),
    Tls(Box<StreamOwned<ClientConnection, S>>),
    Upgrading,
}

impl<S> MaybeTlsStream<S>
where
    S: Read + Write,
{
    pub fn new(stream: S) -> Self {
        MaybeTlsStream::Raw(stream)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::Tls(_))
    }

    /// Upgrade the stream to TLS, driving the handshake to completion and
    /// applying the post-handshake checks the configured [`SslMode`] asks for.
    ///
    /// On failure the stream is left in the `Upgrading` state and every later
    /// read or write fails; a half-verified connection is never handed back.
    pub fn upgrade(&mut self, options: &ConnectOptions, budget: &mut ConnectBudget) -> Result<()> {
        let stream = match mem::replace(self, MaybeTlsStream::Upgrading) {
            MaybeTlsStream::Raw(stream) => stream,

            MaybeTlsStream::Tls(stream) => {
                *self = MaybeTlsStream::Tls(stream);
                return Err(Error::protocol("stream is already encrypted"));
            }

            MaybeTlsStream::Upgrading => return Err(Error::StreamClosed),
        };

        let materials = TlsMaterials::load(options)?;
        let setup = tls::client_config(options, &materials)?;

        let host = options.get_host().to_owned();
        let server_name = ServerName::try_from(host.clone())
            .map_err(|err| Error::tls_config(format_args!("invalid server name: {err}")))?;

        let mut conn =
            ClientConnection::new(setup.config, server_name).map_err(Error::handshake)?;

        let mut stream = stream;
        while conn.is_handshaking() {
            budget.check()?;
            conn.complete_io(&mut stream).map_err(handshake_error)?;
        }

        if options.get_ssl_mode().requires_verification() {
            let chain = conn
                .peer_certificates()
                .ok_or_else(|| Error::verification("server presented no certificate"))?;

            if options.get_ssl_mode() == SslMode::VerifyIdentity {
                tls::check_identity(&host, chain, &setup.anchors)?;
            } else {
                tls::check_expiry(chain, &setup.anchors)?;
            }
        }

        *self = MaybeTlsStream::Tls(Box::new(StreamOwned::new(conn, stream)));

        Ok(())
    }
}

/// Map an I/O error surfaced by the handshake back to the TLS failure it
/// wraps, so certificate rejections are reported as such.
fn handshake_error(err: io::Error) -> Error {
    if let Some(tls) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        if matches!(tls, rustls::Error::InvalidCertificate(_)) {
            return Error::verification(tls);
        }

        return Error::TlsHandshake(Box::new(tls.clone()));
    }

    Error::TlsHandshake(Box::new(err))
}

impl<S> Read for MaybeTlsStream<S>
where
    S: Read + Write,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            MaybeTlsStream::Raw(stream) => stream.read(buf),
            MaybeTlsStream::Tls(stream) => stream.read(buf),
            MaybeTlsStream::Upgrading => Err(io::ErrorKind::ConnectionAborted.into()),
        }
    }
}

impl<S> Write for MaybeTlsStream<S>
where
    S: Read + Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            MaybeTlsStream::Raw(stream) => stream.write(buf),
            MaybeTlsStream::Tls(stream) => stream.write(buf),
            MaybeTlsStream::Upgrading => Err(io::ErrorKind::ConnectionAborted.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            MaybeTlsStream::Raw(stream) => stream.flush(),
            MaybeTlsStream::Tls(stream) => stream.flush(),
            MaybeTlsStream::Upgrading => Err(io::ErrorKind::ConnectionAborted.into()),
        }
    }
}

impl<S> Available for MaybeTlsStream<S>
where
    S: Read + Write + Available,
{
    fn available(&self) -> io::Result<usize> {
        match self {
            MaybeTlsStream::Raw(stream) => stream.available(),
            MaybeTlsStream::Tls(stream) => stream.get_ref().available(),
            MaybeTlsStream::Upgrading => Err(io::ErrorKind::ConnectionAborted.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::thread;

    use rustls::pki_types::PrivateKeyDer;

    fn spawn_tls_echo_server(names: Vec<String>) -> (std::net::SocketAddr, String) {
        let key = rcgen::generate_simple_self_signed(names).unwrap();
        let ca_pem = key.cert.pem();

        let cert_der = key.cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(key.key_pair.serialize_der().into());

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .unwrap();
        let config = Arc::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let conn = rustls::ServerConnection::new(config).unwrap();
            let mut stream = StreamOwned::new(conn, stream);

            // echo a single line; errors just end the session
            let mut buf = [0u8; 64];
            if let Ok(n) = stream.read(&mut buf) {
                let _ = stream.write_all(&buf[..n]);
            }
        });

        (addr, ca_pem)
    }

    #[test]
    fn upgrades_and_round_trips() {
        let (addr, ca_pem) = spawn_tls_echo_server(vec!["localhost".to_owned()]);

        let options = ConnectOptions::new()
            .host("localhost")
            .ssl_mode(SslMode::VerifyIdentity)
            .ssl_ca(&ca_pem);

        let stream = TcpStream::connect(addr).unwrap();
        let mut stream = MaybeTlsStream::new(stream);
        let mut budget = ConnectBudget::unlimited();

        stream.upgrade(&options, &mut budget).unwrap();
        assert!(stream.is_tls());

        stream.write_all(b"ping").unwrap();
        stream.flush().unwrap();

        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ping");
    }

    #[test]
    fn hostname_mismatch_leaves_the_stream_unusable() {
        let (addr, ca_pem) = spawn_tls_echo_server(vec!["otherhost".to_owned()]);

        let options = ConnectOptions::new()
            .host("localhost")
            .ssl_mode(SslMode::VerifyIdentity)
            .ssl_ca(&ca_pem);

        let stream = TcpStream::connect(addr).unwrap();
        let mut stream = MaybeTlsStream::new(stream);
        let mut budget = ConnectBudget::unlimited();

        let err = stream.upgrade(&options, &mut budget).unwrap_err();
        assert!(matches!(err, Error::CertificateVerification { .. }));

        assert!(stream.write_all(b"ping").is_err());
    }

    #[test]
    fn verify_ca_ignores_the_hostname() {
        let (addr, ca_pem) = spawn_tls_echo_server(vec!["otherhost".to_owned()]);

        let options = ConnectOptions::new()
            .host("localhost")
            .ssl_mode(SslMode::VerifyCa)
            .ssl_ca(&ca_pem);

        let stream = TcpStream::connect(addr).unwrap();
        let mut stream = MaybeTlsStream::new(stream);
        let mut budget = ConnectBudget::unlimited();

        stream.upgrade(&options, &mut budget).unwrap();
        assert!(stream.is_tls());
    }
}
