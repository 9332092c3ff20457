use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tls::CertificateInput;

mod parse;
mod ssl_mode;

pub use ssl_mode::SslMode;

/// Options and flags which configure how a transport is established.
///
/// A value of `ConnectOptions` can be parsed from a connection URL:
///
/// ```text
/// db://host[:port][?properties]
/// ```
///
/// ## Properties
///
/// |Parameter|Default|Description|
/// |---------|-------|-----------|
/// | `connect-timeout` | `None` | Total time budget for the connect, in milliseconds. |
/// | `ssl-mode` | `PREFERRED` | Whether and how to negotiate TLS. See [`SslMode`]. |
/// | `ssl-ca` | `None` | File containing trusted PEM certificate authorities. |
/// | `socket` | `None` | Path to a local pipe (Unix domain socket), used instead of TCP if set. |
/// | `socks-host` | `None` | SOCKS5 proxy to route the connection through. |
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) socket: Option<PathBuf>,
    pub(crate) connect_timeout: Option<Duration>,

    pub(crate) socks_host: Option<String>,
    pub(crate) socks_port: u16,
    pub(crate) socks_remote_dns: bool,

    pub(crate) local_address: Option<IpAddr>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive: Option<Duration>,
    pub(crate) send_buffer_size: Option<usize>,
    pub(crate) recv_buffer_size: Option<usize>,
    pub(crate) traffic_class: Option<u32>,

    pub(crate) ssl_mode: SslMode,
    pub(crate) ssl_ca: Option<CertificateInput>,
    pub(crate) ssl_client_cert: Option<CertificateInput>,
    pub(crate) ssl_client_key: Option<CertificateInput>,
    pub(crate) tls_versions: Option<Vec<String>>,
    pub(crate) tls_ciphers: Option<Vec<String>>,
    pub(crate) fips: bool,
    pub(crate) prefer_system_roots: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectOptions {
    /// Creates a new, default set of options ready for configuration.
    pub fn new() -> Self {
        Self {
            host: String::from("localhost"),
            port: 3306,
            socket: None,
            connect_timeout: None,
            socks_host: None,
            socks_port: 1080,
            socks_remote_dns: false,
            local_address: None,
            tcp_nodelay: true,
            tcp_keepalive: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            traffic_class: None,
            ssl_mode: SslMode::Preferred,
            ssl_ca: None,
            ssl_client_cert: None,
            ssl_client_key: None,
            tls_versions: None,
            tls_ciphers: None,
            fips: false,
            prefer_system_roots: false,
        }
    }

    /// Set the server hostname. Defaults to `localhost`.
    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_owned();
        self
    }

    /// Set the server port. Defaults to `3306`.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Pass a path to a local pipe (Unix domain socket), connected to instead
    /// of TCP when set.
    pub fn socket(mut self, path: impl AsRef<Path>) -> Self {
        self.socket = Some(path.as_ref().to_path_buf());
        self
    }

    /// Total time budget for one connect, covering DNS resolution, every
    /// candidate connect attempt, and the TLS handshake. `None` (the
    /// default) means no limit.
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Route the connection through a SOCKS5 proxy.
    pub fn socks_proxy(mut self, host: &str, port: u16) -> Self {
        self.socks_host = Some(host.to_owned());
        self.socks_port = port;
        self
    }

    /// When routing through SOCKS5, pass the hostname to the proxy instead
    /// of resolving it locally.
    pub fn socks_remote_dns(mut self, on: bool) -> Self {
        self.socks_remote_dns = on;
        self
    }

    /// Bind the local end of the connection to a specific address.
    pub fn local_address(mut self, addr: IpAddr) -> Self {
        self.local_address = Some(addr);
        self
    }

    /// Sets `TCP_NODELAY` on the connection. Defaults to `true`.
    pub fn tcp_nodelay(mut self, on: bool) -> Self {
        self.tcp_nodelay = on;
        self
    }

    /// Enable TCP keepalive probing with the given idle time.
    pub fn tcp_keepalive(mut self, idle: Option<Duration>) -> Self {
        self.tcp_keepalive = idle;
        self
    }

    /// Size of the kernel send buffer (`SO_SNDBUF`).
    pub fn send_buffer_size(mut self, size: Option<usize>) -> Self {
        self.send_buffer_size = size;
        self
    }

    /// Size of the kernel receive buffer (`SO_RCVBUF`).
    pub fn recv_buffer_size(mut self, size: Option<usize>) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// IP traffic class / type-of-service octet.
    pub fn traffic_class(mut self, tos: Option<u32>) -> Self {
        self.traffic_class = tos;
        self
    }

    /// Set whether and with what priority a TLS connection will be
    /// negotiated. Defaults to [`SslMode::Preferred`].
    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    /// Sets the name of a file containing trusted PEM certificate
    /// authorities, or an inline PEM bundle.
    pub fn ssl_ca(mut self, ca: &str) -> Self {
        self.ssl_ca = Some(CertificateInput::from(ca.to_owned()));
        self
    }

    /// Sets the client certificate presented to the server, as a PEM file
    /// path or inline PEM. Must be given together with [`ssl_client_key`].
    ///
    /// [`ssl_client_key`]: ConnectOptions::ssl_client_key
    pub fn ssl_client_cert(mut self, cert: &str) -> Self {
        self.ssl_client_cert = Some(CertificateInput::from(cert.to_owned()));
        self
    }

    /// Sets the private key for the client certificate.
    pub fn ssl_client_key(mut self, key: &str) -> Self {
        self.ssl_client_key = Some(CertificateInput::from(key.to_owned()));
        self
    }

    /// Explicit allow-list of TLS protocol versions (e.g. `TLSv1.3`).
    ///
    /// The list is intersected with the approved versions; an intersection
    /// that comes up empty is rejected before any I/O.
    pub fn tls_versions(mut self, versions: Option<Vec<String>>) -> Self {
        self.tls_versions = versions;
        self
    }

    /// Explicit allow-list of cipher suites by IANA-style name.
    ///
    /// Must intersect the approved tier; otherwise the configuration is
    /// rejected before any I/O.
    pub fn tls_ciphers(mut self, ciphers: Option<Vec<String>>) -> Self {
        self.tls_ciphers = ciphers;
        self
    }

    /// Restrict cipher negotiation to the FIPS-approved subset.
    pub fn fips(mut self, on: bool) -> Self {
        self.fips = on;
        self
    }

    /// When no explicit CA is configured, trust the platform certificate
    /// store instead of the built-in webpki roots.
    pub fn prefer_system_roots(mut self, on: bool) -> Self {
        self.prefer_system_roots = on;
        self
    }

    /// Get the server hostname.
    pub fn get_host(&self) -> &str {
        &self.host
    }

    /// Get the server port.
    pub fn get_port(&self) -> u16 {
        self.port
    }

    /// Get the configured SSL mode.
    pub fn get_ssl_mode(&self) -> SslMode {
        self.ssl_mode
    }

    /// Get the pipe path, if one is configured.
    pub fn get_socket(&self) -> Option<&PathBuf> {
        self.socket.as_ref()
    }
}
