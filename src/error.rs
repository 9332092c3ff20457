use std::error::Error as StdError;
use std::fmt::Display;
use std::io;
use std::result::Result as StdResult;

/// A specialized `Result` type for wireline.
pub type Result<T> = StdResult<T, Error>;

// Convenience type alias for usage within wireline.
pub(crate) type BoxDynError = Box<dyn StdError + 'static + Send + Sync>;

/// Represents all the ways establishing a transport can fail.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Error occurred while parsing a connection string or building options.
    #[error("error occurred while parsing connection configuration: {0}")]
    Configuration(#[source] BoxDynError),

    /// The shared connect budget was exhausted before the operation completed.
    ///
    /// This bounds the *cumulative* wall time across DNS resolution, every
    /// connect attempt, and the TLS handshake of one logical connect.
    #[error("connect attempt exceeded the configured timeout")]
    ConnectTimeout,

    /// Every resolved candidate address was attempted and all failed.
    ///
    /// Carries the error from the last candidate tried.
    #[error("unable to connect to any resolved address: {source}")]
    ConnectRefused {
        #[source]
        source: io::Error,
    },

    /// Error communicating with the server.
    #[error("error communicating with the server: {0}")]
    Io(#[from] io::Error),

    /// Invalid TLS settings detected before any I/O was attempted.
    #[error("invalid TLS configuration: {0}")]
    TlsConfig(#[source] BoxDynError),

    /// I/O or negotiation failure during the TLS handshake.
    #[error("error during TLS handshake: {0}")]
    TlsHandshake(#[source] BoxDynError),

    /// Certificate chain, expiry, or hostname verification failure.
    #[error("server certificate verification failed: {reason}")]
    CertificateVerification { reason: String },

    /// The stream was used after it was closed or after a failed upgrade.
    #[error("stream is closed")]
    StreamClosed,

    /// The named pipe is busy and no connect timeout is configured, so
    /// waiting for it would block forever.
    #[error("named pipe is busy and no connect timeout is configured")]
    PipeBusy,

    /// Unexpected or invalid data on the wire (e.g. a malformed SOCKS reply).
    #[error("encountered unexpected or invalid data: {0}")]
    Protocol(String),
}

impl Error {
    #[inline]
    pub(crate) fn protocol(err: impl Display) -> Self {
        Error::Protocol(err.to_string())
    }

    #[inline]
    pub(crate) fn config(err: impl StdError + Send + Sync + 'static) -> Self {
        Error::Configuration(err.into())
    }

    #[inline]
    pub(crate) fn tls_config(err: impl Display) -> Self {
        Error::TlsConfig(err.to_string().into())
    }

    #[inline]
    pub(crate) fn handshake(err: impl StdError + Send + Sync + 'static) -> Self {
        Error::TlsHandshake(err.into())
    }

    #[inline]
    pub(crate) fn verification(reason: impl Display) -> Self {
        Error::CertificateVerification {
            reason: reason.to_string(),
        }
    }
}
