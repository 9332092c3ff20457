//! Client-side transport layer for a database wire protocol: connection
//! establishment over TCP, SOCKS5, and local named pipes, in-place TLS
//! upgrade for blocking streams, a fully async encrypted channel, and the
//! buffering disciplines both paths share.
//!
//! The blocking surface lives in [`blocking`]; the async surface in [`net`]
//! and [`TlsChannel`]. Both are configured through [`ConnectOptions`], which
//! parses from a URL, and bounded by one cumulative connect timeout.

pub mod blocking;
pub mod error;
pub mod net;
pub mod options;
pub mod tls;

mod budget;

#[doc(inline)]
pub use self::{
    budget::ConnectBudget,
    error::{Error, Result},
    options::{ConnectOptions, SslMode},
    tls::{CertificateInput, MaybeTlsChannel, TlsChannel},
};
