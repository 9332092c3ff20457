use std::str::FromStr;

use crate::error::Error;

/// Options for controlling the desired security state of a connection.
///
/// It is used by the [`ssl_mode`](super::ConnectOptions::ssl_mode) method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    /// Establish an unencrypted connection.
    Disabled,

    /// Establish an encrypted connection if the server supports encrypted
    /// connections, falling back to an unencrypted connection otherwise.
    ///
    /// This is the default if `ssl_mode` is not specified.
    Preferred,

    /// Establish an encrypted connection if the server supports encrypted
    /// connections. The connection attempt fails if an encrypted connection
    /// cannot be established.
    Required,

    /// Like `Required`, but additionally validate the server certificate
    /// chain against the configured trust anchors. No hostname check is
    /// performed.
    VerifyCa,

    /// Like `VerifyCa`, but additionally verify that the server certificate
    /// identifies the host the client connected to.
    VerifyIdentity,
}

impl Default for SslMode {
    fn default() -> Self {
        SslMode::Preferred
    }
}

impl SslMode {
    /// Whether this mode requires chain verification (CA or identity).
    pub fn requires_verification(self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyIdentity)
    }
}

impl FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(match &*s.to_ascii_uppercase() {
            "DISABLED" => SslMode::Disabled,
            "PREFERRED" => SslMode::Preferred,
            "REQUIRED" => SslMode::Required,
            "VERIFY_CA" => SslMode::VerifyCa,
            "VERIFY_IDENTITY" => SslMode::VerifyIdentity,

            _ => {
                return Err(Error::Configuration(
                    format!("unknown value {s:?} for `ssl-mode`").into(),
                ));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_modes() {
        assert_eq!("DISABLED".parse::<SslMode>().unwrap(), SslMode::Disabled);
        assert_eq!("preferred".parse::<SslMode>().unwrap(), SslMode::Preferred);
        assert_eq!("verify_ca".parse::<SslMode>().unwrap(), SslMode::VerifyCa);
        assert_eq!(
            "VERIFY_IDENTITY".parse::<SslMode>().unwrap(),
            SslMode::VerifyIdentity
        );
        assert!("fully".parse::<SslMode>().is_err());
    }
}
