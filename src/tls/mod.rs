use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ClientConfig;

use crate::error::{Error, Result};
use crate::options::ConnectOptions;

mod channel;
mod policy;
mod verify;

pub use channel::{MaybeTlsChannel, TlsChannel, TlsReadHalf, TlsWriteHalf};
pub use verify::matches_dns_name;

pub(crate) use verify::{check_expiry, check_identity};

/// X.509 certificate input, either a file path or PEM encoded inline
/// certificate(s).
#[derive(Clone, Debug)]
pub enum CertificateInput {
    /// PEM encoded certificate(s)
    Inline(Vec<u8>),
    /// Path to a file containing PEM encoded certificate(s)
    File(PathBuf),
}

impl From<String> for CertificateInput {
    fn from(value: String) -> Self {
        let trimmed = value.trim();
        // Some heuristics according to https://tools.ietf.org/html/rfc7468
        if trimmed.starts_with("-----BEGIN") && trimmed.contains("-----END") {
            CertificateInput::Inline(value.into_bytes())
        } else {
            CertificateInput::File(PathBuf::from(value))
        }
    }
}

impl CertificateInput {
    fn data(&self) -> std::io::Result<Vec<u8>> {
        match self {
            CertificateInput::Inline(pem) => Ok(pem.clone()),
            CertificateInput::File(path) => std::fs::read(path),
        }
    }

    async fn data_async(&self) -> std::io::Result<Vec<u8>> {
        match self {
            CertificateInput::Inline(pem) => Ok(pem.clone()),
            CertificateInput::File(path) => tokio::fs::read(path).await,
        }
    }
}

impl std::fmt::Display for CertificateInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertificateInput::Inline(pem) => write!(f, "{}", String::from_utf8_lossy(pem)),
            CertificateInput::File(path) => write!(f, "file: {}", path.display()),
        }
    }
}

/// The raw PEM bytes of every configured store, read up front so config
/// assembly itself does no I/O.
pub(crate) struct TlsMaterials {
    pub(crate) ca: Option<Vec<u8>>,
    pub(crate) client_cert: Option<Vec<u8>>,
    pub(crate) client_key: Option<Vec<u8>>,
}

impl TlsMaterials {
    pub(crate) fn load(options: &ConnectOptions) -> Result<Self> {
        Ok(Self {
            ca: options.ssl_ca.as_ref().map(|ca| ca.data()).transpose()?,
            client_cert: options
                .ssl_client_cert
                .as_ref()
                .map(|cert| cert.data())
                .transpose()?,
            client_key: options
                .ssl_client_key
                .as_ref()
                .map(|key| key.data())
                .transpose()?,
        })
    }

    pub(crate) async fn load_async(options: &ConnectOptions) -> Result<Self> {
        Ok(Self {
            ca: match &options.ssl_ca {
                Some(ca) => Some(ca.data_async().await?),
                None => None,
            },
            client_cert: match &options.ssl_client_cert {
                Some(cert) => Some(cert.data_async().await?),
                None => None,
            },
            client_key: match &options.ssl_client_key {
                Some(key) => Some(key.data_async().await?),
                None => None,
            },
        })
    }
}

/// A fully assembled client TLS configuration plus the anchors retained for
/// the post-handshake expiry re-check.
pub(crate) struct TlsSetup {
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) anchors: Vec<CertificateDer<'static>>,
}

/// Build the rustls client configuration for the requested SSL mode.
///
/// All policy violations surface here, before any I/O: an empty
/// protocol/cipher intersection, a missing trust store when verification was
/// requested, or a client cert without its key.
pub(crate) fn client_config(options: &ConnectOptions, materials: &TlsMaterials) -> Result<TlsSetup> {
    let provider = policy::crypto_provider(options)?;
    let versions = policy::protocol_versions(options.tls_versions.as_deref())?;

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&versions)
        .map_err(|err| Error::TlsConfig(err.to_string().into()))?;

    // client authentication key and certificate must be given together
    let client_auth = match (&materials.client_cert, &materials.client_key) {
        (Some(cert), Some(key)) => Some((certs_from_pem(cert)?, private_key_from_pem(key)?)),
        (None, None) => None,
        (_, _) => {
            return Err(Error::TlsConfig(
                "client auth key and certificate must be given together".into(),
            ));
        }
    };

    if options.ssl_mode.requires_verification() {
        let (roots, anchors) = verify::root_store(options, materials)?;

        if roots.is_empty() {
            return Err(Error::TlsConfig(
                "certificate verification requested but no usable trust anchors are available"
                    .into(),
            ));
        }

        let verifier = verify::CaOnlyVerifier::new(roots, provider)?;
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier));

        return finish_config(builder, client_auth, anchors);
    }

    let builder = builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verify::DummyTlsVerifier::new(provider)));

    finish_config(builder, client_auth, Vec::new())
}

type ClientAuth = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn finish_config(
    builder: rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert>,
    client_auth: Option<ClientAuth>,
    anchors: Vec<CertificateDer<'static>>,
) -> Result<TlsSetup> {
    let config = match client_auth {
        Some((chain, key)) => builder
            .with_client_auth_cert(chain, key)
            .map_err(|err| Error::TlsConfig(err.to_string().into()))?,
        None => builder.with_no_client_auth(),
    };

    Ok(TlsSetup {
        config: Arc::new(config),
        anchors,
    })
}

fn certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<_, _>>()
        .map_err(|err| Error::TlsConfig(format!("invalid certificate input: {err}").into()))?;

    if certs.is_empty() {
        return Err(Error::TlsConfig(
            "no certificates found in PEM input".into(),
        ));
    }

    Ok(certs)
}

fn private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    match rustls_pemfile::private_key(&mut &pem[..]) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(Error::TlsConfig("no keys found in PEM input".into())),
        Err(err) => Err(Error::TlsConfig(
            format!("invalid private key input: {err}").into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::options::SslMode;

    #[test]
    fn inline_pem_is_recognized() {
        let input = CertificateInput::from(
            "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n".to_owned(),
        );
        assert!(matches!(input, CertificateInput::Inline(_)));

        let input = CertificateInput::from("/etc/ssl/ca.pem".to_owned());
        assert!(matches!(input, CertificateInput::File(_)));
    }

    #[test]
    fn cert_without_key_is_rejected_before_io() {
        let options = ConnectOptions::new()
            .ssl_mode(SslMode::Required)
            .ssl_client_cert("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----");
        let materials = TlsMaterials::load(&options).unwrap();

        let Err(err) = client_config(&options, &materials) else {
            panic!("expected a configuration error");
        };
        assert!(matches!(err, Error::TlsConfig(_)));
    }

    #[test]
    fn empty_ca_input_is_rejected_before_io() {
        let options = ConnectOptions::new()
            .ssl_mode(SslMode::VerifyCa)
            .ssl_ca("-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----");
        let materials = TlsMaterials {
            ca: Some(Vec::new()),
            client_cert: None,
            client_key: None,
        };

        let Err(err) = client_config(&options, &materials) else {
            panic!("expected a configuration error");
        };
        assert!(matches!(err, Error::TlsConfig(_)));
    }
}
