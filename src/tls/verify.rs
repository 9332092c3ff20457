use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error as TlsError, RootCertStore};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::error::{Error, Result};
use crate::options::ConnectOptions;
use crate::tls::TlsMaterials;

/// Assemble the trust-anchor store for chain validation.
///
/// An explicit CA input wins; otherwise the platform store is used when
/// `prefer_system_roots` is set, falling back to the bundled webpki roots.
/// Returns the store plus the DER anchors we can re-check expiry on later
/// (the bundled webpki anchors carry no validity window).
pub(crate) fn root_store(
    options: &ConnectOptions,
    materials: &TlsMaterials,
) -> Result<(RootCertStore, Vec<CertificateDer<'static>>)> {
    if let Some(pem) = &materials.ca {
        let mut store = RootCertStore::empty();
        let mut anchors = Vec::new();

        for result in rustls_pemfile::certs(&mut &pem[..]) {
            let cert = result.map_err(|err| {
                Error::TlsConfig(format!("invalid certificate in CA input: {err}").into())
            })?;

            store
                .add(cert.clone())
                .map_err(|err| Error::TlsConfig(err.to_string().into()))?;
            anchors.push(cert);
        }

        if anchors.is_empty() {
            return Err(Error::TlsConfig(
                "CA input contained no PEM certificates".into(),
            ));
        }

        return Ok((store, anchors));
    }

    if options.prefer_system_roots {
        let mut store = RootCertStore::empty();
        let mut anchors = Vec::new();

        let loaded = rustls_native_certs::load_native_certs();
        for err in loaded.errors {
            log::warn!("error loading native certificates: {err:?}");
        }
        for cert in loaded.certs {
            match store.add(cert.clone()) {
                Ok(()) => anchors.push(cert),
                Err(err) => log::warn!("failed to parse native certificate: {err:?}"),
            }
        }

        return Ok((store, anchors));
    }

    let store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Ok((store, Vec::new()))
}

/// Performs no certificate verification at all; used for the SSL modes that
/// request encryption without trust.
#[derive(Debug)]
pub(crate) struct DummyTlsVerifier {
    provider: Arc<CryptoProvider>,
}

impl DummyTlsVerifier {
    pub(crate) fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for DummyTlsVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Validates the certificate chain against the trust anchors but tolerates a
/// hostname mismatch.
///
/// Both `VERIFY_CA` and `VERIFY_IDENTITY` handshakes use this verifier;
/// identity is checked separately after the handshake so the hostname rules
/// (wildcards, IP equality, CN fallback) are ours rather than webpki's.
#[derive(Debug)]
pub(crate) struct CaOnlyVerifier {
    verifier: Arc<WebPkiServerVerifier>,
}

impl CaOnlyVerifier {
    pub(crate) fn new(roots: RootCertStore, provider: Arc<CryptoProvider>) -> Result<Self> {
        let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|err| Error::TlsConfig(err.to_string().into()))?;

        Ok(Self { verifier })
    }
}

impl ServerCertVerifier for CaOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        match self.verifier.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(TlsError::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            Err(TlsError::InvalidCertificate(CertificateError::NotValidForNameContext {
                ..
            })) => Ok(ServerCertVerified::assertion()),
            res => res,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        self.verifier.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        self.verifier.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.verifier.supported_verify_schemes()
    }
}

/// Match a DNS name from a certificate against the connected hostname.
///
/// A wildcard is allowed only in the left-most label and never spans
/// multiple labels: `*.example.com` matches `foo.example.com` but neither
/// `foo.bar.example.com` nor `example.com`.
pub fn matches_dns_name(pattern: &str, name: &str) -> bool {
    let pattern = pattern.strip_suffix('.').unwrap_or(pattern);
    let name = name.strip_suffix('.').unwrap_or(name);

    if pattern.is_empty() || name.is_empty() {
        return false;
    }

    let pattern_labels: Vec<&str> = pattern.split('.').collect();
    let name_labels: Vec<&str> = name.split('.').collect();

    if pattern_labels.len() != name_labels.len() {
        return false;
    }

    for (i, (pl, nl)) in pattern_labels.iter().zip(&name_labels).enumerate() {
        if i == 0 && pl.contains('*') {
            // a bare "*" (no further labels) is never a valid pattern
            if pattern_labels.len() < 2 || pl.matches('*').count() != 1 {
                return false;
            }

            let (prefix, suffix) = pl.split_once('*').unwrap_or(("", ""));

            if nl.len() < prefix.len() + suffix.len()
                || !nl[..prefix.len()].eq_ignore_ascii_case(prefix)
                || !nl[nl.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
            {
                return false;
            }
        } else if pl.contains('*') || !pl.eq_ignore_ascii_case(nl) {
            return false;
        }
    }

    true
}

fn format_ip(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

fn parse_cert<'a>(der: &'a [u8]) -> Result<X509Certificate<'a>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|err| Error::verification(format!("unparseable certificate: {err}")))?;
    Ok(cert)
}

/// Verify that the leaf certificate identifies `host`.
///
/// subjectAltName entries are preferred: dNSName with the wildcard rule, and
/// iPAddress by exact case-insensitive equality. If a SAN extension is
/// present and nothing matches, verification fails without falling back to
/// the common name. Only a certificate with no SAN at all falls back to the
/// subject common name, under the same wildcard rule.
pub(crate) fn verify_hostname(host: &str, leaf_der: &[u8]) -> Result<()> {
    // IPv6 hosts from URLs keep their brackets
    let host = host.trim_matches(|c| c == '[' || c == ']');
    let leaf = parse_cert(leaf_der)?;

    match leaf.subject_alternative_name() {
        Ok(Some(san)) => {
            let mut seen = Vec::new();

            for general_name in &san.value.general_names {
                match general_name {
                    GeneralName::DNSName(dns) => {
                        if matches_dns_name(dns, host) {
                            return Ok(());
                        }
                        seen.push((*dns).to_owned());
                    }
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = format_ip(bytes) {
                            if ip.eq_ignore_ascii_case(host) {
                                return Ok(());
                            }
                            seen.push(ip);
                        }
                    }
                    _ => {}
                }
            }

            Err(Error::verification(format!(
                "host {host:?} does not match any subjectAltName entry [{}]",
                seen.join(", ")
            )))
        }

        Ok(None) => {
            let common_name = leaf
                .subject()
                .iter_common_name()
                .next()
                .and_then(|attr| attr.as_str().ok());

            match common_name {
                Some(cn) if matches_dns_name(cn, host) => Ok(()),
                Some(cn) => Err(Error::verification(format!(
                    "host {host:?} does not match certificate common name {cn:?}"
                ))),
                None => Err(Error::verification(
                    "certificate carries neither a subjectAltName nor a common name",
                )),
            }
        }

        Err(err) => Err(Error::verification(format!(
            "malformed subjectAltName extension: {err}"
        ))),
    }
}

/// Explicitly re-check the validity window of the presented chain, plus any
/// configured trust anchor whose subject matches the chain's top issuer.
///
/// Path validation already rejects an expired leaf; this guards against
/// validators that skip the anchor's own expiry.
pub(crate) fn check_expiry(
    chain: &[CertificateDer<'_>],
    anchors: &[CertificateDer<'static>],
) -> Result<()> {
    let mut top_issuer: Option<Vec<u8>> = None;

    for (i, der) in chain.iter().enumerate() {
        let cert = parse_cert(der.as_ref())?;

        if !cert.validity().is_valid() {
            let which = if i == 0 { "leaf" } else { "intermediate" };
            return Err(Error::verification(format!(
                "{which} certificate is outside its validity window (notAfter {})",
                cert.validity().not_after
            )));
        }

        top_issuer = Some(cert.issuer().as_raw().to_vec());
    }

    if let Some(issuer) = top_issuer {
        for der in anchors {
            let Ok(anchor) = parse_cert(der.as_ref()) else {
                continue;
            };

            if anchor.subject().as_raw() == issuer.as_slice() && !anchor.validity().is_valid() {
                return Err(Error::verification(format!(
                    "trust anchor for the chain is outside its validity window (notAfter {})",
                    anchor.validity().not_after
                )));
            }
        }
    }

    Ok(())
}

/// Post-handshake identity check for `VERIFY_IDENTITY`.
pub(crate) fn check_identity(
    host: &str,
    chain: &[CertificateDer<'_>],
    anchors: &[CertificateDer<'static>],
) -> Result<()> {
    let leaf = chain
        .first()
        .ok_or_else(|| Error::verification("server presented no certificate"))?;

    check_expiry(chain, anchors)?;
    verify_hostname(host, leaf.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_exactly_one_label() {
        assert!(matches_dns_name("*.example.com", "foo.example.com"));
        assert!(!matches_dns_name("*.example.com", "foo.bar.example.com"));
        assert!(!matches_dns_name("*.example.com", "example.com"));
    }

    #[test]
    fn wildcard_never_spans_labels_or_leaves_the_leftmost() {
        assert!(!matches_dns_name("foo.*.example.com", "foo.bar.example.com"));
        assert!(!matches_dns_name("*", "example"));
        assert!(matches_dns_name("f*.example.com", "foo.example.com"));
        assert!(!matches_dns_name("f*.example.com", "bar.example.com"));
    }

    #[test]
    fn plain_names_compare_case_insensitively() {
        assert!(matches_dns_name("Db.Example.COM", "db.example.com"));
        assert!(!matches_dns_name("db.example.com", "db.example.org"));
    }

    #[test]
    fn trailing_dots_are_ignored() {
        assert!(matches_dns_name("*.example.com.", "foo.example.com"));
        assert!(matches_dns_name("db.example.com", "db.example.com."));
    }

    fn expired_window() -> (time::OffsetDateTime, time::OffsetDateTime) {
        let now = time::OffsetDateTime::now_utc();
        (now - time::Duration::days(30), now - time::Duration::days(1))
    }

    #[test]
    fn expired_leaf_is_rejected() {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_owned()]).unwrap();
        (params.not_before, params.not_after) = expired_window();

        let cert = params.self_signed(&key).unwrap();
        let err = check_expiry(&[cert.der().clone()], &[]).unwrap_err();

        assert!(matches!(err, Error::CertificateVerification { .. }));
    }

    #[test]
    fn expired_anchor_for_the_chain_is_rejected() {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "transport test root");
        (ca_params.not_before, ca_params.not_after) = expired_window();
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf_params = rcgen::CertificateParams::new(vec!["localhost".to_owned()]).unwrap();
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

        // the leaf itself is valid; only the matching anchor has expired
        let err = check_expiry(&[leaf.der().clone()], &[ca.der().clone()]).unwrap_err();
        assert!(matches!(err, Error::CertificateVerification { .. }));

        // with no matching anchor configured, the valid leaf passes
        check_expiry(&[leaf.der().clone()], &[]).unwrap();
    }

    #[test]
    fn ip_formatting_round_trips() {
        assert_eq!(format_ip(&[192, 168, 0, 1]).unwrap(), "192.168.0.1");
        assert_eq!(
            format_ip(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]).unwrap(),
            "::1"
        );
        assert_eq!(format_ip(&[1, 2, 3]), None);
    }
}
