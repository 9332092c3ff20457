use std::sync::Arc;

use rustls::crypto::{ring, CryptoProvider};
use rustls::{SupportedCipherSuite, SupportedProtocolVersion};

use crate::error::{Error, Result};
use crate::options::ConnectOptions;

/// Suites every peer is expected to support; always negotiable.
const MANDATORY_CIPHERS: &[&str] = &[
    "TLS13_AES_128_GCM_SHA256",
    "TLS13_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
];

/// Suites negotiable by default, beyond the mandatory set.
const APPROVED_CIPHERS: &[&str] = &[
    "TLS13_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
];

/// Suites negotiated only when explicitly listed by the user.
const DEPRECATED_CIPHERS: &[&str] = &[
    "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA",
    "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA",
    "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
    "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
];

/// A suite whose name contains any of these is never negotiated, not even
/// when explicitly listed.
const UNACCEPTABLE_SUBSTRINGS: &[&str] =
    &["NULL", "RC4", "3DES", "DES_", "_MD5", "EXPORT", "ANON"];

fn suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

fn is_acceptable(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    !UNACCEPTABLE_SUBSTRINGS.iter().any(|s| upper.contains(s))
}

fn in_any_tier(name: &str) -> bool {
    MANDATORY_CIPHERS.contains(&name)
        || APPROVED_CIPHERS.contains(&name)
        || DEPRECATED_CIPHERS.contains(&name)
}

fn is_approved(name: &str) -> bool {
    MANDATORY_CIPHERS
        .iter()
        .chain(APPROVED_CIPHERS)
        .any(|n| n.eq_ignore_ascii_case(name))
}

// CHACHA20-POLY1305 is not a FIPS-approved algorithm.
fn is_fips_approved(name: &str) -> bool {
    !name.to_ascii_uppercase().contains("CHACHA20")
}

/// Resolve the effective protocol version set.
///
/// The approved set is TLS 1.2 and TLS 1.3; known-weak versions (TLS 1.1 and
/// below) are never negotiable. An explicit override is intersected with the
/// approved set and must remain non-empty, otherwise the configuration is
/// rejected before any I/O.
pub(crate) fn protocol_versions(
    explicit: Option<&[String]>,
) -> Result<Vec<&'static SupportedProtocolVersion>> {
    const APPROVED: &[(&str, &SupportedProtocolVersion)] = &[
        ("TLSv1.3", &rustls::version::TLS13),
        ("TLSv1.2", &rustls::version::TLS12),
    ];

    let list = match explicit {
        None => return Ok(APPROVED.iter().map(|(_, v)| *v).collect()),
        Some(list) => list,
    };

    let mut versions = Vec::new();

    for name in list {
        match APPROVED.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some((_, version))
                if !versions
                    .iter()
                    .any(|v: &&SupportedProtocolVersion| v.version == version.version) =>
            {
                versions.push(*version)
            }
            Some(_) => {}
            None => {
                log::warn!("ignoring disapproved or unknown TLS version {name:?}");
            }
        }
    }

    if versions.is_empty() {
        return Err(Error::TlsConfig(
            format!(
                "explicit TLS version list {list:?} contains no approved version \
                 (approved: TLSv1.2, TLSv1.3)"
            )
            .into(),
        ));
    }

    Ok(versions)
}

fn cipher_suites(
    available: &[SupportedCipherSuite],
    explicit: Option<&[String]>,
    fips: bool,
) -> Result<Vec<SupportedCipherSuite>> {
    let suites: Vec<SupportedCipherSuite> = match explicit {
        None => available
            .iter()
            .filter(|suite| {
                let name = suite_name(suite);
                // deprecated suites require an explicit opt-in
                is_approved(&name)
                    && is_acceptable(&name)
                    && (!fips || is_fips_approved(&name))
            })
            .copied()
            .collect(),

        Some(list) => {
            if !list.iter().any(|name| is_approved(name)) {
                return Err(Error::TlsConfig(
                    format!(
                        "explicit cipher list {list:?} contains no approved suite; \
                         refusing to negotiate"
                    )
                    .into(),
                ));
            }

            available
                .iter()
                .filter(|suite| {
                    let name = suite_name(suite);
                    list.iter().any(|n| n.eq_ignore_ascii_case(&name))
                        && in_any_tier(&name)
                        && is_acceptable(&name)
                        && (!fips || is_fips_approved(&name))
                })
                .copied()
                .collect()
        }
    };

    if suites.is_empty() {
        return Err(Error::TlsConfig(
            "effective cipher suite list is empty after policy filtering".into(),
        ));
    }

    Ok(suites)
}

/// Build the crypto provider carrying the policy-filtered cipher suites.
pub(crate) fn crypto_provider(options: &ConnectOptions) -> Result<Arc<CryptoProvider>> {
    let mut provider = ring::default_provider();

    provider.cipher_suites = cipher_suites(
        &provider.cipher_suites,
        options.tls_ciphers.as_deref(),
        options.fips,
    )?;

    Ok(Arc::new(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn default_versions_are_approved_only() {
        let versions = protocol_versions(None).unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[test]
    fn weak_version_override_is_rejected_not_downgraded() {
        let err = protocol_versions(Some(&names(&["TLSv1", "TLSv1.1", "SSLv3"]))).unwrap_err();
        assert!(matches!(err, Error::TlsConfig(_)));
    }

    #[test]
    fn mixed_version_override_keeps_the_approved_subset() {
        let versions = protocol_versions(Some(&names(&["TLSv1.1", "TLSv1.3"]))).unwrap();
        assert_eq!(versions.len(), 1);
    }

    #[test]
    fn default_cipher_set_is_nonempty_and_clean() {
        let provider = ring::default_provider();
        let suites = cipher_suites(&provider.cipher_suites, None, false).unwrap();

        assert!(!suites.is_empty());
        for suite in &suites {
            assert!(is_acceptable(&suite_name(suite)));
        }
    }

    #[test]
    fn override_without_an_approved_suite_is_rejected() {
        let provider = ring::default_provider();
        let err = cipher_suites(
            &provider.cipher_suites,
            Some(&names(&["TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA"])),
            false,
        )
        .unwrap_err();

        assert!(matches!(err, Error::TlsConfig(_)));
    }

    #[test]
    fn denylisted_suites_never_survive_an_override() {
        let provider = ring::default_provider();
        let err = cipher_suites(
            &provider.cipher_suites,
            Some(&names(&["TLS_RSA_WITH_RC4_128_MD5"])),
            false,
        )
        .unwrap_err();

        assert!(matches!(err, Error::TlsConfig(_)));
    }

    #[test]
    fn fips_drops_chacha20() {
        let provider = ring::default_provider();
        let suites = cipher_suites(&provider.cipher_suites, None, true).unwrap();

        for suite in &suites {
            assert!(!suite_name(suite).contains("CHACHA20"));
        }
    }
}
