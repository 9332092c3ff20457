use std::str::FromStr;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::Error;

use super::ConnectOptions;

impl ConnectOptions {
    pub(crate) fn parse_from_url(url: &Url) -> Result<Self, Error> {
        let mut options = Self::new();

        if let Some(host) = url.host_str() {
            let host = percent_decode_str(host)
                .decode_utf8()
                .map_err(Error::config)?;
            options = options.host(&host);
        }

        if let Some(port) = url.port() {
            options = options.port(port);
        }

        for (key, value) in url.query_pairs().into_iter() {
            match &*key {
                "connect-timeout" => {
                    let ms: u64 = value.parse().map_err(Error::config)?;
                    options = options.connect_timeout(Some(Duration::from_millis(ms)));
                }

                "socket" => {
                    options = options.socket(&*value);
                }

                "socks-host" => {
                    options.socks_host = Some(value.into_owned());
                }

                "socks-port" => {
                    options.socks_port = value.parse().map_err(Error::config)?;
                }

                "socks-remote-dns" => {
                    options.socks_remote_dns = parse_bool(&key, &value)?;
                }

                "local-address" => {
                    options.local_address = Some(value.parse().map_err(Error::config)?);
                }

                "tcp-nodelay" => {
                    options.tcp_nodelay = parse_bool(&key, &value)?;
                }

                "tcp-keepalive" => {
                    let ms: u64 = value.parse().map_err(Error::config)?;
                    options = options.tcp_keepalive(Some(Duration::from_millis(ms)));
                }

                "send-buffer-size" => {
                    options.send_buffer_size = Some(value.parse().map_err(Error::config)?);
                }

                "recv-buffer-size" => {
                    options.recv_buffer_size = Some(value.parse().map_err(Error::config)?);
                }

                "traffic-class" => {
                    options.traffic_class = Some(value.parse().map_err(Error::config)?);
                }

                "sslmode" | "ssl-mode" => {
                    options = options.ssl_mode(value.parse()?);
                }

                "sslca" | "ssl-ca" => {
                    options = options.ssl_ca(strip_file_scheme(&value));
                }

                "sslcert" | "ssl-cert" => {
                    options = options.ssl_client_cert(strip_file_scheme(&value));
                }

                "sslkey" | "ssl-key" => {
                    options = options.ssl_client_key(strip_file_scheme(&value));
                }

                "tls-versions" => {
                    options = options.tls_versions(Some(split_list(&value)));
                }

                "tls-ciphers" => {
                    options = options.tls_ciphers(Some(split_list(&value)));
                }

                "fips" => {
                    options.fips = parse_bool(&key, &value)?;
                }

                "prefer-system-roots" => {
                    options.prefer_system_roots = parse_bool(&key, &value)?;
                }

                _ => {
                    log::warn!("ignoring unrecognized connect parameter {key:?}");
                }
            }
        }

        Ok(options)
    }
}

// A store "URL" without an explicit scheme is a local file path; an explicit
// `file:` scheme is stripped down to that path.
fn strip_file_scheme(value: &str) -> &str {
    value
        .strip_prefix("file://")
        .or_else(|| value.strip_prefix("file:"))
        .unwrap_or(value)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|part| part.trim().to_owned())
        .filter(|part| !part.is_empty())
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::Configuration(
            format!("expected a boolean for {key:?}, got {value:?}").into(),
        )),
    }
}

impl FromStr for ConnectOptions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let url: Url = s.parse().map_err(Error::config)?;
        Self::parse_from_url(&url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SslMode;

    #[test]
    fn it_parses_host_and_port() {
        let options: ConnectOptions = "db://example.com:5656".parse().unwrap();

        assert_eq!(options.host, "example.com");
        assert_eq!(options.port, 5656);
    }

    #[test]
    fn it_parses_transport_tuning() {
        let options: ConnectOptions = "db://host?connect-timeout=2500&tcp-nodelay=false\
             &tcp-keepalive=30000&send-buffer-size=65536&recv-buffer-size=131072&traffic-class=16"
            .parse()
            .unwrap();

        assert_eq!(options.connect_timeout, Some(Duration::from_millis(2500)));
        assert!(!options.tcp_nodelay);
        assert_eq!(options.tcp_keepalive, Some(Duration::from_secs(30)));
        assert_eq!(options.send_buffer_size, Some(65536));
        assert_eq!(options.recv_buffer_size, Some(131072));
        assert_eq!(options.traffic_class, Some(16));
    }

    #[test]
    fn it_parses_socks_proxy() {
        let options: ConnectOptions =
            "db://host?socks-host=proxy.local&socks-port=9150&socks-remote-dns=true"
                .parse()
                .unwrap();

        assert_eq!(options.socks_host.as_deref(), Some("proxy.local"));
        assert_eq!(options.socks_port, 9150);
        assert!(options.socks_remote_dns);
    }

    #[test]
    fn it_parses_tls_settings() {
        let options: ConnectOptions = "db://host?ssl-mode=VERIFY_IDENTITY&ssl-ca=file:///etc/ca.pem\
             &tls-versions=TLSv1.2,TLSv1.3&tls-ciphers=TLS13_AES_128_GCM_SHA256"
            .parse()
            .unwrap();

        assert_eq!(options.ssl_mode, SslMode::VerifyIdentity);
        assert!(options.ssl_ca.is_some());
        assert_eq!(
            options.tls_versions.as_deref(),
            Some(&["TLSv1.2".to_owned(), "TLSv1.3".to_owned()][..])
        );
        assert_eq!(
            options.tls_ciphers.as_deref(),
            Some(&["TLS13_AES_128_GCM_SHA256".to_owned()][..])
        );
    }

    #[test]
    fn store_path_without_scheme_is_a_file() {
        let options: ConnectOptions = "db://host?ssl-ca=/etc/ssl/ca.pem".parse().unwrap();

        match options.ssl_ca {
            Some(crate::tls::CertificateInput::File(path)) => {
                assert_eq!(path, std::path::PathBuf::from("/etc/ssl/ca.pem"));
            }
            other => panic!("expected a file input, got {other:?}"),
        }
    }

    #[test]
    fn it_rejects_malformed_values() {
        assert!("db://host?connect-timeout=soon".parse::<ConnectOptions>().is_err());
        assert!("db://host?tcp-nodelay=maybe".parse::<ConnectOptions>().is_err());
        assert!("db://host?ssl-mode=sometimes".parse::<ConnectOptions>().is_err());
    }
}
