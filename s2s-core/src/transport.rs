//! Request manager: one configured blocking HTTP client, and request
//! builders carrying the headers every site-to-site call needs.
//!
//! No retries happen here; callers own their retry policy.
//!
//! `timeout` bounds each ordinary request end to end. Streaming uploads get
//! only the connect timeout from the client; their caller bounds the wait
//! for the answer once the body is written.

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Certificate, Identity, Method, Proxy, Url};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::{CONTENT_TYPE_JSON, HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION};

pub struct RequestManager {
    client: Client,
    secure: bool,
    timeout: Duration,
}

impl RequestManager {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(None::<Duration>)
            .connect_timeout(config.connect_timeout());

        if let Some(tls) = &config.tls {
            if let Some(path) = &tls.identity_pem {
                let pem = std::fs::read(path)?;
                builder = builder.identity(Identity::from_pem(&pem)?);
            }
            if let Some(path) = &tls.ca_pem {
                let pem = std::fs::read(path)?;
                builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
            }
        }

        builder = match &config.proxy {
            Some(proxy) => {
                let mut p = Proxy::all(format!("http://{}:{}", proxy.host, proxy.port))?;
                if let Some(user) = &proxy.username {
                    p = p.basic_auth(user, proxy.password.as_deref().unwrap_or(""));
                }
                builder.proxy(p)
            }
            // Ignore *_PROXY from the environment; proxying is explicit config.
            None => builder.no_proxy(),
        };

        Ok(Self {
            client: builder.build()?,
            secure: config.is_secure(),
            timeout: config.timeout(),
        })
    }

    /// Whether this transport speaks HTTPS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Deadline for a whole ordinary request.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build a request for `url`.
    ///
    /// Fails when the URL scheme does not match the transport security, so a
    /// TLS client never silently talks plain HTTP. `Accept: application/json`
    /// and the protocol version header are added unless `headers` sets them.
    pub fn open_connection(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        query: &[(&str, &str)],
        method: Method,
    ) -> Result<RequestBuilder> {
        Ok(self.request(url, headers, query, method)?.timeout(self.timeout))
    }

    /// Like [`open_connection`](Self::open_connection), without the total
    /// deadline, for bodies streamed for as long as the caller has data.
    pub(crate) fn open_streaming_connection(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        method: Method,
    ) -> Result<RequestBuilder> {
        self.request(url, headers, &[], method)
    }

    fn request(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        query: &[(&str, &str)],
        method: Method,
    ) -> Result<RequestBuilder> {
        let mut target = Url::parse(url).map_err(|e| Error::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let wanted = if self.secure { "https" } else { "http" };
        if target.scheme() != wanted {
            return Err(Error::SchemeMismatch {
                url: url.to_string(),
                secure: self.secure,
            });
        }
        if !query.is_empty() {
            target.query_pairs_mut().extend_pairs(query);
        }

        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::Protocol(format!("invalid header name {name:?}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::Protocol(format!("invalid value for header {name}")))?;
            map.insert(name, value);
        }
        if !map.contains_key(ACCEPT) {
            map.insert(ACCEPT, HeaderValue::from_static(CONTENT_TYPE_JSON));
        }
        if !map.contains_key(HEADER_PROTOCOL_VERSION) {
            map.insert(
                HeaderName::from_static(HEADER_PROTOCOL_VERSION),
                HeaderValue::from_static(PROTOCOL_VERSION),
            );
        }

        tracing::debug!(%method, url = %target, "opening connection");
        Ok(self.client.request(method, target).headers(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, TlsConfig};
    use crate::test_server::{MockServer, Reply};

    fn plain() -> RequestManager {
        RequestManager::new(&ClientConfig::default()).unwrap()
    }

    #[test]
    fn applies_default_headers() {
        let req = plain()
            .open_connection("http://peer:8080/nifi-api/site-to-site", &[], &[], Method::GET)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(req.headers()[ACCEPT], "application/json");
        assert_eq!(req.headers()[HEADER_PROTOCOL_VERSION], PROTOCOL_VERSION);
    }

    #[test]
    fn caller_headers_win() {
        let req = plain()
            .open_connection(
                "http://peer:8080/nifi-api/tx/1/flow-files",
                &[("Accept", "text/plain")],
                &[],
                Method::POST,
            )
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(req.headers()[ACCEPT], "text/plain");
        assert_eq!(req.headers().get_all(ACCEPT).iter().count(), 1);
    }

    #[test]
    fn appends_encoded_query() {
        let req = plain()
            .open_connection(
                "http://peer:8080/nifi-api/tx/1",
                &[],
                &[("responseCode", "12"), ("note", "a b&c")],
                Method::DELETE,
            )
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(req.url().query(), Some("responseCode=12&note=a+b%26c"));
        assert_eq!(req.method(), &Method::DELETE);
    }

    #[test]
    fn rejects_scheme_mismatch() {
        let err = plain()
            .open_connection("https://peer:8443/nifi-api", &[], &[], Method::GET)
            .unwrap_err();
        assert!(matches!(err, Error::SchemeMismatch { secure: false, .. }));

        let secure = RequestManager::new(&ClientConfig {
            tls: Some(TlsConfig {
                identity_pem: None,
                ca_pem: None,
            }),
            ..ClientConfig::default()
        })
        .unwrap();
        assert!(secure.is_secure());
        let err = secure
            .open_connection("http://peer:8080/nifi-api", &[], &[], Method::GET)
            .unwrap_err();
        assert!(matches!(err, Error::SchemeMismatch { secure: true, .. }));
    }

    #[test]
    fn rejects_unparseable_url() {
        let err = plain()
            .open_connection("not a url", &[], &[], Method::GET)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUrl { .. }));
    }

    #[test]
    fn requests_go_through_authenticated_proxy() {
        let proxy = MockServer::start(|_, _| Reply::json(200, "{}"));
        let manager = RequestManager::new(&ClientConfig {
            proxy: Some(ProxyConfig {
                host: "127.0.0.1".into(),
                port: proxy.port(),
                username: Some("edge".into()),
                password: Some("secret".into()),
            }),
            ..ClientConfig::default()
        })
        .unwrap();

        let response = manager
            .open_connection("http://peer.invalid:8080/nifi-api/site-to-site", &[], &[], Method::GET)
            .unwrap()
            .send()
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);

        let seen = proxy.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].path, "http://peer.invalid:8080/nifi-api/site-to-site");
        assert_eq!(seen[0].header("proxy-authorization"), Some("Basic ZWRnZTpzZWNyZXQ="));
    }

    #[test]
    fn without_proxy_config_requests_go_direct() {
        let server = MockServer::start(|_, _| Reply::json(200, "{}"));
        let url = format!("{}/site-to-site", server.base_url());
        plain()
            .open_connection(&url, &[], &[], Method::GET)
            .unwrap()
            .send()
            .unwrap();
        let seen = server.requests();
        assert_eq!(seen[0].path, "/nifi-api/site-to-site");
        assert_eq!(seen[0].header("proxy-authorization"), None);
    }

    #[test]
    fn only_ordinary_requests_carry_the_total_timeout() {
        let manager = RequestManager::new(&ClientConfig {
            timeout_ms: 1_500,
            ..ClientConfig::default()
        })
        .unwrap();
        let url = "http://peer:8080/nifi-api/tx/1/flow-files";

        let ordinary = manager
            .open_connection(url, &[], &[], Method::GET)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(ordinary.timeout(), Some(&Duration::from_millis(1_500)));

        let streaming = manager
            .open_streaming_connection(url, &[("Accept", "text/plain")], Method::POST)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(streaming.timeout(), None);
        assert_eq!(streaming.headers()[ACCEPT], "text/plain");
        assert_eq!(streaming.headers()[HEADER_PROTOCOL_VERSION], PROTOCOL_VERSION);
    }
}
