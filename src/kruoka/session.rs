use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::cookie::Jar;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::Url;
use tracing::debug;

use super::challenge::Credentials;
use super::transport::{TransportError, TransportResult};
use super::types::{ApiRequest, ApiResponse, Method};
use crate::sync::config_loader::Api;

/// One HTTP client bound to a set of credentials.
pub trait HttpSession: Send + Sync {
    fn send(&self, request: &ApiRequest) -> TransportResult<ApiResponse>;
}

/// Builds sessions seeded with the given credentials.
pub trait SessionFactory: Send + Sync {
    fn create(&self, credentials: &Credentials) -> TransportResult<Arc<dyn HttpSession>>;
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub base_url: String,
    pub cookie_domain: String,
    pub build_number: String,
    pub experiments: String,
    pub timeout: Duration,
}

impl From<&Api> for SessionSettings {
    fn from(api: &Api) -> Self {
        Self {
            base_url: api.base_url.trim_end_matches('/').to_string(),
            cookie_domain: api.cookie_domain.clone(),
            build_number: api.build_number.clone(),
            experiments: api.experiments.clone(),
            timeout: api.request_timeout(),
        }
    }
}

/// Blocking reqwest client carrying the clearance cookies and the
/// solver's user agent.
pub struct ReqwestSession {
    client: Client,
    base_url: String,
}

impl ReqwestSession {
    fn url_for(&self, request: &ApiRequest) -> TransportResult<Url> {
        let raw = format!("{}/{}", self.base_url, request.endpoint.trim_start_matches('/'));
        let mut url = Url::parse(&raw).map_err(|e| TransportError::Build(e.to_string()))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }
}

impl HttpSession for ReqwestSession {
    fn send(&self, request: &ApiRequest) -> TransportResult<ApiResponse> {
        let url = self.url_for(request)?;
        debug!(method = ?request.method, url = %url, "Sending request");

        let builder = match request.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
        };
        let builder = match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        };

        let response = builder.send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        Ok(ApiResponse::new(status, body))
    }
}

pub struct ReqwestSessionFactory {
    settings: SessionSettings,
}

impl ReqwestSessionFactory {
    pub fn new(settings: SessionSettings) -> Self {
        Self { settings }
    }

    fn default_headers(&self, credentials: &Credentials) -> TransportResult<HeaderMap> {
        let value = |v: &str| HeaderValue::from_str(v).map_err(|e| TransportError::Build(e.to_string()));

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if !credentials.fingerprint().is_empty() {
            headers.insert(USER_AGENT, value(credentials.fingerprint())?);
        }
        headers.insert(
            HeaderName::from_static("x-k-build-number"),
            value(&self.settings.build_number)?,
        );
        headers.insert(
            HeaderName::from_static("x-k-experiments"),
            value(&self.settings.experiments)?,
        );
        Ok(headers)
    }

    fn cookie_jar(&self, credentials: &Credentials) -> TransportResult<Jar> {
        let url =
            Url::parse(&self.settings.base_url).map_err(|e| TransportError::Build(e.to_string()))?;
        let jar = Jar::default();
        for (name, value) in credentials.cookies() {
            jar.add_cookie_str(
                &format!("{name}={value}; Domain={}; Path=/", self.settings.cookie_domain),
                &url,
            );
        }
        Ok(jar)
    }
}

impl SessionFactory for ReqwestSessionFactory {
    fn create(&self, credentials: &Credentials) -> TransportResult<Arc<dyn HttpSession>> {
        let client = Client::builder()
            .default_headers(self.default_headers(credentials)?)
            .cookie_provider(Arc::new(self.cookie_jar(credentials)?))
            .timeout(self.settings.timeout)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .use_rustls_tls()
            .build()?;

        Ok(Arc::new(ReqwestSession {
            client,
            base_url: self.settings.base_url.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::config_loader::AppConfig;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn factory() -> ReqwestSessionFactory {
        ReqwestSessionFactory::new(SessionSettings::from(&AppConfig::default().api))
    }

    fn credentials() -> Credentials {
        Credentials::new(
            BTreeMap::from([("cf_clearance".to_string(), "token".to_string())]),
            "Mozilla/5.0 Test",
        )
    }

    #[test]
    fn test_url_building() {
        let session = ReqwestSession {
            client: Client::new(),
            base_url: "https://www.k-ruoka.fi/kr-api".to_string(),
        };

        let request = ApiRequest::get("search-offers/")
            .with_query("storeId", "N110")
            .with_query("categoryPath", "juomat");
        let url = session.url_for(&request).unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.k-ruoka.fi/kr-api/search-offers/?storeId=N110&categoryPath=juomat"
        );

        let post = ApiRequest::post("/stores/search", json!({}));
        assert_eq!(
            session.url_for(&post).unwrap().as_str(),
            "https://www.k-ruoka.fi/kr-api/stores/search"
        );
    }

    #[test]
    fn test_headers_carry_fingerprint() {
        let headers = factory().default_headers(&credentials()).unwrap();
        assert_eq!(headers.get(USER_AGENT).unwrap(), "Mozilla/5.0 Test");
        assert_eq!(headers.get("x-k-build-number").unwrap(), "29159");
        assert!(headers.contains_key("x-k-experiments"));
    }

    #[test]
    fn test_factory_builds_session() {
        assert!(factory().create(&credentials()).is_ok());
    }
}
