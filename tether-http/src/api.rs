//! JSON API helper over reqwest.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{ConnectivityConfig, Error, Result};
use tracing::debug;
use url::Url;

use crate::classify::{check_response, from_reqwest};
use crate::probe::HttpProbe;

/// Remote API configuration.
#[derive(Debug, Clone)]
pub struct RemoteApiConfig {
    /// Base URL every relative path is resolved against.
    pub base_url: String,
    /// Request timeout.
    pub timeout: Duration,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// User agent string.
    pub user_agent: String,
    /// Headers sent with every request.
    pub default_headers: Vec<(String, String)>,
    /// Enable gzip compression.
    pub gzip: bool,
    /// Enable brotli compression.
    pub brotli: bool,
}

impl Default for RemoteApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost".to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("tether-http/{}", env!("CARGO_PKG_VERSION")),
            default_headers: Vec::new(),
            gzip: true,
            brotli: true,
        }
    }
}

impl RemoteApiConfig {
    /// Create a new configuration builder.
    pub fn builder(base_url: impl Into<String>) -> RemoteApiConfigBuilder {
        RemoteApiConfigBuilder {
            config: Self {
                base_url: base_url.into(),
                ..Self::default()
            },
        }
    }
}

/// Builder for remote API configuration.
#[derive(Debug)]
pub struct RemoteApiConfigBuilder {
    config: RemoteApiConfig,
}

impl RemoteApiConfigBuilder {
    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the user agent.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add a header sent with every request.
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.default_headers.push((name.into(), value.into()));
        self
    }

    /// Enable or disable gzip compression.
    pub fn gzip(mut self, enable: bool) -> Self {
        self.config.gzip = enable;
        self
    }

    /// Enable or disable brotli compression.
    pub fn brotli(mut self, enable: bool) -> Self {
        self.config.brotli = enable;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RemoteApiConfig {
        self.config
    }
}

/// Resolve `path` against `base`.
///
/// Absolute URLs are used as given. Relative paths, with or without a
/// leading `/`, are appended to the base path.
pub(crate) fn join_url(base: &Url, path: &str) -> Result<Url> {
    if let Ok(absolute) = Url::parse(path) {
        return Ok(absolute);
    }

    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
        .map_err(|e| Error::Validation(format!("invalid path {path}: {e}")))
}

/// JSON client for the remote data service.
///
/// Every method returns a classified [`tether_core::Error`], ready to be
/// wrapped by a `ResilientClient`.
#[derive(Debug, Clone)]
pub struct RemoteApi {
    inner: reqwest::Client,
    base: Url,
    config: Arc<RemoteApiConfig>,
}

impl RemoteApi {
    /// Create a client.
    pub fn new(config: RemoteApiConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid base URL {}: {e}", config.base_url)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("invalid header value for {name}: {e}")))?;
            headers.insert(name, value);
        }

        let inner = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .gzip(config.gzip)
            .brotli(config.brotli)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner,
            base,
            config: Arc::new(config),
        })
    }

    /// Get the underlying reqwest client.
    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }

    /// Get the configuration.
    pub fn config(&self) -> &RemoteApiConfig {
        &self.config
    }

    /// Resolve `path` against the base URL.
    pub fn url(&self, path: &str) -> Result<Url> {
        join_url(&self.base, path)
    }

    /// Connectivity probe for `config.ping_url` sharing this client's
    /// connection pool. The probe timeout is enforced by the monitor.
    pub fn probe(&self, config: &ConnectivityConfig) -> Result<HttpProbe> {
        Ok(HttpProbe::with_client(
            self.inner.clone(),
            self.url(&config.ping_url)?,
        ))
    }

    /// `GET` a JSON document.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.request(Method::GET, path)?;
        self.send_json(request).await
    }

    /// `POST` a JSON body and decode the JSON answer.
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.request(Method::POST, path)?.json(body);
        self.send_json(request).await
    }

    /// `PUT` a JSON body and decode the JSON answer.
    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.request(Method::PUT, path)?.json(body);
        self.send_json(request).await
    }

    /// `PATCH` a JSON body and decode the JSON answer.
    pub async fn patch_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.request(Method::PATCH, path)?.json(body);
        self.send_json(request).await
    }

    /// `DELETE` a resource, ignoring any response body.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let request = self.request(Method::DELETE, path)?;
        self.send(request).await.map(|_| ())
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.url(path)?;
        debug!(method = %method, url = %url, "Remote request");
        Ok(self.inner.request(method, url))
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| from_reqwest(e, self.config.timeout))?;
        check_response(response).await
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| from_reqwest(e, self.config.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        let base = Url::parse("https://api.example.com/fhir").unwrap();
        assert_eq!(
            join_url(&base, "/health").unwrap().as_str(),
            "https://api.example.com/fhir/health"
        );
        assert_eq!(
            join_url(&base, "Patient/1").unwrap().as_str(),
            "https://api.example.com/fhir/Patient/1"
        );
        assert_eq!(
            join_url(&base, "https://status.example.com/ping").unwrap().as_str(),
            "https://status.example.com/ping"
        );
    }

    #[test]
    fn test_config_builder() {
        let config = RemoteApiConfig::builder("https://api.example.com")
            .timeout(Duration::from_secs(5))
            .default_header("X-Client", "tether")
            .user_agent("clinic/1.0")
            .build();

        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.default_headers.len(), 1);
        assert_eq!(config.user_agent, "clinic/1.0");
        assert!(RemoteApi::new(config).is_ok());
    }

    #[test]
    fn test_invalid_base_url() {
        let config = RemoteApiConfig::builder("not a url").build();
        assert!(matches!(RemoteApi::new(config), Err(Error::Config(_))));
    }
}
