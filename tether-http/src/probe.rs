//! HTTP connectivity probe.

use async_trait::async_trait;
use std::time::Duration;
use tether_core::{ConnectivityConfig, ConnectivityProbe, Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::api::join_url;

/// Sends `HEAD` to a ping URL; any 2xx answer means online.
///
/// Cancelling the token drops the in-flight request, which closes its
/// connection.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: Url,
}

impl HttpProbe {
    /// Probe `url` with its own client bounded by `timeout`.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::Config(format!("invalid ping URL {url}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build probe client: {e}")))?;
        Ok(Self { client, url })
    }

    /// Probe `url` through an existing client.
    pub fn with_client(client: reqwest::Client, url: Url) -> Self {
        Self { client, url }
    }

    /// Probe `ping_url` relative to `base_url`, bounded by the configured
    /// probe timeout.
    pub fn from_config(base_url: &str, config: &ConnectivityConfig) -> Result<Self> {
        let base =
            Url::parse(base_url).map_err(|e| Error::Config(format!("invalid base URL {base_url}: {e}")))?;
        let url = join_url(&base, &config.ping_url)?;
        Self::new(url.as_str(), config.probe_timeout)
    }

    /// URL being probed.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self, cancel: CancellationToken) -> bool {
        let request = self.client.head(self.url.clone()).send();

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(url = %self.url, "Connectivity probe cancelled");
                false
            }
            result = request => match result {
                Ok(response) => {
                    let online = response.status().is_success();
                    debug!(url = %self.url, status = response.status().as_u16(), online, "Connectivity probe answered");
                    online
                }
                Err(e) => {
                    debug!(url = %self.url, error = %e, "Connectivity probe failed");
                    false
                }
            },
        }
    }
}
