//! Backend health probing.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::SupervisorError;

/// One health check against a backend base URL.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns true if the backend answered successfully.
    async fn probe(&self, base_url: &str) -> bool;
}

/// `GET {base_url}{path}`; any 2xx counts as healthy.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpHealthProbe {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Result<Self, SupervisorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SupervisorError::HttpClient)?;
        Ok(Self {
            client,
            path: path.into(),
        })
    }

    pub fn url_for(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        let path = self.path.trim_start_matches('/');
        format!("{base}/{path}")
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, base_url: &str) -> bool {
        let url = self.url_for(base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => {
                let ok = resp.status().is_success();
                if !ok {
                    debug!(url = %url, status = %resp.status(), "Health check returned non-success");
                }
                ok
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Health check failed");
                false
            }
        }
    }
}
