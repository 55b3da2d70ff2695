//! HTTP transport backed by reqwest.

use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use ferry_common::{Error, Result};

use super::{Transport, TransportRequest, TransportResponse};

const USER_AGENT: &str = concat!("Ferry/", env!("CARGO_PKG_VERSION"));

/// Sends requests to a single backend over HTTP.
///
/// Relative targets are resolved against the base URL; absolute targets are
/// used as given.
pub struct HttpTransport {
    http: Client,
    base_url: Url,
}

impl HttpTransport {
    /// Create a transport for `base_url` with a per-request timeout.
    ///
    /// # Errors
    /// - `InvalidInput` if the URL does not parse or the client cannot be built
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL {}: {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a request target to a full URL.
    pub fn resolve(&self, target: &str) -> Result<Url> {
        if let Ok(absolute) = Url::parse(target) {
            return Ok(absolute);
        }
        self.base_url
            .join(target.trim_start_matches('/'))
            .map_err(|e| Error::InvalidInput(format!("Invalid target {}: {}", target, e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse> {
        let url = self.resolve(&request.target)?;
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| Error::InvalidInput(format!("Invalid method: {}", e)))?;

        let mut builder = self.http.request(method, url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::TransientNetwork(format!("{} {} failed: {}", request.method, url, e)))?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::TransientNetwork(format!("Failed to read response body: {}", e)))?;

        debug!("{} {} -> {}", request.method, url, status);
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let transport = HttpTransport::new("https://api.example.com/v1", Duration::from_secs(5)).unwrap();
        assert_eq!(transport.base_url().as_str(), "https://api.example.com/v1/");
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let transport = HttpTransport::new("https://api.example.com/v1/", Duration::from_secs(5)).unwrap();

        assert_eq!(
            transport.resolve("/patients/42").unwrap().as_str(),
            "https://api.example.com/v1/patients/42"
        );
        assert_eq!(
            transport.resolve("notes?draft=true").unwrap().as_str(),
            "https://api.example.com/v1/notes?draft=true"
        );
        assert_eq!(
            transport.resolve("https://other.example.com/x").unwrap().as_str(),
            "https://other.example.com/x"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let result = HttpTransport::new("not a url", Duration::from_secs(5));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let transport = HttpTransport::new("http://127.0.0.1:1/", Duration::from_secs(2)).unwrap();
        let request = TransportRequest::new(ferry_common::Method::Get, "/health");

        let err = transport.execute(&request).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
