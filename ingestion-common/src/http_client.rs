use std::time::Duration;

use reqwest::{header::HeaderMap, Method};
use thiserror::Error;

use crate::retry::{retry_http, RetryPolicy};

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("failed to build http client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Thin wrapper over `reqwest::Client` carrying the connect/read/pool
/// timeouts every outbound call should honor, and funneling every request
/// through the retry engine. Auth headers are never injected here — callers
/// (the SMART signer, the export driver, the downloader) pass them explicitly.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    retry_policy: RetryPolicy,
}

pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub pool_idle_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
            pool_idle_timeout: Duration::from_secs(60),
        }
    }
}

impl HttpClient {
    pub fn new(config: HttpClientConfig, retry_policy: RetryPolicy) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(HttpError::ClientBuild)?;

        Ok(Self {
            client,
            retry_policy,
        })
    }

    /// Issues `method url` with the given headers and optional body, retrying
    /// transient failures per the configured policy.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, HttpError> {
        retry_http(&self.retry_policy, url, || {
            let mut req = self.client.request(method.clone(), url).headers(headers.clone());
            if let Some(bytes) = body.clone() {
                req = req.body(bytes);
            }
            req.send()
        })
        .await
        .map_err(|source| HttpError::Request {
            url: url.to_string(),
            source,
        })
    }

    /// Convenience for downloads, which get a wider retry budget than
    /// ordinary metadata calls.
    pub fn widen_retries(&self, extra_attempts: u32) -> Self {
        Self {
            client: self.client.clone(),
            retry_policy: self.retry_policy.widened(extra_attempts),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_default_config() {
        let client = HttpClient::new(HttpClientConfig::default(), RetryPolicy::default());
        assert!(client.is_ok());
    }

    #[test]
    fn widen_retries_increases_budget_without_touching_client() {
        let client = HttpClient::new(HttpClientConfig::default(), RetryPolicy::default()).unwrap();
        let wider = client.widen_retries(2);
        assert_eq!(
            wider.retry_policy().max_attempts,
            client.retry_policy().max_attempts + 2
        );
    }
}
