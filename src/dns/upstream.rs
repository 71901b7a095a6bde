//! Upstream DoH resolver client

use hyper::header::{ACCEPT, CONTENT_TYPE};

use super::DNS_MESSAGE_CONTENT_TYPE;

/// Default upstream resolver
pub const DEFAULT_UPSTREAM: &str = "https://doh.pub/dns-query";

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Resolver that answers forwarded queries
#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
    /// Exchange one DNS wire message for its answer
    async fn exchange(&self, query: Vec<u8>) -> Result<Vec<u8>, UpstreamError>;
}

/// Forwards queries as DoH POST requests
#[derive(Debug, Clone)]
pub struct HttpsUpstream {
    client: reqwest::Client,
    url: String,
}

impl HttpsUpstream {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Upstream for HttpsUpstream {
    async fn exchange(&self, query: Vec<u8>) -> Result<Vec<u8>, UpstreamError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
            .header(ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
            .body(query)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.bytes().await?.to_vec())
    }
}
