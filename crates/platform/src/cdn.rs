use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tracing::debug;

use crate::client::CdnClient;
use crate::discord::client::check_status;
use crate::error::PlatformError;

/// Plain HTTPS client for attachment URLs.
///
/// CDN URLs are signed; no credential is attached.
#[derive(Debug, Clone)]
pub struct HttpCdnClient {
    client: Client,
}

impl HttpCdnClient {
    /// Build a client with the given overall download timeout and optional proxy.
    pub fn new(timeout: Duration, proxy: Option<&str>) -> Result<Self, PlatformError> {
        let mut builder = Client::builder().timeout(timeout);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| PlatformError::Configuration(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Wrap an existing reqwest client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CdnClient for HttpCdnClient {
    async fn download(&self, url: &str) -> Result<Bytes, PlatformError> {
        let response = check_status(self.client.get(url).send().await?).await?;
        let body = response.bytes().await?;
        debug!(bytes = body.len(), "downloaded attachment");
        Ok(body)
    }

    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, PlatformError> {
        let response = self
            .client
            .head(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PlatformError::Timeout(timeout)
                } else {
                    PlatformError::from(e)
                }
            })?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discord::client::tests::MockServer;

    fn cdn() -> HttpCdnClient {
        HttpCdnClient::new(Duration::from_secs(5), None).unwrap()
    }

    #[tokio::test]
    async fn download_returns_body() {
        let server = MockServer::start().await;
        let url = format!("{}/attachments/1/2/obj.part1", server.base_url);
        let handle = tokio::spawn(async move { server.respond_once(200, "", "chunk-bytes").await });

        let body = cdn().download(&url).await.unwrap();
        handle.await.unwrap();
        assert_eq!(&body[..], b"chunk-bytes");
    }

    #[tokio::test]
    async fn download_of_expired_url_is_not_found() {
        let server = MockServer::start().await;
        let url = format!("{}/attachments/1/2/obj.part1", server.base_url);
        let handle = tokio::spawn(async move { server.respond_once(404, "", "").await });

        let err = cdn().download(&url).await.unwrap_err();
        handle.await.unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn probe_uses_head_and_reports_status() {
        let server = MockServer::start().await;
        let url = format!("{}/attachments/1/2/obj.part1", server.base_url);
        let handle = tokio::spawn(async move { server.respond_once(403, "", "").await });

        let status = cdn().probe(&url, Duration::from_secs(2)).await.unwrap();
        let request = handle.await.unwrap();
        assert_eq!(status, 403);
        assert!(request.starts_with("HEAD /attachments/1/2/obj.part1"));
    }

    #[tokio::test]
    async fn probe_transport_failure_is_error() {
        let err = cdn()
            .probe("http://127.0.0.1:1/x", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
