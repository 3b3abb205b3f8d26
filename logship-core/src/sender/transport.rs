//! HTTP transport for the ingestion endpoint

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{Error, Result};
use crate::ordered_map::OrderedMap;

/// One POST to the ingestion endpoint.
#[derive(Debug, Clone)]
pub struct IngestionRequest {
    pub url: String,
    /// Headers in the order they were added
    pub headers: OrderedMap<String, String>,
    pub body: Vec<u8>,
}

/// Status and body of an ingestion response.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionResponse {
    pub status: u16,
    pub body: String,
}

/// Issues ingestion requests.
///
/// An `Err` means no HTTP response was received at all (connection refused,
/// timeout, TLS failure) and is treated as retryable.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, request: IngestionRequest) -> std::result::Result<IngestionResponse, String>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: IngestionRequest) -> std::result::Result<IngestionResponse, String> {
        let mut headers = HeaderMap::new();
        for (name, value) in request.headers.iter() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| format!("invalid header name {}: {}", name, e))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| format!("invalid value for header {}: {}", name, e))?;
            headers.insert(name, value);
        }

        let response = self
            .http_client
            .post(&request.url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| format!("HTTP request failed: {}", e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(IngestionResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn request(url: String) -> IngestionRequest {
        let mut headers = OrderedMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("Install-ID".to_string(), "abc".to_string());
        IngestionRequest {
            url,
            headers,
            body: br#"{"logs":[]}"#.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_post_forwards_headers_and_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/logs")
            .match_header("Content-Type", "application/json")
            .match_header("Install-ID", "abc")
            .match_body(r#"{"logs":[]}"#)
            .with_status(202)
            .with_body("accepted")
            .create_async()
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport
            .post(request(format!("{}/logs", server.url())))
            .await
            .unwrap();

        assert_eq!(response.status, 202);
        assert_eq!(response.body, "accepted");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_reports_error_statuses_as_responses() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/logs")
            .with_status(503)
            .create_async()
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport
            .post(request(format!("{}/logs", server.url())))
            .await
            .unwrap();
        assert_eq!(response.status, 503);
    }

    #[tokio::test]
    async fn test_post_connection_failure_is_err() {
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
        // Port 9 (discard) on localhost is not listening in test environments
        let result = transport
            .post(request("http://127.0.0.1:9/logs".to_string()))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_header_is_err() {
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
        let mut req = request("http://127.0.0.1:9/logs".to_string());
        req.headers
            .insert("Bad Header".to_string(), "value".to_string());
        let err = transport.post(req).await.unwrap_err();
        assert!(err.contains("invalid header name"));
    }
}
