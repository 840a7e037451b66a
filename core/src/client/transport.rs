use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::error::NetworkErrorKind;

/// A fully rendered request, ready for the wire. All identifier placeholders
/// have been substituted by the time one of these exists.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: http::Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

/// The buffered response shape the core works with. Streaming variants are a
/// transport concern and are collected before they reach the client.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: http::StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub mime: Option<String>,
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Network(NetworkErrorKind),
    /// The transport produced a response that is not HTTP.
    NotHttp,
}

/// The injected HTTP capability. Implementations send one buffered request
/// and report either a response (any status) or a transport-level failure.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

#[cfg(feature = "reqwest-transport")]
pub use reqwest_transport::ReqwestTransport;

#[cfg(feature = "reqwest-transport")]
mod reqwest_transport {
    use super::*;

    /// Default [Transport] over a shared [reqwest::Client].
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    impl Default for ReqwestTransport {
        fn default() -> Self {
            Self::new(reqwest::Client::new())
        }
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn send(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            let mut builder = self
                .client
                .request(request.method, request.url.as_str());
            for (key, value) in &request.headers {
                builder = builder.header(key, value);
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }
            let response = builder.send().await.map_err(classify_reqwest_error)?;
            let status = response.status();
            let headers = response
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_string(),
                        String::from_utf8_lossy(v.as_bytes()).to_string(),
                    )
                })
                .collect::<Vec<_>>();
            let mime = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                .map(|(_, v)| v.split(';').next().unwrap_or(v).trim().to_string());
            let encoding = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-encoding"))
                .map(|(_, v)| v.clone());
            let body = response
                .bytes()
                .await
                .map_err(classify_reqwest_error)?;
            Ok(TransportResponse {
                status,
                headers,
                body,
                mime,
                encoding,
            })
        }
    }

    fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
        let kind = if e.is_timeout() {
            NetworkErrorKind::TimedOut
        } else if e.is_connect() {
            NetworkErrorKind::CannotConnectToHost
        } else if e.is_builder() || e.is_request() {
            NetworkErrorKind::BadUrl
        } else {
            NetworkErrorKind::Unknown
        };
        TransportError::Network(kind)
    }
}
