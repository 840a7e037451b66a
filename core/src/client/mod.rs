use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{NetworkErrorKind, Result, StrataError};
use crate::model::query::EndpointMetadata;
use crate::model::request::RequestConfig;

pub mod deduplicator;
pub mod encoding;
pub mod transport;

use deduplicator::{BeginOutcome, Deduplicator, PrimaryGuard};
use transport::{Transport, TransportError, TransportResponse};

/// A successful exchange: any status in [200, 300) plus 304, which is
/// reported as `not_modified` with whatever body the server sent (usually
/// none).
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub not_modified: bool,
}

impl ApiResponse {
    /// Decodes the JSON body into a typed value using the given coder.
    pub fn decode<T: DeserializeOwned>(&self, coder: &CoderConfig) -> Result<T> {
        let value: Value = serde_json::from_slice(&self.body)?;
        let value = match coder.keys {
            KeyDecodingStrategy::UseDefault => value,
            KeyDecodingStrategy::ConvertFromCamelCase => convert_keys_from_camel_case(value),
        };
        Ok(serde_json::from_value(value)?)
    }

    pub fn endpoint_metadata(&self) -> EndpointMetadata {
        EndpointMetadata {
            status: Some(self.status),
            headers: self.headers.clone(),
        }
    }
}

pub type ApiResult = Result<ApiResponse>;

/// How JSON keys map onto Rust field names during typed decoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyDecodingStrategy {
    #[default]
    UseDefault,
    /// Rename `camelCase` keys to `snake_case` recursively before decoding.
    ConvertFromCamelCase,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoderConfig {
    pub keys: KeyDecodingStrategy,
}

fn convert_keys_from_camel_case(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (camel_to_snake(&k), convert_keys_from_camel_case(v)))
                .collect(),
        ),
        Value::Array(values) => Value::Array(
            values
                .into_iter()
                .map(convert_keys_from_camel_case)
                .collect(),
        ),
        other => other,
    }
}

fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Hook points around request execution. `prepare` may supply host defaults
/// and auth headers; the did hooks fire exactly once per non-deduplicated
/// request and never for duplicates or cancellations.
#[async_trait]
pub trait ClientDelegate: Send + Sync {
    async fn prepare(&self, config: RequestConfig) -> RequestConfig {
        config
    }

    async fn did_send(&self, _config: &RequestConfig) {}

    async fn did_receive(&self, _config: &RequestConfig, _result: &ApiResult) {}
}

/// Executes request configs against the injected transport: prepare, check
/// the deduplicator, render, send, interpret, publish.
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    deduplicator: Deduplicator,
    delegate: Option<Arc<dyn ClientDelegate>>,
    host: Option<String>,
    coder: CoderConfig,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            deduplicator: Deduplicator::new(),
            delegate: None,
            host: None,
            coder: CoderConfig::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn ClientDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn with_coder(mut self, coder: CoderConfig) -> Self {
        self.coder = coder;
        self
    }

    pub async fn send(&self, config: RequestConfig) -> ApiResult {
        let config = match &self.delegate {
            Some(delegate) => delegate.prepare(config).await,
            None => config,
        };
        if let BeginOutcome::Duplicate(rx) = self.deduplicator.begin(&config) {
            return match rx.await {
                Ok(result) => result,
                // The primary vanished without completing.
                Err(_) => Err(StrataError::Network(NetworkErrorKind::Cancelled)),
            };
        }
        let guard = PrimaryGuard::new(&self.deduplicator, &config);
        let result = self.execute(&config).await;
        guard.complete(&result);
        result
    }

    /// Sends and decodes the JSON body into a typed value.
    pub async fn send_decoding<T: DeserializeOwned>(&self, config: RequestConfig) -> Result<T> {
        let response = self.send(config).await?;
        response.decode(&self.coder)
    }

    async fn execute(&self, config: &RequestConfig) -> ApiResult {
        let request = encoding::render(config, self.host.as_deref())?;
        if let Some(delegate) = &self.delegate {
            delegate.did_send(config).await;
        }
        let result = match self.transport.send(request).await {
            Ok(response) => interpret(response),
            Err(TransportError::NotHttp) => Err(StrataError::ProtocolNotHttp),
            Err(TransportError::Network(kind)) => Err(StrataError::Network(kind)),
        };
        if let Some(delegate) = &self.delegate {
            delegate.did_receive(config, &result).await;
        }
        result
    }
}

fn interpret(response: TransportResponse) -> ApiResult {
    let status = response.status.as_u16();
    if (200..300).contains(&status) || status == 304 {
        Ok(ApiResponse {
            status,
            headers: response.headers,
            body: response.body,
            not_modified: status == 304,
        })
    } else {
        let payload = serde_json::from_slice(&response.body).ok();
        let raw = if response.body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&response.body).to_string())
        };
        Err(StrataError::Api {
            status,
            payload,
            raw,
        })
    }
}
