use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::Url;

use crate::error::{Result, StrataError};
use crate::model::identifier::Identifier;
use crate::model::request::{Body, PathPart, QueryValue, RequestConfig};

use super::transport::TransportRequest;

/// Everything outside ASCII alphanumerics and `* - . _ ~` is escaped. This is
/// the query-allowed set minus `:/?#[]@!$&'()+,;=`, applied uniformly to path
/// segments, query items and form bodies.
const ESCAPE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'*')
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub fn escape(component: &str) -> String {
    utf8_percent_encode(component, ESCAPE_SET).to_string()
}

fn encode_identifier(id: &Identifier) -> Result<String> {
    match id.remote_value() {
        Some(remote) => Ok(remote.to_string()),
        None => Err(StrataError::UrlConstruction(format!(
            "identifier placeholder {} was not substituted before send",
            id.placeholder().unwrap_or_default()
        ))),
    }
}

/// Renders the query pairs as `k1=v1&k2=v2&…` in declaration order. Array
/// values emit repeated `k[]=v` pairs; nested arrays are invalid.
pub fn encode_query(query: &[(String, QueryValue)]) -> Result<String> {
    let mut pairs = Vec::new();
    for (key, value) in query {
        encode_query_value(key, value, false, &mut pairs)?;
    }
    Ok(pairs.join("&"))
}

fn encode_query_value(
    key: &str,
    value: &QueryValue,
    inside_array: bool,
    pairs: &mut Vec<String>,
) -> Result<()> {
    match value {
        QueryValue::Scalar(scalar) => {
            let key = if inside_array {
                format!("{}[]", key)
            } else {
                key.to_string()
            };
            pairs.push(format!("{}={}", escape(&key), escape(scalar)));
            Ok(())
        }
        QueryValue::Identifier(id) => {
            let rendered = encode_identifier(id)?;
            let key = if inside_array {
                format!("{}[]", key)
            } else {
                key.to_string()
            };
            pairs.push(format!("{}={}", escape(&key), escape(&rendered)));
            Ok(())
        }
        QueryValue::Array(values) => {
            if inside_array {
                return Err(StrataError::UrlConstruction(format!(
                    "nested array value for query key {}",
                    key
                )));
            }
            for value in values {
                encode_query_value(key, value, true, pairs)?;
            }
            Ok(())
        }
    }
}

/// Form-url-encodes body pairs with the same escaping, joined by `&`.
pub fn encode_form(pairs: &[(String, String)]) -> Vec<u8> {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
        .collect::<Vec<_>>()
        .join("&")
        .into_bytes()
}

fn encode_path(config: &RequestConfig) -> Result<String> {
    let mut segments = Vec::new();
    for part in config.path.parts() {
        match part {
            PathPart::Component(segment) => segments.push(escape(&segment)),
            PathPart::Identifier(id) => segments.push(escape(&encode_identifier(&id)?)),
        }
    }
    Ok(segments.join("/"))
}

/// Renders a request config against its host (or the client's default) into
/// a concrete transport request. Placeholder and URL failures surface here,
/// before the transport is ever touched.
pub fn render(config: &RequestConfig, default_host: Option<&str>) -> Result<TransportRequest> {
    let host = config
        .host
        .as_deref()
        .or(default_host)
        .ok_or_else(|| StrataError::UrlConstruction("no host configured".to_string()))?;

    let path = encode_path(config)?;
    let query = encode_query(&config.query)?;
    let mut raw = format!("{}/{}", host.trim_end_matches('/'), path);
    if !query.is_empty() {
        raw.push('?');
        raw.push_str(&query);
    }
    let url = Url::parse(&raw)?;

    let mut headers = config.headers.clone();
    let body = match &config.body {
        None => None,
        Some(Body::Raw(bytes)) => Some(bytes.clone()),
        Some(Body::Form(pairs)) => {
            if !headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            {
                headers.push((
                    "content-type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                ));
            }
            Some(encode_form(pairs))
        }
    };

    Ok(TransportRequest {
        method: config.method.into(),
        url,
        headers,
        body,
        timeout: config.timeout,
    })
}
