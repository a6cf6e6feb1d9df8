use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, uri::PathAndQuery, HeaderValue, Uri},
    middleware::Next,
    response::Response,
};
use serde_json::Value;

use crate::error::{ApiError, AppError};

/// Keys that could be read as query operators or nested paths by a store.
pub fn is_unsafe_key(key: &str) -> bool {
    key.starts_with('$') || key.contains('.')
}

/// Recursively drop unsafe keys. Returns whether anything was removed.
pub fn sanitize_value(value: &mut Value) -> bool {
    match value {
        Value::Object(map) => {
            let before = map.len();
            map.retain(|k, _| !is_unsafe_key(k));
            let mut changed = map.len() != before;
            for v in map.values_mut() {
                changed |= sanitize_value(v);
            }
            changed
        }
        Value::Array(items) => items.iter_mut().fold(false, |acc, v| sanitize_value(v) | acc),
        _ => false,
    }
}

/// Query string without unsafe keys, or `None` when nothing needed removing.
/// Bracketed keys are judged by both the field and the operator part.
pub fn sanitize_query(raw: &str) -> Option<String> {
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(raw.as_bytes()).into_owned().collect();
    let unsafe_pair = |k: &str| k.split(|c| c == '[' || c == ']').any(|part| !part.is_empty() && is_unsafe_key(part));
    if !pairs.iter().any(|(k, _)| unsafe_pair(k)) {
        return None;
    }
    let mut out = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in pairs.iter().filter(|(k, _)| !unsafe_pair(k)) {
        out.append_pair(k, v);
    }
    Some(out.finish())
}

/// Global middleware: strips operator-like keys from the query string and JSON
/// bodies before anything else reads them. Also bounds the body size.
pub async fn sanitize_request(
    State(max_body_bytes): State<usize>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (mut parts, body) = request.into_parts();

    if let Some(clean) = parts.uri.query().and_then(sanitize_query) {
        tracing::warn!("Removed unsafe query keys from {}", parts.uri.path());
        parts.uri = with_query(&parts.uri, &clean)?;
    }

    let bytes = to_bytes(body, max_body_bytes)
        .await
        .map_err(|_| AppError::new("Request body too large", 413))?;

    let is_json = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |ct| ct.starts_with("application/json"));

    let bytes = match serde_json::from_slice::<Value>(&bytes) {
        Ok(mut value) if is_json => {
            if sanitize_value(&mut value) {
                tracing::warn!("Removed unsafe keys from request body on {}", parts.uri.path());
                let clean = serde_json::to_vec(&value).map_err(|e| ApiError::Internal(e.to_string()))?;
                if let Ok(len) = HeaderValue::from_str(&clean.len().to_string()) {
                    parts.headers.insert(header::CONTENT_LENGTH, len);
                }
                clean.into()
            } else {
                bytes
            }
        }
        _ => bytes,
    };

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

fn with_query(uri: &Uri, query: &str) -> Result<Uri, ApiError> {
    let path_and_query = if query.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{}", uri.path(), query)
    };
    let mut uri_parts = uri.clone().into_parts();
    uri_parts.path_and_query = Some(
        path_and_query
            .parse::<PathAndQuery>()
            .map_err(|e| ApiError::Internal(e.to_string()))?,
    );
    Uri::from_parts(uri_parts).map_err(|e| ApiError::Internal(e.to_string()))
}
