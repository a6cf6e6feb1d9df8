use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{Path, Request, State},
    http::header::CONTENT_TYPE,
    middleware::Next,
    response::Response,
};
use serde_json::{Map, Value};

use crate::error::{ApiError, FieldViolation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Body,
    Params,
}

impl Location {
    fn as_str(&self) -> &'static str {
        match self {
            Location::Body => "body",
            Location::Params => "params",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    NotEmpty,
    Email,
    MinLength(usize),
    /// Parseable record identifier.
    Uuid,
}

/// A single field check. Fails with `message`; with `optional` a missing field passes.
#[derive(Debug, Clone)]
pub struct Check {
    field: &'static str,
    location: Location,
    rule: Rule,
    message: &'static str,
    optional: bool,
}

impl Check {
    pub fn body(field: &'static str, rule: Rule, message: &'static str) -> Self {
        Self { field, location: Location::Body, rule, message, optional: false }
    }

    pub fn param(field: &'static str, rule: Rule, message: &'static str) -> Self {
        Self { field, location: Location::Params, rule, message, optional: false }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    fn run(&self, value: Option<&Value>) -> Option<FieldViolation> {
        if self.optional && value.is_none() {
            return None;
        }
        if self.passes(value) {
            return None;
        }
        Some(FieldViolation::new(
            self.field,
            self.location.as_str(),
            value.cloned(),
            self.message,
        ))
    }

    fn passes(&self, value: Option<&Value>) -> bool {
        let text = value.and_then(as_text);
        match &self.rule {
            Rule::NotEmpty => text.map_or(false, |s| !s.is_empty()),
            Rule::Email => matches!(value, Some(Value::String(s)) if is_email(s)),
            Rule::MinLength(min) => text.unwrap_or_default().chars().count() >= *min,
            Rule::Uuid => text.map_or(false, |s| uuid::Uuid::parse_str(&s).is_ok()),
        }
    }
}

/// Ordered list of checks run before a route's handler.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    checks: Vec<Check>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    fn needs_body(&self) -> bool {
        self.checks.iter().any(|c| c.location == Location::Body)
    }

    /// Every violation, in check order.
    pub fn run(&self, body: &Map<String, Value>, params: &HashMap<String, String>) -> Vec<FieldViolation> {
        self.checks
            .iter()
            .filter_map(|check| {
                let value = match check.location {
                    Location::Body => body.get(check.field).cloned(),
                    Location::Params => params.get(check.field).cloned().map(Value::String),
                };
                check.run(value.as_ref())
            })
            .collect()
    }
}

/// Route middleware: rejects with 400 and the full violation list, otherwise
/// hands the untouched request on.
pub async fn validate_request(
    State(validator): State<Arc<Validator>>,
    params: Option<Path<HashMap<String, String>>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let params = params.map(|Path(p)| p).unwrap_or_default();

    let (request, body) = if validator.needs_body() {
        let (parts, raw) = request.into_parts();
        let bytes = to_bytes(raw, usize::MAX)
            .await
            .map_err(|e| ApiError::BadBody(e.to_string()))?;
        let is_json = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.starts_with("application/json"));
        // Bodies the JSON extractor would reject are left for it to report.
        let body = match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) if is_json => map,
            _ => Map::new(),
        };
        (Request::from_parts(parts, Body::from(bytes)), body)
    } else {
        (request, Map::new())
    };

    let violations = validator.run(&body, &params);
    if !violations.is_empty() {
        tracing::debug!("Request validation failed with {} violation(s)", violations.len());
        return Err(ApiError::Validation(violations));
    }
    Ok(next.run(request).await)
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Email shape: `local@domain.tld`, no whitespace, dotted domain of
/// alphanumeric/hyphen labels and an alphabetic TLD of two or more letters.
pub fn is_email(email: &str) -> bool {
    if email.len() > 254 || email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.rsplit_once('@') else {
        return false;
    };
    if local.is_empty() || local.len() > 64 || local.contains('@') {
        return false;
    }
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    let labels_ok = labels.iter().all(|l| {
        !l.is_empty()
            && !l.starts_with('-')
            && !l.ends_with('-')
            && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    let tld = labels[labels.len() - 1];
    labels_ok && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}
