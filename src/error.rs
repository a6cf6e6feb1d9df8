// HTTP API Error Types
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::database::StoreError;
use crate::filter::FilterError;

const GENERIC_MESSAGE: &str = "Something went wrong";

/// Deliberately raised, client-facing failure. Always operational.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AppError {
    pub message: String,
    pub status_code: u16,
}

impl AppError {
    pub fn new(message: impl Into<String>, status_code: u16) -> Self {
        Self { message: message.into(), status_code }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(message, 404)
    }

    /// "fail" for client errors, "error" for everything else.
    pub fn status(&self) -> &'static str {
        status_label(self.status_code)
    }

    pub fn is_operational(&self) -> bool {
        true
    }
}

/// One failed request check, shaped like the entries of a validation error list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldViolation {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub msg: String,
    pub path: String,
    pub location: &'static str,
}

impl FieldViolation {
    pub fn new(path: impl Into<String>, location: &'static str, value: Option<Value>, msg: impl Into<String>) -> Self {
        Self {
            kind: "field",
            value,
            msg: msg.into(),
            path: path.into(),
            location,
        }
    }
}

/// Terminal error type: every handler failure ends up here and is rendered once.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    App(#[from] AppError),

    #[error("Validation failed")]
    Validation(Vec<FieldViolation>),

    #[error(transparent)]
    Query(#[from] FilterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    BadBody(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::App(e) => e.status_code,
            ApiError::Validation(_) | ApiError::Query(_) | ApiError::BadBody(_) => 400,
            ApiError::Store(e) => e.status_code().unwrap_or(500),
            ApiError::Internal(_) => 500,
        }
    }

    /// Operational errors are reported verbatim; the rest are masked.
    pub fn is_operational(&self) -> bool {
        match self {
            ApiError::App(e) => e.is_operational(),
            ApiError::Validation(_) | ApiError::Query(_) | ApiError::BadBody(_) => true,
            ApiError::Store(e) => e.status_code().is_some(),
            ApiError::Internal(_) => false,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ApiError::Validation(errors) => json!({
                "status": "fail",
                "errors": errors,
            }),
            _ => {
                let message = if self.is_operational() {
                    self.to_string()
                } else {
                    GENERIC_MESSAGE.to_string()
                };
                json!({
                    "status": status_label(self.status_code()),
                    "message": message,
                })
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let status = rejection.status();
        if status == StatusCode::BAD_REQUEST {
            ApiError::BadBody(rejection.body_text())
        } else {
            ApiError::App(AppError::new(rejection.body_text(), status.as_u16()))
        }
    }
}

// Automatic HTTP response conversion for Axum
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if !self.is_operational() {
            tracing::error!("Unhandled error: {}", self);
        }
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_json())).into_response()
    }
}

fn status_label(code: u16) -> &'static str {
    if (400..500).contains(&code) {
        "fail"
    } else {
        "error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn app_error_classifies_status() {
        let e = AppError::not_found("Document not found");
        assert_eq!(e.status_code, 404);
        assert_eq!(e.status(), "fail");
        assert!(e.is_operational());
        assert_eq!(AppError::new("boom", 500).status(), "error");
        assert_eq!(AppError::new("teapot", 499).status(), "fail");
        assert_eq!(AppError::new("odd", 399).status(), "error");
    }

    #[test]
    fn operational_errors_keep_their_message() {
        let body = ApiError::from(AppError::not_found("Document not found")).to_json();
        assert_eq!(body, json!({"status": "fail", "message": "Document not found"}));
    }

    #[test]
    fn internal_faults_are_masked() {
        let err = ApiError::Internal("connection reset by peer".into());
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.to_json(), json!({"status": "error", "message": "Something went wrong"}));

        let err = ApiError::from(StoreError::Sqlx(sqlx::Error::PoolTimedOut));
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.to_json()["message"], json!("Something went wrong"));
    }

    #[test]
    fn store_errors_with_a_status_are_reported() {
        let err = ApiError::from(StoreError::DuplicateKey { field: "email".into() });
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.to_json()["status"], json!("fail"));

        let mut errors = BTreeMap::new();
        errors.insert("role".to_string(), "`x` is not a valid enum value for path `role`.".to_string());
        let err = ApiError::from(StoreError::Validation { model: "User".into(), errors });
        assert_eq!(err.status_code(), 400);
        assert_eq!(
            err.to_json()["message"],
            json!("User validation failed: role: `x` is not a valid enum value for path `role`.")
        );
    }

    #[test]
    fn validation_lists_every_violation() {
        let err = ApiError::Validation(vec![
            FieldViolation::new("email", "body", Some(json!("nope")), "Please include a valid email"),
            FieldViolation::new("name", "body", None, "Name is required"),
        ]);
        assert_eq!(
            err.to_json(),
            json!({
                "status": "fail",
                "errors": [
                    {"type": "field", "value": "nope", "msg": "Please include a valid email", "path": "email", "location": "body"},
                    {"type": "field", "msg": "Name is required", "path": "name", "location": "body"},
                ]
            })
        );
    }

    #[test]
    fn query_errors_are_bad_requests() {
        let err = ApiError::from(FilterError::MixedProjection);
        assert_eq!(err.status_code(), 400);
        assert!(err.is_operational());
    }
}
