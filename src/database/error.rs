use std::collections::BTreeMap;

use thiserror::Error;

/// Errors raised by a [`Model`](super::model::Model) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{model} validation failed: {}", join_errors(.errors))]
    Validation {
        model: String,
        errors: BTreeMap<String, String>,
    },

    #[error("Cast to {kind} failed for value \"{value}\" at path \"{path}\"")]
    Cast {
        kind: &'static str,
        value: String,
        path: String,
    },

    #[error("Duplicate key: a record with this {field} already exists")]
    DuplicateKey { field: String },

    #[error("Missing configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("Invalid database URL")]
    InvalidDatabaseUrl,

    #[error("Invalid collection name: {0}")]
    InvalidCollection(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl StoreError {
    /// HTTP status the store attaches to this failure, if any. Unmarked errors are
    /// internal faults.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            StoreError::Validation { .. } | StoreError::Cast { .. } => Some(400),
            StoreError::DuplicateKey { .. } => Some(409),
            _ => None,
        }
    }
}

fn join_errors(errors: &BTreeMap<String, String>) -> String {
    errors
        .iter()
        .map(|(path, msg)| format!("{}: {}", path, msg))
        .collect::<Vec<_>>()
        .join(", ")
}
