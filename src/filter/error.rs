use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("Malformed query key: {0}")]
    MalformedKey(String),

    #[error("Unsupported operator '{operator}' on field '{field}'")]
    UnsupportedOperator { field: String, operator: String },

    #[error("Invalid field name: {0}")]
    InvalidField(String),

    #[error("Projection cannot have a mix of inclusion and exclusion")]
    MixedProjection,
}
