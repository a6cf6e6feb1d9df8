pub mod error;
pub mod query;
pub mod types;

pub use error::FilterError;
pub use query::QueryTranslator;
pub use types::*;
