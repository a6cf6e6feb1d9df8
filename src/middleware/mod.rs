pub mod rate_limit;
pub mod response;
pub mod sanitize;
pub mod security_headers;
pub mod validate;

pub use rate_limit::RateLimit;
pub use response::{ApiResponse, ApiResult};
pub use sanitize::sanitize_request;
pub use security_headers::apply_security_headers;
pub use validate::{validate_request, Check, Rule, Validator};
