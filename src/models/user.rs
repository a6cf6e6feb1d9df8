use crate::database::{FieldDef, Schema};

pub const MODEL_NAME: &str = "User";
pub const COLLECTION: &str = "users";

pub const ROLES: &[&str] = &["admin", "user"];

/// Persisted user record. `password` is write-only and never rendered.
pub fn schema() -> Schema {
    Schema::new(MODEL_NAME, COLLECTION)
        .field(FieldDef::string("name").required().trim())
        .field(FieldDef::string("email").required().unique().trim())
        .field(FieldDef::string("role").one_of(ROLES).default_value("user"))
        .field(FieldDef::boolean("active").default_value(true))
        .field(FieldDef::string("password").required().hidden())
}
