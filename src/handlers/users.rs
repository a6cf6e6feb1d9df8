//! User controller: the factory handlers bound to the User model, plus the
//! request checks each route runs first.

use crate::database::{Accumulator, Group, ModelRef, Operand, Stage, Update};
use crate::filter::Filter;
use crate::middleware::{Check, Rule, Validator};

use super::factory::{self, HandlerFuture, JsonBody};
use axum::extract::{Path, RawQuery};

pub const PROMOTED_EMAIL: &str = "usertobemadeadmin@example.com";

pub fn create_user(model: ModelRef) -> impl Fn(JsonBody) -> HandlerFuture + Clone + Send + Sync + 'static {
    factory::create_one(model)
}

pub fn get_user(model: ModelRef) -> impl Fn(Path<String>) -> HandlerFuture + Clone + Send + Sync + 'static {
    factory::get_one(model, Vec::new())
}

pub fn update_user(model: ModelRef) -> impl Fn(Path<String>, JsonBody) -> HandlerFuture + Clone + Send + Sync + 'static {
    factory::update_one(model)
}

pub fn delete_user(model: ModelRef) -> impl Fn(Path<String>) -> HandlerFuture + Clone + Send + Sync + 'static {
    factory::delete_one(model)
}

pub fn get_all_users(model: ModelRef) -> impl Fn(RawQuery) -> HandlerFuture + Clone + Send + Sync + 'static {
    factory::get_all(model)
}

/// Active users counted per role.
pub fn get_user_details(model: ModelRef) -> impl Fn() -> HandlerFuture + Clone + Send + Sync + 'static {
    factory::get_all_agg(model, user_details_pipeline())
}

/// Promotes a fixed address to admin, creating the account when absent.
pub fn update_user_settings(model: ModelRef) -> impl Fn() -> HandlerFuture + Clone + Send + Sync + 'static {
    factory::singular_create_and_update(
        model,
        Filter::new().eq("email", PROMOTED_EMAIL),
        Update::new().set("role", "admin").set("name", "default name"),
    )
}

pub fn user_details_pipeline() -> Vec<Stage> {
    vec![
        Stage::Match(Filter::new().eq("active", true)),
        Group::by("role")
            .with("total", Accumulator::Sum(Operand::Const(1)))
            .into(),
    ]
}

pub fn create_rules() -> Validator {
    Validator::new()
        .check(Check::body("name", Rule::NotEmpty, "Name is required"))
        .check(Check::body("email", Rule::Email, "Please include a valid email"))
        .check(Check::body("password", Rule::MinLength(6), "Password must be at least 6 characters long"))
}

pub fn id_rules() -> Validator {
    Validator::new().check(Check::param("id", Rule::Uuid, "Invalid ID"))
}

pub fn update_rules() -> Validator {
    Validator::new()
        .check(Check::param("id", Rule::Uuid, "Invalid ID"))
        .check(Check::body("name", Rule::NotEmpty, "Name cannot be empty").optional())
        .check(Check::body("email", Rule::Email, "Please include a valid email").optional())
        .check(Check::body("password", Rule::MinLength(6), "Password must be at least 6 characters long").optional())
}

pub fn update_role_rules() -> Validator {
    Validator::new()
        .check(Check::body("email", Rule::Email, "Email is required"))
        .check(Check::body("role", Rule::NotEmpty, "Role is required"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{MemoryModel, Model};
    use crate::models::user;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn user_details_counts_active_users_by_role() {
        let model = MemoryModel::new(user::schema());
        for (email, role, active) in [
            ("a@example.com", "admin", true),
            ("b@example.com", "user", true),
            ("c@example.com", "user", true),
            ("d@example.com", "user", false),
        ] {
            model
                .create(json!({"name": "x", "email": email, "password": "secret1", "role": role, "active": active}))
                .await
                .unwrap();
        }
        let handler = get_user_details(Arc::new(model));
        let res = handler().await.unwrap();
        assert_eq!(res.results, Some(2));
        let mut rows = res.data.as_array().unwrap().clone();
        rows.sort_by_key(|r| r["_id"].as_str().unwrap_or_default().to_string());
        assert_eq!(rows, vec![json!({"_id": "admin", "total": 1}), json!({"_id": "user", "total": 2})]);
    }

    #[tokio::test]
    async fn update_user_settings_promotes_fixed_address() {
        let model = Arc::new(MemoryModel::new(user::schema()));
        let handler = update_user_settings(model.clone());
        let first = handler().await.unwrap();
        let second = handler().await.unwrap();
        assert_eq!(first.data["_id"], second.data["_id"]);
        assert_eq!(second.data["email"], json!(PROMOTED_EMAIL));
        assert_eq!(second.data["role"], json!("admin"));
        assert_eq!(second.data["name"], json!("default name"));
        assert_eq!(model.len().await, 1);
    }

    #[test]
    fn short_password_is_rejected_with_a_length_message() {
        let body = json!({"name": "A", "email": "a@example.com", "password": "123"});
        let errors = create_rules().run(body.as_object().unwrap(), &HashMap::new());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].msg, "Password must be at least 6 characters long");
    }

    #[test]
    fn update_rules_allow_partial_bodies() {
        let mut params = HashMap::new();
        params.insert("id".to_string(), uuid::Uuid::new_v4().to_string());
        let body = json!({"name": "Updated Name"});
        assert!(update_rules().run(body.as_object().unwrap(), &params).is_empty());
    }
}
