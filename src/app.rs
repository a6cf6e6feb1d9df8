use std::any::Any;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, OriginalUri},
    http::HeaderValue,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{self, CorsLayer},
    trace::TraceLayer,
};

use crate::config::AppConfig;
use crate::database::document::{format_timestamp, now};
use crate::database::ModelRef;
use crate::error::{ApiError, AppError};
use crate::handlers::users;
use crate::middleware::{apply_security_headers, sanitize_request, validate_request, RateLimit};

/// Full application: user routes, service routes and the global middleware stack.
pub fn app(model: ModelRef, config: &AppConfig) -> Router {
    let mut app = Router::new()
        // Public
        .route("/", get(root))
        .route("/health", get(health))
        .merge(user_routes(model))
        .fallback(not_found);

    // Global middleware, innermost first
    let max_body = config.api.max_request_size_bytes;
    app = app
        .layer(DefaultBodyLimit::max(max_body))
        .layer(from_fn_with_state(max_body, sanitize_request));

    if config.api.enable_rate_limiting {
        app = app.layer(from_fn_with_state(RateLimit::from_config(&config.api), RateLimit::middleware));
    }

    app = apply_security_headers(app, &config.security);

    if config.security.enable_cors {
        app = app.layer(cors_layer(&config.security.cors_origins));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
}

fn user_routes(model: ModelRef) -> Router {
    Router::new()
        // Static segments win over `:id`
        .route("/api/users/userDetails", get(users::get_user_details(model.clone())))
        .route(
            "/api/users/update-role",
            patch(users::update_user_settings(model.clone()))
                .route_layer(from_fn_with_state(Arc::new(users::update_role_rules()), validate_request)),
        )
        .route(
            "/api/users",
            post(users::create_user(model.clone()))
                .route_layer(from_fn_with_state(Arc::new(users::create_rules()), validate_request))
                .get(users::get_all_users(model.clone())),
        )
        .route(
            "/api/users/:id",
            get(users::get_user(model.clone()))
                .route_layer(from_fn_with_state(Arc::new(users::id_rules()), validate_request))
                .merge(
                    patch(users::update_user(model.clone()))
                        .route_layer(from_fn_with_state(Arc::new(users::update_rules()), validate_request)),
                )
                .merge(
                    delete(users::delete_user(model))
                        .route_layer(from_fn_with_state(Arc::new(users::id_rules()), validate_request)),
                ),
        )
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();
    CorsLayer::new().allow_origin(origins).allow_methods(cors::Any).allow_headers(cors::Any)
}

fn handle_panic(_: Box<dyn Any + Send + 'static>) -> Response {
    ApiError::Internal("handler panicked".to_string()).into_response()
}

async fn root() -> &'static str {
    "Welcome to the API"
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "success",
        "data": {
            "status": "ok",
            "timestamp": format_timestamp(&now()),
        }
    }))
}

async fn not_found(OriginalUri(uri): OriginalUri) -> ApiError {
    let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or_else(|| uri.path());
    AppError::not_found(format!("Cannot find {} on this server", target)).into()
}
