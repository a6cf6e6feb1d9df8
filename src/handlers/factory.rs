//! Generic handler factory.
//!
//! Each function takes a model handle (plus fixed configuration for the
//! aggregation and upsert variants) and returns a ready-to-route axum handler.
//! Handlers never swallow store errors: everything except the synthesized
//! not-found case is returned unchanged for the terminal error conversion.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, RawQuery},
    Json,
};
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::config;
use crate::database::{Document, ModelRef, Stage, StoreError, Update};
use crate::error::{ApiError, AppError};
use crate::filter::{Filter, Projection, QueryTranslator};
use crate::middleware::{ApiResponse, ApiResult};

pub const NOT_FOUND_MESSAGE: &str = "Document not found";

pub type HandlerResult = ApiResult<Value>;
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;
pub type JsonBody = Result<Json<Value>, JsonRejection>;

/// Replace the identifier stored at `path` with the record it points to.
#[derive(Clone)]
pub struct Populate {
    pub path: String,
    pub model: ModelRef,
}

impl Populate {
    pub fn new(path: impl Into<String>, model: ModelRef) -> Self {
        Self { path: path.into(), model }
    }
}

/// POST: insert the body, 201 with the stored record.
pub fn create_one(model: ModelRef) -> impl Fn(JsonBody) -> HandlerFuture + Clone + Send + Sync + 'static {
    move |body: JsonBody| {
        let model = model.clone();
        async move {
            let body = read_body(body)?;
            let doc = model.create(body).await?;
            Ok(ApiResponse::created(render(&model, &doc)))
        }
        .boxed()
    }
}

/// GET by id, resolving any populate paths.
pub fn get_one(
    model: ModelRef,
    populate: Vec<Populate>,
) -> impl Fn(Path<String>) -> HandlerFuture + Clone + Send + Sync + 'static {
    let populate: Arc<[Populate]> = populate.into();
    move |Path(id): Path<String>| {
        let model = model.clone();
        let populate = populate.clone();
        async move {
            let doc = model.find_by_id(&id).await?.ok_or_else(not_found)?;
            let mut data = render(&model, &doc);
            for p in populate.iter() {
                resolve(&mut data, p).await?;
            }
            Ok(ApiResponse::success(data))
        }
        .boxed()
    }
}

/// PATCH by id: validated partial update, returns the post-update record.
pub fn update_one(model: ModelRef) -> impl Fn(Path<String>, JsonBody) -> HandlerFuture + Clone + Send + Sync + 'static {
    move |Path(id): Path<String>, body: JsonBody| {
        let model = model.clone();
        async move {
            let update = Update::from_body(read_body(body)?)?;
            let doc = model
                .find_by_id_and_update(&id, &update)
                .await?
                .ok_or_else(not_found)?;
            Ok(ApiResponse::success(render(&model, &doc)))
        }
        .boxed()
    }
}

/// DELETE by id, 204 on success.
pub fn delete_one(model: ModelRef) -> impl Fn(Path<String>) -> HandlerFuture + Clone + Send + Sync + 'static {
    move |Path(id): Path<String>| {
        let model = model.clone();
        async move {
            model.find_by_id_and_delete(&id).await?.ok_or_else(not_found)?;
            Ok(ApiResponse::no_content().map_data(|()| Value::Null))
        }
        .boxed()
    }
}

/// GET list: filter, sort, projection and pagination from the query string.
pub fn get_all(model: ModelRef) -> impl Fn(RawQuery) -> HandlerFuture + Clone + Send + Sync + 'static {
    let translator = QueryTranslator::with_max_limit(config().query.max_limit);
    move |RawQuery(raw): RawQuery| {
        let model = model.clone();
        let translator = translator.clone();
        async move {
            let query = translator.translate_str(raw.as_deref())?;
            debug!("List {} with {:?}", model.schema().collection(), query);
            let docs = model.find(&query).await?;
            let data: Vec<Value> = docs
                .iter()
                .map(|doc| model.schema().render(doc, &query.projection))
                .collect();
            Ok(ApiResponse::list(data).map_data(Value::Array))
        }
        .boxed()
    }
}

/// GET: run a fixed pipeline.
pub fn get_all_agg(model: ModelRef, pipeline: Vec<Stage>) -> impl Fn() -> HandlerFuture + Clone + Send + Sync + 'static {
    let pipeline: Arc<[Stage]> = pipeline.into();
    move || {
        let model = model.clone();
        let pipeline = pipeline.clone();
        async move {
            let rows = model.aggregate(&pipeline).await?;
            Ok(ApiResponse::list(rows).map_data(Value::Array))
        }
        .boxed()
    }
}

/// Fixed upsert: update the record matching `criteria` or insert it with
/// defaults. Idempotent for identical criteria and update.
pub fn singular_create_and_update(
    model: ModelRef,
    criteria: Filter,
    update: Update,
) -> impl Fn() -> HandlerFuture + Clone + Send + Sync + 'static {
    let fixed = Arc::new((criteria, update));
    move || {
        let model = model.clone();
        let fixed = fixed.clone();
        async move {
            let (criteria, update) = &*fixed;
            let doc = model
                .find_one_and_update(criteria, update, true)
                .await?
                .ok_or_else(not_found)?;
            Ok(ApiResponse::success(render(&model, &doc)))
        }
        .boxed()
    }
}

/// Requests without a JSON content type carry an empty object.
fn read_body(body: JsonBody) -> Result<Value, ApiError> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(Value::Object(Map::new())),
        Err(rejection) => Err(rejection.into()),
    }
}

fn not_found() -> ApiError {
    AppError::not_found(NOT_FOUND_MESSAGE).into()
}

/// Single records go out whole, minus write-only fields.
fn render(model: &ModelRef, doc: &Document) -> Value {
    model.schema().render(doc, &Projection::Exclude(Vec::new()))
}

async fn resolve(data: &mut Value, populate: &Populate) -> Result<(), ApiError> {
    let Some(id) = data.get(&populate.path).and_then(Value::as_str).map(str::to_string) else {
        return Ok(());
    };
    match populate.model.find_by_id(&id).await {
        Ok(Some(related)) => data[&populate.path] = render(&populate.model, &related),
        Ok(None) | Err(StoreError::Cast { .. }) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
