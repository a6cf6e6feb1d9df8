use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::document::Document;
use super::error::StoreError;
use super::pipeline::Stage;
use super::schema::Schema;
use super::update::Update;
use crate::filter::{Filter, QueryDescriptor};

/// Capability set a store must offer for the handler factory to serve it.
///
/// Identifiers arrive as raw path text; a store casts them itself and reports a
/// [`StoreError::Cast`] when the text is not a valid identifier.
#[async_trait]
pub trait Model: Send + Sync {
    fn schema(&self) -> &Schema;

    /// Validate and insert a new record. The store assigns the identifier.
    async fn create(&self, body: Value) -> Result<Document, StoreError>;

    /// Filter, sort, skip and limit. Projection is left to rendering.
    async fn find(&self, query: &QueryDescriptor) -> Result<Vec<Document>, StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Document>, StoreError>;

    /// Atomically apply `update` (re-validated) and return the post-update record.
    async fn find_by_id_and_update(&self, id: &str, update: &Update) -> Result<Option<Document>, StoreError>;

    async fn find_by_id_and_delete(&self, id: &str) -> Result<Option<Document>, StoreError>;

    async fn aggregate(&self, pipeline: &[Stage]) -> Result<Vec<Value>, StoreError>;

    /// Update the first record matching `criteria`. With `upsert`, insert one
    /// (seeded from the criteria, defaults applied) when nothing matches.
    async fn find_one_and_update(
        &self,
        criteria: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<Option<Document>, StoreError>;
}

pub type ModelRef = Arc<dyn Model>;
