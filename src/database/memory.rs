use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::document::{parse_id, Document};
use super::error::StoreError;
use super::model::Model;
use super::pipeline::{self, Stage};
use super::schema::Schema;
use super::update::Update;
use crate::filter::{compare_by_keys, values_equal, Filter, QueryDescriptor};

/// In-process store. Every write holds the lock for its whole
/// check-then-mutate sequence, so updates and upserts are atomic.
pub struct MemoryModel {
    schema: Schema,
    docs: RwLock<Vec<Document>>,
}

impl MemoryModel {
    pub fn new(schema: Schema) -> Self {
        Self { schema, docs: RwLock::new(Vec::new()) }
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    fn check_unique(
        &self,
        docs: &[Document],
        candidate: &Map<String, Value>,
        except: Option<Uuid>,
    ) -> Result<(), StoreError> {
        for def in self.schema.unique_fields() {
            let Some(value) = candidate.get(def.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let taken = docs
                .iter()
                .filter(|d| Some(d.id) != except)
                .any(|d| d.fields.get(def.name).map_or(false, |v| values_equal(v, value)));
            if taken {
                return Err(StoreError::DuplicateKey { field: def.name.to_string() });
            }
        }
        Ok(())
    }

    fn apply(
        &self,
        docs: &mut [Document],
        idx: usize,
        set: &Map<String, Value>,
    ) -> Result<Document, StoreError> {
        let mut merged = docs[idx].fields.clone();
        merged.extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.check_unique(docs, &merged, Some(docs[idx].id))?;
        docs[idx].apply_set(set);
        Ok(docs[idx].clone())
    }
}

#[async_trait]
impl Model for MemoryModel {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn create(&self, body: Value) -> Result<Document, StoreError> {
        let fields = self.schema.prepare_insert(&body)?;
        let mut docs = self.docs.write().await;
        self.check_unique(&docs, &fields, None)?;
        let doc = Document::new(fields);
        docs.push(doc.clone());
        Ok(doc)
    }

    async fn find(&self, query: &QueryDescriptor) -> Result<Vec<Document>, StoreError> {
        let filter = self.schema.cast_filter(query.filter.clone())?;
        let docs = self.docs.read().await;
        let mut rows: Vec<(Map<String, Value>, &Document)> = docs
            .iter()
            .map(|d| (d.to_map(), d))
            .filter(|(m, _)| filter.matches(m))
            .collect();
        rows.sort_by(|a, b| compare_by_keys(&query.sort, &a.0, &b.0));
        Ok(rows
            .into_iter()
            .skip(query.skip as usize)
            .take(query.limit as usize)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let id = parse_id(id)?;
        let docs = self.docs.read().await;
        Ok(docs.iter().find(|d| d.id == id).cloned())
    }

    async fn find_by_id_and_update(&self, id: &str, update: &Update) -> Result<Option<Document>, StoreError> {
        let id = parse_id(id)?;
        let set = self.schema.prepare_update(&update.set)?;
        let mut docs = self.docs.write().await;
        match docs.iter().position(|d| d.id == id) {
            Some(idx) => self.apply(&mut docs, idx, &set).map(Some),
            None => Ok(None),
        }
    }

    async fn find_by_id_and_delete(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let id = parse_id(id)?;
        let mut docs = self.docs.write().await;
        Ok(docs.iter().position(|d| d.id == id).map(|idx| docs.remove(idx)))
    }

    async fn aggregate(&self, pipeline: &[Stage]) -> Result<Vec<Value>, StoreError> {
        let docs = self.docs.read().await;
        let maps = docs.iter().map(Document::to_map).collect();
        Ok(pipeline::evaluate(pipeline, maps))
    }

    async fn find_one_and_update(
        &self,
        criteria: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<Option<Document>, StoreError> {
        let criteria = self.schema.cast_filter(criteria.clone())?;
        let set = self.schema.prepare_update(&update.set)?;
        let mut docs = self.docs.write().await;

        if let Some(idx) = docs.iter().position(|d| criteria.matches(&d.to_map())) {
            return self.apply(&mut docs, idx, &set).map(Some);
        }
        if !upsert {
            return Ok(None);
        }

        let fields = self.schema.prepare_upsert_insert(criteria.equalities(), &set)?;
        self.check_unique(&docs, &fields, None)?;
        let doc = Document::new(fields);
        docs.push(doc.clone());
        Ok(Some(doc))
    }
}
