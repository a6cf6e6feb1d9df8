use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::PgArguments;
use sqlx::query::{Query, QueryScalar};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use tracing::{debug, info};

use super::document::{parse_id, Document};
use super::error::StoreError;
use super::model::Model;
use super::pipeline::{Accumulator, GroupKey, Operand, Stage};
use super::schema::Schema;
use super::update::Update;
use crate::filter::{CompareOp, Condition, Filter, QueryDescriptor, SortDirection, SortKey};

const UNIQUE_VIOLATION: &str = "23505";
const MAX_UPSERT_ATTEMPTS: u32 = 3;

/// PostgreSQL store: one table per collection, user fields kept in a JSONB
/// `data` column and system fields in their own columns.
///
/// Reads project each row to a single JSONB document (the `doc` expression),
/// so filtering, sorting and aggregation all work against the same flat shape
/// clients see.
pub struct PgModel {
    schema: Schema,
    pool: PgPool,
    table: String,
}

impl PgModel {
    pub fn new(schema: Schema, pool: PgPool) -> Result<Self, StoreError> {
        let collection = schema.collection();
        if !is_valid_collection(collection) {
            return Err(StoreError::InvalidCollection(collection.to_string()));
        }
        let table = quote_identifier(collection);
        Ok(Self { schema, pool, table })
    }

    /// Create the backing table and its indexes when missing.
    pub async fn sync_schema(&self) -> Result<(), StoreError> {
        let collection = self.schema.collection();
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id UUID PRIMARY KEY, \
             data JSONB NOT NULL DEFAULT '{{}}'::jsonb, \
             version BIGINT NOT NULL DEFAULT 0, \
             created_at TIMESTAMPTZ NOT NULL, \
             updated_at TIMESTAMPTZ NOT NULL)",
            self.table
        ))
        .execute(&self.pool)
        .await?;

        for def in self.schema.unique_fields() {
            sqlx::query(&format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ((data ->> {}))",
                quote_identifier(&unique_index_name(collection, def.name)),
                self.table,
                quote_literal(def.name)
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (created_at)",
            quote_identifier(&format!("{}_created_at_idx", collection)),
            self.table
        ))
        .execute(&self.pool)
        .await?;

        info!("Synchronized table {} for model {}", collection, self.schema.model_name());
        Ok(())
    }

    async fn fetch_docs(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Document>, StoreError> {
        self.fetch_values(sql, params)
            .await?
            .into_iter()
            .map(Document::from_value)
            .collect()
    }

    async fn fetch_values(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Value>, StoreError> {
        debug!("SQL: {} params={:?}", sql, params);
        let rows = json_query(sql, params)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.map_db_error(e))?;
        Ok(rows.into_iter().map(|Json(v)| v).collect())
    }

    async fn insert(&self, doc: &Document) -> Result<(), StoreError> {
        let sql = insert_sql(&self.table);
        insert_query(&sql, doc)
            .execute(&self.pool)
            .await
            .map_err(|e| self.map_db_error(e))?;
        Ok(())
    }

    async fn update_first(
        &self,
        criteria: &Filter,
        set: &Map<String, Value>,
    ) -> Result<Option<Document>, StoreError> {
        let (sql, params) = render_update_first(&self.table, criteria, set);
        Ok(self.fetch_docs(&sql, params).await?.into_iter().next())
    }

    /// Insert side of an upsert. Upserts on the same collection and criteria
    /// hold one advisory lock for the transaction, so the re-check and the
    /// insert cannot interleave even when no unique index covers the criteria.
    async fn upsert_locked(
        &self,
        criteria: &Filter,
        set: &Map<String, Value>,
    ) -> Result<Document, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(UPSERT_LOCK_SQL)
            .bind(upsert_lock_key(self.schema.collection(), criteria))
            .execute(&mut *tx)
            .await?;

        let (sql, params) = render_update_first(&self.table, criteria, set);
        debug!("SQL: {} params={:?}", sql, params);
        let updated = json_query(&sql, params)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| self.map_db_error(e))?;

        let doc = match updated {
            Some(Json(v)) => Document::from_value(v)?,
            None => {
                let fields = self.schema.prepare_upsert_insert(criteria.equalities(), set)?;
                let doc = Document::new(fields);
                let sql = insert_sql(&self.table);
                insert_query(&sql, &doc)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| self.map_db_error(e))?;
                doc
            }
        };
        tx.commit().await?;
        Ok(doc)
    }

    /// Unique violations name their index `<collection>_<field>_key`.
    fn map_db_error(&self, err: sqlx::Error) -> StoreError {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
                let field = db
                    .constraint()
                    .and_then(|c| field_from_constraint(self.schema.collection(), c))
                    .unwrap_or("key")
                    .to_string();
                return StoreError::DuplicateKey { field };
            }
        }
        StoreError::Sqlx(err)
    }
}

#[async_trait]
impl Model for PgModel {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn create(&self, body: Value) -> Result<Document, StoreError> {
        let fields = self.schema.prepare_insert(&body)?;
        let doc = Document::new(fields);
        self.insert(&doc).await?;
        Ok(doc)
    }

    async fn find(&self, query: &QueryDescriptor) -> Result<Vec<Document>, StoreError> {
        let filter = self.schema.cast_filter(query.filter.clone())?;
        let (sql, params) = render_find(&self.table, &filter, &query.sort, query.skip, query.limit);
        self.fetch_docs(&sql, params).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let id = parse_id(id)?;
        let sql = format!("SELECT {} FROM {} WHERE id = $1", DOC, self.table);
        let row = sqlx::query_scalar::<_, Json<Value>>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|Json(v)| Document::from_value(v)).transpose()
    }

    async fn find_by_id_and_update(&self, id: &str, update: &Update) -> Result<Option<Document>, StoreError> {
        let id = parse_id(id)?;
        let set = self.schema.prepare_update(&update.set)?;
        let sql = format!(
            "UPDATE {} SET data = data || $2, updated_at = {} WHERE id = $1 RETURNING {}",
            self.table, NOW_MS, DOC
        );
        let row = sqlx::query_scalar::<_, Json<Value>>(&sql)
            .bind(id)
            .bind(Json(Value::Object(set)))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.map_db_error(e))?;
        row.map(|Json(v)| Document::from_value(v)).transpose()
    }

    async fn find_by_id_and_delete(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let id = parse_id(id)?;
        let sql = format!("DELETE FROM {} WHERE id = $1 RETURNING {}", self.table, DOC);
        let row = sqlx::query_scalar::<_, Json<Value>>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|Json(v)| Document::from_value(v)).transpose()
    }

    async fn aggregate(&self, pipeline: &[Stage]) -> Result<Vec<Value>, StoreError> {
        let (sql, params) = render_pipeline(&self.table, pipeline);
        self.fetch_values(&sql, params).await
    }

    async fn find_one_and_update(
        &self,
        criteria: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<Option<Document>, StoreError> {
        let criteria = self.schema.cast_filter(criteria.clone())?;
        let set = self.schema.prepare_update(&update.set)?;

        if let Some(doc) = self.update_first(&criteria, &set).await? {
            return Ok(Some(doc));
        }
        if !upsert {
            return Ok(None);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.upsert_locked(&criteria, &set).await {
                Ok(doc) => return Ok(Some(doc)),
                // A plain create took the unique value meanwhile; its row now matches.
                Err(StoreError::DuplicateKey { .. }) if attempt < MAX_UPSERT_ATTEMPTS => {
                    debug!("Upsert on {} lost an insert race, retrying", self.schema.collection());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Row projected to the flat client document.
const DOC: &str = "(data || jsonb_build_object(\
    '_id', id, \
    'createdAt', to_char(created_at AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS.MS\"Z\"'), \
    'updatedAt', to_char(updated_at AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS.MS\"Z\"'), \
    '__v', version))";

const NOW_MS: &str = "date_trunc('milliseconds', now())";

const UPSERT_LOCK_SQL: &str = "SELECT pg_advisory_xact_lock(hashtext($1))";

/// Largest row count or offset Postgres accepts as a `bigint` literal.
const MAX_ROWS: u64 = i64::MAX as u64;

fn json_query<'q>(sql: &'q str, params: Vec<Value>) -> QueryScalar<'q, Postgres, Json<Value>, PgArguments> {
    params
        .into_iter()
        .fold(sqlx::query_scalar::<_, Json<Value>>(sql), |q, p| q.bind(Json(p)))
}

fn insert_sql(table: &str) -> String {
    format!("INSERT INTO {table} (id, data, version, created_at, updated_at) VALUES ($1, $2, $3, $4, $5)")
}

fn insert_query<'q>(sql: &'q str, doc: &Document) -> Query<'q, Postgres, PgArguments> {
    sqlx::query(sql)
        .bind(doc.id)
        .bind(Json(Value::Object(doc.fields.clone())))
        .bind(doc.version)
        .bind(doc.created_at)
        .bind(doc.updated_at)
}

/// Same collection and same equality criteria give the same key.
fn upsert_lock_key(collection: &str, criteria: &Filter) -> String {
    format!("{}:{}", collection, Value::Object(criteria.equalities()))
}

/// Accumulates positional parameters while SQL text is rendered.
#[derive(Default)]
struct SqlWriter {
    params: Vec<Value>,
}

impl SqlWriter {
    fn param(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("${}::jsonb", self.params.len())
    }

    fn where_clause(&mut self, filter: &Filter) -> String {
        let mut parts = Vec::new();
        for (field, conditions) in filter.clauses() {
            for condition in conditions {
                parts.push(self.condition(field, condition));
            }
        }
        if parts.is_empty() {
            "1=1".to_string()
        } else {
            parts.join(" AND ")
        }
    }

    fn condition(&mut self, field: &str, condition: &Condition) -> String {
        let path = field_path(field);
        match condition {
            Condition::Equals(Value::Null) => {
                format!("({path} IS NULL OR {path} = 'null'::jsonb)")
            }
            Condition::Equals(value) => format!("{path} = {}", self.param(value.clone())),
            Condition::AnyOf(values) if values.is_empty() => "1=0".to_string(),
            Condition::AnyOf(values) => {
                let list: Vec<String> = values.iter().map(|v| self.param(v.clone())).collect();
                format!("{path} IN ({})", list.join(", "))
            }
            Condition::Compare(op, value) => self.compare(&path, *op, value),
        }
    }

    /// Range operators only hold between values of the same JSON type.
    fn compare(&mut self, path: &str, op: CompareOp, value: &Value) -> String {
        let p = self.param(value.clone());
        format!("(jsonb_typeof({path}) = jsonb_typeof({p}) AND {path} {} {p})", op.to_sql())
    }
}

fn render_find(table: &str, filter: &Filter, sort: &[SortKey], skip: u64, limit: u64) -> (String, Vec<Value>) {
    let mut w = SqlWriter::default();
    let cond = w.where_clause(filter);
    let (skip, limit) = (skip.min(MAX_ROWS), limit.min(MAX_ROWS));
    let sql = format!(
        "SELECT doc FROM (SELECT {DOC} AS doc FROM {table}) AS t WHERE {cond}{} LIMIT {limit} OFFSET {skip}",
        order_by(sort)
    );
    (sql, w.params)
}

fn render_update_first(table: &str, criteria: &Filter, set: &Map<String, Value>) -> (String, Vec<Value>) {
    let mut w = SqlWriter::default();
    let set_param = w.param(Value::Object(set.clone()));
    let cond = w.where_clause(criteria);
    let sql = format!(
        "UPDATE {table} SET data = data || {set_param}, updated_at = {NOW_MS} \
         WHERE id = (SELECT id FROM (SELECT id, {DOC} AS doc FROM {table}) AS t WHERE {cond} \
         ORDER BY doc -> 'createdAt' ASC LIMIT 1) RETURNING {DOC}"
    );
    (sql, w.params)
}

/// Each stage wraps the previous one as a derived table with a `doc` column.
/// Ordering is carried forward and re-applied because a subquery's ORDER BY
/// does not bind the query around it.
fn render_pipeline(table: &str, pipeline: &[Stage]) -> (String, Vec<Value>) {
    let mut w = SqlWriter::default();
    let mut current = format!("SELECT {DOC} AS doc FROM {table}");
    let mut order = String::new();

    for (depth, stage) in pipeline.iter().enumerate() {
        let alias = format!("s{}", depth);
        current = match stage {
            Stage::Match(filter) => {
                let cond = w.where_clause(filter);
                format!("SELECT doc FROM ({current}) AS {alias} WHERE {cond}")
            }
            Stage::Sort(keys) => {
                order = order_by(keys);
                continue;
            }
            Stage::Skip(n) => format!("SELECT doc FROM ({current}) AS {alias}{order} OFFSET {n}"),
            Stage::Limit(n) => format!("SELECT doc FROM ({current}) AS {alias}{order} LIMIT {n}"),
            Stage::Group(group) => {
                order.clear();
                let mut pairs = vec![format!("'_id', {}", group_key(&group.key))];
                for (name, accumulator) in &group.accumulators {
                    pairs.push(format!("{}, {}", quote_literal(name), accumulator_sql(accumulator)));
                }
                let grouping = match &group.key {
                    GroupKey::Field(f) => format!("GROUP BY {}", field_path(f)),
                    GroupKey::All => "HAVING COUNT(*) > 0".to_string(),
                };
                format!(
                    "SELECT jsonb_build_object({}) AS doc FROM ({current}) AS {alias} {grouping}",
                    pairs.join(", ")
                )
            }
        };
    }

    (format!("SELECT doc FROM ({current}) AS result{order}"), w.params)
}

fn group_key(key: &GroupKey) -> String {
    match key {
        GroupKey::Field(f) => field_path(f),
        GroupKey::All => "NULL::jsonb".to_string(),
    }
}

fn accumulator_sql(accumulator: &Accumulator) -> String {
    let numeric = |f: &str| {
        let path = field_path(f);
        (
            format!("(doc ->> {})::numeric", quote_literal(f)),
            format!("jsonb_typeof({path}) = 'number'"),
        )
    };
    match accumulator {
        Accumulator::Count => "to_jsonb(COUNT(*))".to_string(),
        Accumulator::Sum(Operand::Const(n)) => format!("to_jsonb(COUNT(*) * {n})"),
        Accumulator::Sum(Operand::Field(f)) => {
            let (value, guard) = numeric(f);
            format!("to_jsonb(COALESCE(SUM({value}) FILTER (WHERE {guard}), 0))")
        }
        Accumulator::Avg(f) => {
            let (value, guard) = numeric(f);
            format!("to_jsonb(AVG({value}) FILTER (WHERE {guard}))")
        }
        Accumulator::Min(f) | Accumulator::Max(f) => {
            let path = field_path(f);
            let dir = if matches!(accumulator, Accumulator::Min(_)) { "ASC" } else { "DESC" };
            format!(
                "(array_agg({path} ORDER BY {path} {dir}) FILTER (WHERE {path} IS NOT NULL AND {path} <> 'null'::jsonb))[1]"
            )
        }
    }
}

fn order_by(keys: &[SortKey]) -> String {
    if keys.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = keys
        .iter()
        .map(|k| {
            let nulls = match k.direction {
                SortDirection::Asc => "NULLS FIRST",
                SortDirection::Desc => "NULLS LAST",
            };
            format!("{} {} {}", field_path(&k.field), k.direction.to_sql(), nulls)
        })
        .collect();
    format!(" ORDER BY {}", parts.join(", "))
}

fn field_path(field: &str) -> String {
    format!("(doc -> {})", quote_literal(field))
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn unique_index_name(collection: &str, field: &str) -> String {
    format!("{}_{}_key", collection, field)
}

fn field_from_constraint<'a>(collection: &str, constraint: &'a str) -> Option<&'a str> {
    constraint
        .strip_prefix(collection)?
        .strip_prefix('_')?
        .strip_suffix("_key")
        .filter(|f| !f.is_empty())
}

/// Collection names become table names: ASCII letters, digits and `_`, not
/// starting with a digit, within the Postgres identifier limit.
fn is_valid_collection(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::pipeline::Group;
    use serde_json::json;

    #[test]
    fn validates_collection_names() {
        assert!(is_valid_collection("users"));
        assert!(is_valid_collection("user_profiles2"));
        assert!(!is_valid_collection(""));
        assert!(!is_valid_collection("2users"));
        assert!(!is_valid_collection("users; DROP TABLE users"));
        assert!(!is_valid_collection("user-profiles"));
    }

    #[test]
    fn duplicate_field_comes_from_index_name() {
        assert_eq!(field_from_constraint("users", "users_email_key"), Some("email"));
        assert_eq!(field_from_constraint("users", "users_pkey"), None);
        assert_eq!(field_from_constraint("users", "orders_email_key"), None);
        assert_eq!(unique_index_name("users", "email"), "users_email_key");
    }

    #[test]
    fn find_renders_parameters_in_order() {
        let filter = Filter::new()
            .eq("role", "admin")
            .compare("age", CompareOp::Gte, 18);
        let (sql, params) = render_find("\"users\"", &filter, &[SortKey::desc("createdAt")], 20, 10);
        assert!(sql.contains("(jsonb_typeof((doc -> 'age')) = jsonb_typeof($1::jsonb) AND (doc -> 'age') >= $1::jsonb)"));
        assert!(sql.contains("(doc -> 'role') = $2::jsonb"));
        assert!(sql.ends_with("ORDER BY (doc -> 'createdAt') DESC NULLS LAST LIMIT 10 OFFSET 20"));
        assert_eq!(params, vec![json!(18), json!("admin")]);
    }

    #[test]
    fn huge_pages_stay_within_bigint() {
        let (sql, _) = render_find("\"users\"", &Filter::new(), &[], u64::MAX, u64::MAX);
        assert!(sql.ends_with(&format!("LIMIT {} OFFSET {}", i64::MAX, i64::MAX)));
    }

    #[test]
    fn upsert_lock_key_follows_criteria() {
        let admin = Filter::new().eq("email", "a@example.com");
        assert_eq!(upsert_lock_key("users", &admin), upsert_lock_key("users", &admin.clone()));
        assert_ne!(
            upsert_lock_key("users", &admin),
            upsert_lock_key("users", &Filter::new().eq("email", "b@example.com"))
        );
        assert_ne!(upsert_lock_key("users", &admin), upsert_lock_key("teams", &admin));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let (sql, params) = render_find("\"users\"", &Filter::new(), &[], 0, 10);
        assert!(sql.contains("WHERE 1=1 LIMIT 10 OFFSET 0"));
        assert!(params.is_empty());
    }

    #[test]
    fn any_of_and_null_equality() {
        let mut filter = Filter::new();
        filter.push("role", Condition::AnyOf(vec![json!("admin"), json!("user")]));
        filter.push("deleted", Condition::Equals(Value::Null));
        let mut w = SqlWriter::default();
        let sql = w.where_clause(&filter);
        assert_eq!(
            sql,
            "((doc -> 'deleted') IS NULL OR (doc -> 'deleted') = 'null'::jsonb) AND (doc -> 'role') IN ($1::jsonb, $2::jsonb)"
        );
    }

    #[test]
    fn field_names_are_quoted_as_literals() {
        assert_eq!(field_path("o'brien"), "(doc -> 'o''brien')");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn update_first_binds_set_before_criteria() {
        let mut set = Map::new();
        set.insert("role".into(), json!("admin"));
        let criteria = Filter::new().eq("email", "a@example.com");
        let (sql, params) = render_update_first("\"users\"", &criteria, &set);
        assert!(sql.starts_with("UPDATE \"users\" SET data = data || $1::jsonb"));
        assert!(sql.contains("(doc -> 'email') = $2::jsonb"));
        assert!(sql.contains("LIMIT 1) RETURNING"));
        assert_eq!(params, vec![json!({"role": "admin"}), json!("a@example.com")]);
    }

    #[test]
    fn pipeline_nests_stages() {
        let pipeline = vec![
            Stage::Match(Filter::new().eq("active", true)),
            Group::by("role").with("total", Accumulator::Sum(Operand::Const(1))).into(),
            Stage::Sort(vec![SortKey::desc("total")]),
            Stage::Limit(5),
        ];
        let (sql, params) = render_pipeline("\"users\"", &pipeline);
        assert!(sql.contains("WHERE (doc -> 'active') = $1::jsonb"));
        assert!(sql.contains("jsonb_build_object('_id', (doc -> 'role'), 'total', to_jsonb(COUNT(*) * 1))"));
        assert!(sql.contains("GROUP BY (doc -> 'role')"));
        assert!(sql.contains("AS s3 ORDER BY (doc -> 'total') DESC NULLS LAST LIMIT 5"));
        assert!(sql.ends_with("AS result ORDER BY (doc -> 'total') DESC NULLS LAST"));
        assert_eq!(params, vec![json!(true)]);
    }

    #[test]
    fn group_resets_ordering() {
        let pipeline = vec![
            Stage::Sort(vec![SortKey::asc("name")]),
            Group::all().with("n", Accumulator::Count).into(),
        ];
        let (sql, _) = render_pipeline("\"users\"", &pipeline);
        assert!(sql.contains("HAVING COUNT(*) > 0"));
        assert!(sql.ends_with("AS result"));
    }

    #[test]
    fn numeric_accumulators_skip_non_numbers() {
        let sql = accumulator_sql(&Accumulator::Avg("age".into()));
        assert_eq!(
            sql,
            "to_jsonb(AVG((doc ->> 'age')::numeric) FILTER (WHERE jsonb_typeof((doc -> 'age')) = 'number'))"
        );
    }
}
