use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};
use uuid::Uuid;

use super::document::{Document, CREATED_AT_FIELD, ID_FIELD, SYSTEM_FIELDS, UPDATED_AT_FIELD, VERSION_FIELD};
use super::error::StoreError;
use crate::filter::{Filter, Projection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Boolean,
    Number,
    /// Identifier of a record, possibly in another collection.
    Id,
}

impl FieldType {
    fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Boolean => "Boolean",
            FieldType::Number => "Number",
            FieldType::Id => "Uuid",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldType,
    pub required: bool,
    pub trim: bool,
    pub unique: bool,
    pub allowed: Option<&'static [&'static str]>,
    pub default: Option<Value>,
    /// Write-only: stored, never rendered.
    pub hidden: bool,
}

impl FieldDef {
    fn new(name: &'static str, kind: FieldType) -> Self {
        Self {
            name,
            kind,
            required: false,
            trim: false,
            unique: false,
            allowed: None,
            default: None,
            hidden: false,
        }
    }

    pub fn string(name: &'static str) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn boolean(name: &'static str) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn number(name: &'static str) -> Self {
        Self::new(name, FieldType::Number)
    }

    pub fn id(name: &'static str) -> Self {
        Self::new(name, FieldType::Id)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn trim(mut self) -> Self {
        self.trim = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn one_of(mut self, allowed: &'static [&'static str]) -> Self {
        self.allowed = Some(allowed);
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    fn cast(&self, value: Value) -> Result<Value, StoreError> {
        let cast = cast_to(self.kind, value, self.name)?;
        Ok(match cast {
            Value::String(s) if self.trim => Value::String(s.trim().to_string()),
            other => other,
        })
    }

    /// Model-level rules on an already-cast value.
    fn check(&self, value: &Value) -> Option<String> {
        let blank = match value {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            _ => false,
        };
        if blank {
            return self
                .required
                .then(|| format!("Path `{}` is required.", self.name));
        }
        if let (Some(allowed), Value::String(s)) = (self.allowed, value) {
            if !allowed.contains(&s.as_str()) {
                return Some(format!("`{}` is not a valid enum value for path `{}`.", s, self.name));
            }
        }
        None
    }
}

/// Declarative description of a model: its collection and field rules.
#[derive(Debug, Clone)]
pub struct Schema {
    model: &'static str,
    collection: &'static str,
    fields: Vec<FieldDef>,
}

impl Schema {
    pub fn new(model: &'static str, collection: &'static str) -> Self {
        Self { model, collection, fields: vec![] }
    }

    pub fn field(mut self, def: FieldDef) -> Self {
        self.fields.push(def);
        self
    }

    pub fn model_name(&self) -> &'static str {
        self.model
    }

    pub fn collection(&self) -> &'static str {
        self.collection
    }

    pub fn get(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn unique_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.unique)
    }

    pub fn hidden_fields(&self) -> Vec<&'static str> {
        self.fields.iter().filter(|f| f.hidden).map(|f| f.name).collect()
    }

    /// Build the field map for a new record: unknown and system keys are dropped,
    /// values cast and trimmed, defaults applied, then every rule checked.
    pub fn prepare_insert(&self, body: &Value) -> Result<Map<String, Value>, StoreError> {
        let input = self.expect_object(body)?;
        let mut out = Map::new();
        let mut errors = BTreeMap::new();

        for def in &self.fields {
            let value = match input.get(def.name) {
                Some(v) => match def.cast(v.clone()) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        errors.insert(def.name.to_string(), e.to_string());
                        continue;
                    }
                },
                None => def.default.clone(),
            };
            let value = value.unwrap_or(Value::Null);
            if let Some(msg) = def.check(&value) {
                errors.insert(def.name.to_string(), msg);
                continue;
            }
            if !value.is_null() {
                out.insert(def.name.to_string(), value);
            }
        }

        self.finish(out, errors)
    }

    /// Validate a partial update: only the paths being set are cast and checked.
    pub fn prepare_update(&self, set: &Map<String, Value>) -> Result<Map<String, Value>, StoreError> {
        let mut out = Map::new();
        let mut errors = BTreeMap::new();

        for (key, value) in set {
            let Some(def) = self.get(key) else {
                continue;
            };
            match def.cast(value.clone()) {
                Ok(v) => match def.check(&v) {
                    Some(msg) => {
                        errors.insert(key.clone(), msg);
                    }
                    None => {
                        out.insert(key.clone(), v);
                    }
                },
                Err(e) => {
                    errors.insert(key.clone(), e.to_string());
                }
            }
        }

        self.finish(out, errors)
    }

    /// Fields for a record inserted by an upsert: the criteria's equality terms,
    /// overlaid with the update, plus defaults for anything still absent. Only the
    /// paths supplied are validated, as for any update.
    pub fn prepare_upsert_insert(
        &self,
        seed: Map<String, Value>,
        set: &Map<String, Value>,
    ) -> Result<Map<String, Value>, StoreError> {
        let mut supplied = seed;
        supplied.retain(|k, _| !SYSTEM_FIELDS.contains(&k.as_str()));
        supplied.extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut out = self.prepare_update(&supplied)?;
        for def in &self.fields {
            if !out.contains_key(def.name) {
                if let Some(default) = &def.default {
                    out.insert(def.name.to_string(), default.clone());
                }
            }
        }
        Ok(out)
    }

    /// Cast filter values (query-string text) to the declared field types.
    pub fn cast_filter(&self, filter: Filter) -> Result<Filter, StoreError> {
        filter.try_map(|field, value| match self.kind_of(field) {
            Some(kind) => cast_to(kind, value, field),
            None => Ok(value),
        })
    }

    /// Client-facing view of a record: projection applied, hidden fields removed.
    pub fn render(&self, doc: &Document, projection: &Projection) -> Value {
        let mut map = projection.apply(doc.to_map());
        for hidden in self.fields.iter().filter(|f| f.hidden) {
            map.remove(hidden.name);
        }
        Value::Object(map)
    }

    fn kind_of(&self, field: &str) -> Option<FieldType> {
        match field {
            ID_FIELD => Some(FieldType::Id),
            CREATED_AT_FIELD | UPDATED_AT_FIELD => Some(FieldType::String),
            VERSION_FIELD => Some(FieldType::Number),
            other => self.get(other).map(|f| f.kind),
        }
    }

    fn expect_object<'a>(&self, body: &'a Value) -> Result<&'a Map<String, Value>, StoreError> {
        body.as_object().ok_or_else(|| StoreError::Cast {
            kind: "Object",
            value: body.to_string(),
            path: self.model.to_string(),
        })
    }

    fn finish(
        &self,
        out: Map<String, Value>,
        errors: BTreeMap<String, String>,
    ) -> Result<Map<String, Value>, StoreError> {
        if errors.is_empty() {
            Ok(out)
        } else {
            Err(StoreError::Validation { model: self.model.to_string(), errors })
        }
    }
}

fn cast_to(kind: FieldType, value: Value, path: &str) -> Result<Value, StoreError> {
    let fail = |value: &Value| StoreError::Cast {
        kind: kind.name(),
        value: match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        path: path.to_string(),
    };

    match (kind, value) {
        (_, Value::Null) => Ok(Value::Null),
        (FieldType::String, Value::String(s)) => Ok(Value::String(s)),
        (FieldType::String, v @ (Value::Number(_) | Value::Bool(_))) => Ok(Value::String(v.to_string())),
        (FieldType::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
        (FieldType::Boolean, Value::String(s)) => match s.as_str() {
            "true" | "1" | "yes" => Ok(Value::Bool(true)),
            "false" | "0" | "no" => Ok(Value::Bool(false)),
            _ => Err(fail(&Value::String(s))),
        },
        (FieldType::Boolean, Value::Number(n)) => match n.as_f64() {
            Some(x) if x == 1.0 => Ok(Value::Bool(true)),
            Some(x) if x == 0.0 => Ok(Value::Bool(false)),
            _ => Err(fail(&Value::Number(n))),
        },
        (FieldType::Number, Value::Number(n)) => Ok(Value::Number(n)),
        (FieldType::Number, Value::String(s)) => parse_number(s.trim()).ok_or_else(|| fail(&Value::String(s))),
        (FieldType::Id, Value::String(s)) => Uuid::parse_str(&s)
            .map(|id| Value::String(id.to_string()))
            .map_err(|_| fail(&Value::String(s))),
        (_, other) => Err(fail(&other)),
    }
}

fn parse_number(s: &str) -> Option<Value> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::from(i));
    }
    s.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{CompareOp, Condition};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new("Account", "accounts")
            .field(FieldDef::string("name").required().trim())
            .field(FieldDef::string("email").required().unique())
            .field(FieldDef::string("tier").one_of(&["free", "paid"]).default_value("free"))
            .field(FieldDef::boolean("active").default_value(true))
            .field(FieldDef::number("age"))
            .field(FieldDef::string("secret").hidden())
    }

    #[test]
    fn insert_applies_defaults_trims_and_drops_unknown_keys() {
        let out = schema()
            .prepare_insert(&json!({
                "name": "  Ann  ",
                "email": "ann@example.com",
                "_id": "caller-chosen",
                "nickname": "x"
            }))
            .unwrap();
        assert_eq!(out["name"], json!("Ann"));
        assert_eq!(out["tier"], json!("free"));
        assert_eq!(out["active"], json!(true));
        assert!(out.get("_id").is_none());
        assert!(out.get("nickname").is_none());
    }

    #[test]
    fn insert_collects_every_violation() {
        let err = schema().prepare_insert(&json!({"tier": "gold", "age": "old"})).unwrap_err();
        match err {
            StoreError::Validation { model, errors } => {
                assert_eq!(model, "Account");
                assert_eq!(errors["name"], "Path `name` is required.");
                assert_eq!(errors["email"], "Path `email` is required.");
                assert_eq!(errors["tier"], "`gold` is not a valid enum value for path `tier`.");
                assert!(errors["age"].starts_with("Cast to Number failed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn update_validates_only_touched_paths() {
        let mut set = Map::new();
        set.insert("name".into(), json!("Bob"));
        set.insert("unknown".into(), json!(1));
        let out = schema().prepare_update(&set).unwrap();
        assert_eq!(out.len(), 1);

        let mut set = Map::new();
        set.insert("name".into(), json!(""));
        assert!(matches!(
            schema().prepare_update(&set),
            Err(StoreError::Validation { .. })
        ));
    }

    #[test]
    fn upsert_insert_seeds_from_criteria_and_defaults() {
        let mut seed = Map::new();
        seed.insert("email".into(), json!("x@example.com"));
        let mut set = Map::new();
        set.insert("tier".into(), json!("paid"));
        let out = schema().prepare_upsert_insert(seed, &set).unwrap();
        assert_eq!(out["email"], json!("x@example.com"));
        assert_eq!(out["tier"], json!("paid"));
        assert_eq!(out["active"], json!(true));
        assert!(out.get("name").is_none());
    }

    #[test]
    fn filter_values_are_cast_to_field_types() {
        let filter = Filter::new()
            .eq("active", "false")
            .compare("age", CompareOp::Gte, "21")
            .eq("name", "Ann");
        let cast = schema().cast_filter(filter).unwrap();
        let clauses: Vec<_> = cast.clauses().collect();
        assert_eq!(clauses[0].1, &[Condition::Equals(json!(false))]);
        assert_eq!(clauses[1].1, &[Condition::Compare(CompareOp::Gte, json!(21))]);
        assert_eq!(clauses[2].1, &[Condition::Equals(json!("Ann"))]);

        let bad = Filter::new().eq("_id", "nope");
        assert!(matches!(schema().cast_filter(bad), Err(StoreError::Cast { .. })));
    }

    #[test]
    fn render_hides_write_only_fields() {
        let fields = schema()
            .prepare_insert(&json!({"name": "A", "email": "a@b.co", "secret": "s3"}))
            .unwrap();
        let doc = Document::new(fields);
        let rendered = schema().render(&doc, &Projection::default());
        assert!(rendered.get("secret").is_none());
        assert!(rendered.get("__v").is_none());
        assert_eq!(rendered["_id"], json!(doc.id.to_string()));
    }
}
