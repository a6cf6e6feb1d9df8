use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::error::StoreError;

pub const ID_FIELD: &str = "_id";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const UPDATED_AT_FIELD: &str = "updatedAt";
pub const VERSION_FIELD: &str = "__v";

/// Fields owned by the store; never taken from request input.
pub const SYSTEM_FIELDS: [&str; 4] = [ID_FIELD, CREATED_AT_FIELD, UPDATED_AT_FIELD, VERSION_FIELD];

/// A stored record: identifier, timestamps, version and its named fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: Uuid,
    pub fields: Map<String, Value>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(fields: Map<String, Value>) -> Self {
        let now = now();
        Self {
            id: Uuid::new_v4(),
            fields,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the given fields and bump `updatedAt`.
    pub fn apply_set(&mut self, set: &Map<String, Value>) {
        for (k, v) in set {
            self.fields.insert(k.clone(), v.clone());
        }
        self.updated_at = now();
    }

    /// Flat view with the system fields merged in, as clients and filters see it.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = self.fields.clone();
        map.insert(ID_FIELD.into(), Value::String(self.id.to_string()));
        map.insert(CREATED_AT_FIELD.into(), Value::String(format_timestamp(&self.created_at)));
        map.insert(UPDATED_AT_FIELD.into(), Value::String(format_timestamp(&self.updated_at)));
        map.insert(VERSION_FIELD.into(), Value::from(self.version));
        map
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.to_map())
    }

    /// Inverse of [`Document::to_value`]; used to read rows rendered by the database.
    pub fn from_value(value: Value) -> Result<Self, StoreError> {
        let mut map = match value {
            Value::Object(map) => map,
            other => return Err(cast_error("Object", &other, "document")),
        };
        let id = match map.remove(ID_FIELD) {
            Some(Value::String(s)) => parse_id(&s)?,
            other => return Err(cast_error("Uuid", &other.unwrap_or(Value::Null), ID_FIELD)),
        };
        let created_at = take_timestamp(&mut map, CREATED_AT_FIELD)?;
        let updated_at = take_timestamp(&mut map, UPDATED_AT_FIELD)?;
        let version = map.remove(VERSION_FIELD).and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(Self { id, fields: map, version, created_at, updated_at })
    }
}

/// Current time at the millisecond precision used on the wire.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_id(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|_| StoreError::Cast {
        kind: "Uuid",
        value: raw.to_string(),
        path: ID_FIELD.to_string(),
    })
}

fn take_timestamp(map: &mut Map<String, Value>, field: &str) -> Result<DateTime<Utc>, StoreError> {
    match map.remove(field) {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| cast_error("Date", &Value::String(s), field)),
        other => Err(cast_error("Date", &other.unwrap_or(Value::Null), field)),
    }
}

fn cast_error(kind: &'static str, value: &Value, path: &str) -> StoreError {
    StoreError::Cast { kind, value: value.to_string(), path: path.to_string() }
}
